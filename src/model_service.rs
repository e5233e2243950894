use ndarray::Array4;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelServiceError {
    #[error("Failed to load model: {0}")]
    Load(String),
    #[error("Session mutex poisoned: {0}")]
    Poisoned(String),
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// Input dimensions the model expects for a single, unbatched image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputShape {
    pub height: u32,
    pub width: u32,
    pub channels: u32,
}

impl InputShape {
    pub fn as_hwc(&self) -> [usize; 3] {
        [
            self.height as usize,
            self.width as usize,
            self.channels as usize,
        ]
    }

    pub fn as_batched(&self) -> [usize; 4] {
        let [h, w, c] = self.as_hwc();
        [1, h, w, c]
    }
}

/// A loaded classification model.
///
/// `run_inference` is blocking; callers are expected to run it off the async
/// executor. It receives a `(1, H, W, C)` batch and returns the score vector
/// for that single image.
pub trait ModelService: Send + Sync + 'static {
    fn input_shape(&self) -> InputShape;

    fn run_inference(&self, batch: Array4<f32>) -> Result<Vec<f32>, ModelServiceError>;
}
