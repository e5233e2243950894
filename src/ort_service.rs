use crate::{
    config::{ModelConfig, Validatable},
    model_service::{InputShape, ModelService, ModelServiceError},
};
use ndarray::Array4;
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

/// Pool of ONNX Runtime sessions over the same model file.
///
/// Sessions are handed out round-robin and each is guarded by its own mutex,
/// so at most `num_instances` forward passes run concurrently.
#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    input_shape: InputShape,
}

impl OrtModelService {
    pub fn new(model_config: &ModelConfig) -> Result<Self, ModelServiceError> {
        model_config
            .validate_input_shape()
            .map_err(ModelServiceError::Load)?;
        model_config.validate().map_err(ModelServiceError::Load)?;

        let num_instances = model_config.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_config.get_path())?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()
            .map_err(|e| ModelServiceError::Load(e.to_string()))?;

        tracing::info!(
            "Created {} ONNX sessions from {:?}",
            num_instances,
            model_config.get_path()
        );

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
            input_shape: InputShape {
                height: model_config.input_height,
                width: model_config.input_width,
                channels: model_config.channels,
            },
        })
    }
}

impl ModelService for OrtModelService {
    fn input_shape(&self) -> InputShape {
        self.input_shape
    }

    fn run_inference(&self, batch: Array4<f32>) -> Result<Vec<f32>, ModelServiceError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index]
            .lock()
            .map_err(|e| ModelServiceError::Poisoned(e.to_string()))?;

        tracing::debug!("Handling request with session {}", index);
        let batch = batch.as_standard_layout();

        let tensor_ref = TensorRef::from_array_view(batch.view())
            .map_err(|e| ModelServiceError::Inference(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| ModelServiceError::Inference(e.to_string()))?;

        let (shape, data) = outputs[0].try_extract_tensor::<f32>().map_err(|e| {
            ModelServiceError::Inference(format!("failed to extract tensor: {}", e))
        })?;
        tracing::debug!("Model output shape: {:?}", shape);

        let scores = data.to_vec();
        Ok(scores)
    }
}
