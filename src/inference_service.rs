use crate::{
    image_utils::{self, ImageError},
    model_service::{ModelService, ModelServiceError},
    state::ClassLabels,
};
use axum::body::Bytes;
use ndarray::{Array, Array4, ArrayD};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("Image could not be decoded: {0}")]
    Decode(String),
    #[error("Image does not match the model input: {0}")]
    InputShape(String),
    #[error(transparent)]
    Model(#[from] ModelServiceError),
    #[error("Model returned no usable scores")]
    EmptyOutput,
    #[error("Model returned {outputs} scores but {labels} class labels are configured")]
    LabelMismatch { outputs: usize, labels: usize },
    #[error("Inference worker failed: {0}")]
    Worker(String),
}

impl From<ImageError> for ClassifyError {
    fn from(err: ImageError) -> Self {
        match err {
            ImageError::Decode(msg) => ClassifyError::Decode(msg),
            other => ClassifyError::InputShape(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub predicted_class_name: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InferenceOptions {
    pub resize_input: bool,
    pub apply_softmax: bool,
}

pub struct InferenceService<M: ModelService> {
    model_service: Arc<M>,
    class_labels: Arc<ClassLabels>,
    options: InferenceOptions,
}

impl<M: ModelService> Clone for InferenceService<M> {
    fn clone(&self) -> Self {
        Self {
            model_service: self.model_service.clone(),
            class_labels: self.class_labels.clone(),
            options: self.options,
        }
    }
}

impl<M: ModelService> InferenceService<M> {
    pub fn new(model_service: M, class_labels: ClassLabels, options: InferenceOptions) -> Self {
        Self {
            model_service: Arc::new(model_service),
            class_labels: Arc::new(class_labels),
            options,
        }
    }

    pub fn class_labels(&self) -> &ClassLabels {
        &self.class_labels
    }

    /// Runs one forward pass on a blank image and checks the model produces
    /// exactly one score per class label.
    pub fn verify_output_dimension(&self) -> Result<(), ClassifyError> {
        let batch = Array::zeros(self.model_service.input_shape().as_batched());
        let scores = self.model_service.run_inference(batch)?;

        if scores.len() != self.class_labels.len() {
            return Err(ClassifyError::LabelMismatch {
                outputs: scores.len(),
                labels: self.class_labels.len(),
            });
        }

        tracing::info!(
            "Model output matches {} class labels",
            self.class_labels.len()
        );
        Ok(())
    }

    /// Decodes and classifies on a blocking worker thread.
    #[instrument(skip(self, image_data), fields(bytes = image_data.len()))]
    pub async fn classify(&self, image_data: Bytes) -> Result<Prediction, ClassifyError> {
        let service = self.clone();
        let prediction =
            tokio::task::spawn_blocking(move || service.classify_blocking(&image_data))
                .await
                .map_err(|e| ClassifyError::Worker(e.to_string()))??;

        tracing::debug!(
            "Predicted {} with confidence {:.2}",
            prediction.predicted_class_name,
            prediction.confidence
        );
        Ok(prediction)
    }

    pub fn classify_blocking(&self, image_data: &[u8]) -> Result<Prediction, ClassifyError> {
        let shape = self.model_service.input_shape();
        let batch = image_utils::preprocess(image_data, &shape, self.options.resize_input)?;

        self.classify_batch(batch)
    }

    /// Classifies an already decoded `(H, W, C)` pixel array.
    pub fn classify_pixels(&self, pixels: ArrayD<f32>) -> Result<Prediction, ClassifyError> {
        let batch = image_utils::add_batch_dimension(pixels, &self.model_service.input_shape())?;

        self.classify_batch(batch)
    }

    fn classify_batch(&self, batch: Array4<f32>) -> Result<Prediction, ClassifyError> {
        let scores = self.model_service.run_inference(batch)?;

        self.prediction_from_scores(&scores)
    }

    fn prediction_from_scores(&self, scores: &[f32]) -> Result<Prediction, ClassifyError> {
        if scores.len() != self.class_labels.len() {
            return Err(ClassifyError::LabelMismatch {
                outputs: scores.len(),
                labels: self.class_labels.len(),
            });
        }

        let probabilities;
        let scores = if self.options.apply_softmax {
            probabilities = softmax(scores);
            probabilities.as_slice()
        } else {
            scores
        };

        let (index, score) = argmax(scores).ok_or(ClassifyError::EmptyOutput)?;
        let predicted_class_name = self
            .class_labels
            .get(index)
            .ok_or(ClassifyError::LabelMismatch {
                outputs: scores.len(),
                labels: self.class_labels.len(),
            })?
            .to_string();

        Ok(Prediction {
            predicted_class_name,
            confidence: f64::from(score * 100.0),
        })
    }
}

/// Index and value of the largest score. The first maximum wins on ties and
/// NaN never wins.
pub fn argmax(scores: &[f32]) -> Option<(usize, f32)> {
    scores
        .iter()
        .copied()
        .enumerate()
        .filter(|(_, value)| !value.is_nan())
        .fold(None, |best, (index, value)| match best {
            Some((_, best_value)) if value <= best_value => best,
            _ => Some((index, value)),
        })
}

/// Numerically stable softmax. Any `+inf` logits share the whole mass
/// equally and every other class gets zero.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let infinite = logits
        .iter()
        .filter(|v| v.is_infinite() && v.is_sign_positive())
        .count();
    if infinite > 0 {
        let share = 1.0 / infinite as f32;
        return logits
            .iter()
            .map(|v| if *v == f32::INFINITY { share } else { 0.0 })
            .collect();
    }

    let max = logits
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();

    exps.into_iter().map(|v| v / sum).collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{image_utils::tests::red_png, model_service::InputShape};
    use ndarray::IxDyn;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) struct MockModelService {
        pub scores: Vec<f32>,
        pub shape: InputShape,
        pub calls: AtomicUsize,
    }

    impl MockModelService {
        pub(crate) fn new(scores: Vec<f32>) -> Self {
            Self {
                scores,
                shape: InputShape {
                    height: 4,
                    width: 4,
                    channels: 3,
                },
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ModelService for MockModelService {
        fn input_shape(&self) -> InputShape {
            self.shape
        }

        fn run_inference(&self, batch: Array4<f32>) -> Result<Vec<f32>, ModelServiceError> {
            assert_eq!(batch.shape(), &self.shape.as_batched()[..]);
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.scores.clone())
        }
    }

    pub(crate) fn potato_labels() -> ClassLabels {
        ClassLabels::new(vec![
            "Early Blight".to_string(),
            "Late Blight".to_string(),
            "Healthy".to_string(),
        ])
        .unwrap()
    }

    fn service(scores: Vec<f32>) -> InferenceService<MockModelService> {
        InferenceService::new(
            MockModelService::new(scores),
            potato_labels(),
            InferenceOptions::default(),
        )
    }

    #[test]
    fn test_argmax_picks_largest_score() {
        let prediction = service(vec![0.1, 0.7, 0.2])
            .classify_blocking(&red_png(4, 4))
            .unwrap();

        assert_eq!(prediction.predicted_class_name, "Late Blight");
        assert!((prediction.confidence - 70.0).abs() < 1e-4);
    }

    #[test]
    fn test_argmax_ties_go_to_first_maximum() {
        assert_eq!(argmax(&[0.4, 0.4, 0.2]), Some((0, 0.4)));
        assert_eq!(argmax(&[f32::NAN, 0.3, 0.6]), Some((2, 0.6)));
        assert_eq!(argmax(&[f32::NAN]), None);
        assert_eq!(argmax(&[]), None);
    }

    #[test]
    fn test_repeated_calls_are_deterministic() {
        let service = service(vec![0.05, 0.15, 0.8]);
        let image = red_png(4, 4);

        let first = service.classify_blocking(&image).unwrap();
        let second = service.classify_blocking(&image).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.predicted_class_name, "Healthy");
        assert!(service.class_labels().contains(&first.predicted_class_name));
        assert!((0.0..=100.0).contains(&first.confidence));
    }

    #[test]
    fn test_label_count_mismatch_is_an_error() {
        let result = service(vec![0.5, 0.5]).classify_blocking(&red_png(4, 4));

        assert!(matches!(
            result,
            Err(ClassifyError::LabelMismatch {
                outputs: 2,
                labels: 3
            })
        ));
    }

    #[test]
    fn test_all_nan_output_is_an_error() {
        let result = service(vec![f32::NAN; 3]).classify_blocking(&red_png(4, 4));

        assert!(matches!(result, Err(ClassifyError::EmptyOutput)));
    }

    #[test]
    fn test_softmax_applied_to_logits() {
        let service = InferenceService::new(
            MockModelService::new(vec![1.0, 3.0, 0.5]),
            potato_labels(),
            InferenceOptions {
                resize_input: false,
                apply_softmax: true,
            },
        );

        let prediction = service.classify_blocking(&red_png(4, 4)).unwrap();

        assert_eq!(prediction.predicted_class_name, "Late Blight");
        assert!(prediction.confidence > 33.3 && prediction.confidence <= 100.0);
    }

    #[test]
    fn test_softmax_gives_infinite_logits_the_mass() {
        assert_eq!(softmax(&[1.0, f32::INFINITY, 0.5]), vec![0.0, 1.0, 0.0]);
        assert_eq!(
            softmax(&[f32::INFINITY, 2.0, f32::INFINITY]),
            vec![0.5, 0.0, 0.5]
        );

        let service = InferenceService::new(
            MockModelService::new(vec![1.0, f32::INFINITY, 0.5]),
            potato_labels(),
            InferenceOptions {
                resize_input: false,
                apply_softmax: true,
            },
        );
        let prediction = service.classify_blocking(&red_png(4, 4)).unwrap();

        assert_eq!(prediction.predicted_class_name, "Late Blight");
        assert_eq!(prediction.confidence, 100.0);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let probabilities = softmax(&[2.0, 1.0, 0.1]);
        let sum: f32 = probabilities.iter().sum();

        assert!((sum - 1.0).abs() < 1e-6);
        assert!(probabilities[0] > probabilities[1]);
    }

    #[test]
    fn test_malformed_image_is_a_decode_error() {
        let service = service(vec![0.1, 0.7, 0.2]);

        let result = service.classify_blocking(b"not an image at all");

        assert!(matches!(result, Err(ClassifyError::Decode(_))));
        assert_eq!(service.model_service.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wrong_image_size_is_an_input_shape_error() {
        let result = service(vec![0.1, 0.7, 0.2]).classify_blocking(&red_png(16, 9));

        assert!(matches!(result, Err(ClassifyError::InputShape(_))));
    }

    #[test]
    fn test_classify_pixels_batch_policy() {
        let service = service(vec![0.1, 0.7, 0.2]);

        let single = ArrayD::<f32>::zeros(IxDyn(&[4, 4, 3]));
        assert!(service.classify_pixels(single).is_ok());

        let batched = ArrayD::<f32>::zeros(IxDyn(&[1, 4, 4, 3]));
        assert!(matches!(
            service.classify_pixels(batched),
            Err(ClassifyError::InputShape(_))
        ));
    }

    #[test]
    fn test_verify_output_dimension() {
        assert!(service(vec![0.1, 0.7, 0.2]).verify_output_dimension().is_ok());
        assert!(matches!(
            service(vec![0.1, 0.9]).verify_output_dimension(),
            Err(ClassifyError::LabelMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_classify_on_blocking_worker() -> Result<(), Box<dyn std::error::Error>> {
        let service = service(vec![0.6, 0.3, 0.1]);

        let prediction = service.classify(Bytes::from(red_png(4, 4))).await?;

        assert_eq!(prediction.predicted_class_name, "Early Blight");
        assert_eq!(service.model_service.calls.load(Ordering::SeqCst), 1);

        Ok(())
    }
}
