use crate::{
    inference_service::{ClassifyError, Prediction},
    model_service::ModelService,
    server::SharedState,
};
use axum::{
    body::Bytes,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::instrument;

pub const IMAGE_FIELD: &str = "image";

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("Invalid multipart request: {0}")]
    Rejection(#[from] MultipartRejection),
    #[error("Malformed multipart request: {0}")]
    Multipart(#[from] MultipartError),
    #[error("Missing `image` form field")]
    MissingImage,
    #[error(transparent)]
    Classify(#[from] ClassifyError),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl PredictError {
    fn status(&self) -> StatusCode {
        match self {
            PredictError::Rejection(rejection) => rejection.status(),
            PredictError::Multipart(err) => err.status(),
            PredictError::MissingImage => StatusCode::BAD_REQUEST,
            PredictError::Classify(ClassifyError::Decode(_)) => StatusCode::BAD_REQUEST,
            PredictError::Classify(ClassifyError::InputShape(_)) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            PredictError::Classify(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PredictError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Prediction failed: {}", self);
        } else {
            tracing::warn!("Rejected prediction request: {}", self);
        }

        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[instrument(skip(state, multipart))]
pub async fn predict<M: ModelService>(
    State(state): State<SharedState<M>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<Prediction>, PredictError> {
    let mut multipart = multipart?;
    let image_data = read_image_field(&mut multipart).await?;
    let prediction = state.inference_service.classify(image_data).await?;

    Ok(Json(prediction))
}

async fn read_image_field(multipart: &mut Multipart) -> Result<Bytes, PredictError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() == Some(IMAGE_FIELD) {
            return Ok(field.bytes().await?);
        }
    }

    Err(PredictError::MissingImage)
}
