use crate::{model_service::ModelService, server::SharedState};
use axum::{extract::State, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct ClassLabelsResponse {
    class_labels: Vec<String>,
}

pub async fn class_labels<M: ModelService>(
    State(state): State<SharedState<M>>,
) -> Json<ClassLabelsResponse> {
    Json(ClassLabelsResponse {
        class_labels: state.inference_service.class_labels().as_slice().to_vec(),
    })
}
