mod health;
mod labels;
pub mod ping;
mod predict;

use crate::{model_service::ModelService, server::SharedState};
use axum::{
    routing::{get, post},
    Router,
};

pub fn api_routes<M: ModelService>(predict_route: &str) -> Router<SharedState<M>> {
    Router::new()
        .route("/ping", get(ping::ping))
        .route("/health", get(health::healthcheck))
        .route("/labels", get(labels::class_labels::<M>))
        .route(predict_route, post(predict::predict::<M>))
}
