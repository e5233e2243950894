use axum::response::Json;
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthStatus {
    status: &'static str,
}

pub async fn healthcheck() -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "Available",
    })
}
