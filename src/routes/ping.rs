use axum::response::Json;

pub const ALIVE_MESSAGE: &str = "Hello, I am alive.";

pub async fn ping() -> Json<&'static str> {
    Json(ALIVE_MESSAGE)
}
