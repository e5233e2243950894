mod image_utils;
mod ort_service;
mod routes;
mod server;

pub mod config;
pub mod inference_service;
pub mod model_service;
pub mod state;

pub use server::{build_router, start_server, ServerError};
