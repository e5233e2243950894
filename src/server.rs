use crate::{
    config::Config,
    inference_service::{InferenceOptions, InferenceService},
    model_service::{ModelService, ModelServiceError},
    ort_service::OrtModelService,
    routes::api_routes,
    state::{ClassLabels, LabelsError},
};
use axum::{
    extract::DefaultBodyLimit,
    http::{header::InvalidHeaderValue, HeaderValue},
    Router,
};
use thiserror::Error;
use tokio::{net::TcpListener, signal};
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to load class labels: {0}")]
    Labels(#[from] LabelsError),
    #[error("Failed to load model: {0}")]
    ModelLoad(String),
    #[error("Invalid CORS origin: {0}")]
    InvalidOrigin(#[from] InvalidHeaderValue),
    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ModelServiceError> for ServerError {
    fn from(err: ModelServiceError) -> Self {
        ServerError::ModelLoad(err.to_string())
    }
}

pub struct SharedState<M: ModelService> {
    pub inference_service: InferenceService<M>,
}

impl<M: ModelService> Clone for SharedState<M> {
    fn clone(&self) -> Self {
        Self {
            inference_service: self.inference_service.clone(),
        }
    }
}

/// The single frontend origin may send credentials; methods and headers are
/// mirrored from the preflight because wildcards are refused with credentials.
fn cors_layer(allowed_origin: &str) -> Result<CorsLayer, ServerError> {
    let origin = HeaderValue::from_str(allowed_origin)?;

    Ok(CorsLayer::new()
        .allow_origin(AllowOrigin::list([origin]))
        .allow_credentials(true)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request()))
}

pub fn build_router<M: ModelService>(
    inference_service: InferenceService<M>,
    config: &Config,
) -> Result<Router, ServerError> {
    let app_state = SharedState { inference_service };

    let router = Router::new()
        .merge(api_routes(&config.server.predict_route()))
        .with_state(app_state)
        .layer(DefaultBodyLimit::max(config.server.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.cors.allowed_origin)?);

    Ok(router)
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new(router: Router, addr: &str) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("Inference service listening on {}", self.listener.local_addr()?);

        let shutdown = async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown")
        };

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}

pub async fn start_server(config: Config) -> Result<(), ServerError> {
    let class_labels = ClassLabels::from_config(&config.labels)?;
    tracing::info!("Loaded class labels: {:?}", class_labels.as_slice());

    let model_service = OrtModelService::new(&config.model)?;
    let inference_service = InferenceService::new(
        model_service,
        class_labels,
        InferenceOptions {
            resize_input: config.model.resize_input,
            apply_softmax: config.model.apply_softmax,
        },
    );

    if config.model.warmup {
        inference_service
            .verify_output_dimension()
            .map_err(|e| ServerError::ModelLoad(e.to_string()))?;
    }

    let router = build_router(inference_service, &config)?;
    let addr = config.server.get_address();
    tracing::info!(
        "Serving predictions on {}{}",
        &addr,
        config.server.predict_route()
    );

    HttpServer::new(router, &addr).await?.run().await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
