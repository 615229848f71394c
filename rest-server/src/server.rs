use anyhow::{Result, anyhow};
use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use axum_server::tls_rustls::RustlsConfig;
use feast_serving_core::error::{ErrorKind, ServingError};
use feast_serving_core::jobs::{BatchJob, JobId};
use feast_serving_core::model::{
    GetBatchFeaturesRequest, GetOnlineFeaturesRequest, GetStagingLocationRequest,
    LoadBatchFeaturesRequest,
};
use feast_serving_core::serving::ServingService;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::net::ToSocketAddrs;
use std::sync::Arc;

#[derive(Clone)]
pub struct FeastServer {
    service: Arc<dyn ServingService>,
}

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls_enabled: bool,
    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6566,
            tls_enabled: false,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }
}

#[derive(Deserialize)]
struct JobRequest {
    job_id: JobId,
}

#[derive(Serialize)]
struct JobResponse {
    job: BatchJob,
}

#[derive(Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
}

pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidArgument => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::FailedPrecondition => StatusCode::PRECONDITION_FAILED,
        ErrorKind::ResourceExhausted => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        ErrorKind::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<ServingError> for AppError {
    fn from(err: ServingError) -> Self {
        let status = status_for(err.kind());
        if status.is_server_error() && err.kind() != ErrorKind::Unimplemented {
            tracing::warn!(kind = %err.kind(), "Request failed: {}", err.message());
        }
        Self::new(status, err.kind().to_string(), err.message())
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(
            rejection.status(),
            ErrorKind::InvalidArgument.to_string(),
            rejection.body_text(),
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        let body = Json(ErrorResponse {
            code: self.code,
            message: self.message,
        });
        (status, body).into_response()
    }
}

/// Builds the HTTP routes for `service`. `/metrics` is only mounted when `metrics_enabled`.
pub fn router(service: Arc<dyn ServingService>, metrics_enabled: bool) -> Router {
    let server = FeastServer { service };
    let mut app = Router::new()
        .route("/serving-type", get(handle_serving_info))
        .route("/get-online-features", post(handle_online_features))
        .route("/get-batch-features", post(handle_batch_features))
        .route("/reload-job-status", post(handle_reload_job_status))
        .route(
            "/get-batch-features-from-completed-job",
            post(handle_completed_job),
        )
        .route("/get-staging-location", post(handle_staging_location))
        .route("/load-batch-features", post(handle_load_batch_features))
        .route("/health", get(|| async { StatusCode::OK }))
        .with_state(server);
    let trace = tower_http::trace::TraceLayer::new_for_http();
    app = app.layer(trace);
    if metrics_enabled {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        app = app
            .route("/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer)
    }
    app
}

pub async fn start_server(
    server_config: ServerConfig,
    service: Arc<dyn ServingService>,
    metrics_enabled: bool,
    shutdown_handler: axum_server::Handle,
) -> Result<()> {
    let app = router(service, metrics_enabled);

    let addr: SocketAddr = format!("{}:{}", server_config.host, server_config.port)
        .to_socket_addrs()?
        .next()
        .ok_or(anyhow!("Cannot resolve host"))?;

    tracing::info!(
        "Server listening on {}:{}",
        server_config.host,
        server_config.port
    );
    if server_config.tls_enabled {
        let cert_path = server_config
            .tls_cert_path
            .ok_or(anyhow!("TLS is enabled but cert path is not provided"))?;
        let key_path = server_config
            .tls_key_path
            .ok_or(anyhow!("TLS is enabled but key path is not provided"))?;
        let rustls_config = RustlsConfig::from_pem_file(cert_path, key_path)
            .await
            .map_err(|e| anyhow!("Failed to load TLS config: {}", e))?;
        axum_server::bind_rustls(addr, rustls_config)
            .handle(shutdown_handler)
            .serve(app.into_make_service())
            .await?;
    } else {
        axum_server::bind(addr)
            .handle(shutdown_handler)
            .serve(app.into_make_service())
            .await?;
    }
    Ok(())
}

async fn handle_serving_info(
    State(server): State<FeastServer>,
) -> Result<impl IntoResponse, AppError> {
    Ok(Json(server.service.get_feast_serving_info().await?))
}

async fn handle_online_features(
    State(server): State<FeastServer>,
    payload: Result<Json<GetOnlineFeaturesRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(request) = payload?;
    Ok(Json(server.service.get_online_features(request).await?))
}

async fn handle_batch_features(
    State(server): State<FeastServer>,
    payload: Result<Json<GetBatchFeaturesRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(request) = payload?;
    let job = server.service.get_batch_features(request).await?;
    Ok(Json(JobResponse { job }))
}

async fn handle_reload_job_status(
    State(server): State<FeastServer>,
    payload: Result<Json<JobRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(request) = payload?;
    let job = server.service.reload_job_status(request.job_id).await?;
    Ok(Json(JobResponse { job }))
}

async fn handle_completed_job(
    State(server): State<FeastServer>,
    payload: Result<Json<JobRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(request) = payload?;
    Ok(Json(
        server
            .service
            .get_batch_features_from_completed_job(request.job_id)
            .await?,
    ))
}

async fn handle_staging_location(
    State(server): State<FeastServer>,
    payload: Result<Json<GetStagingLocationRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(request) = payload?;
    Ok(Json(server.service.get_staging_location(request).await?))
}

async fn handle_load_batch_features(
    State(server): State<FeastServer>,
    payload: Result<Json<LoadBatchFeaturesRequest>, JsonRejection>,
) -> Result<impl IntoResponse, AppError> {
    let Json(request) = payload?;
    let job = server.service.load_batch_features(request).await?;
    Ok(Json(JobResponse { job }))
}
