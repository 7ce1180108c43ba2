//! HTTP API: health check, single image and batch analysis.

use crate::{
    analysis::{decode_base64_image, decode_image, AnalysisRecord, BatchResponse, FacialAnalyzer, Upload},
    config::ServerConfig,
    constants::SERVICE_VERSION,
    Error, Result,
};
use axum::{
    extract::{DefaultBodyLimit, FromRequest, Multipart, Request, State},
    http::{header::CONTENT_TYPE, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use image::RgbImage;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

const NO_IMAGE_MESSAGE: &str = "No image provided. Send either 'image' file or 'image_data' base64 string";
const NO_FILE_SELECTED_MESSAGE: &str = "No file selected";
const NO_IMAGES_MESSAGE: &str = "No images provided";
const BYTES_PER_MB: usize = 1024 * 1024;

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    analyzer: Arc<FacialAnalyzer>,
    max_upload_bytes: usize,
}

impl AppState {
    fn too_large(&self) -> Error {
        Error::PayloadTooLarge(self.max_upload_bytes / BYTES_PER_MB)
    }

    fn rejection(&self, status: StatusCode, message: String) -> Error {
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            self.too_large()
        } else {
            Error::InvalidInput(message)
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnalyzeBody {
    image_data: Option<String>,
}

/// Build the API router
pub fn router(analyzer: Arc<FacialAnalyzer>, max_upload_bytes: usize) -> Router {
    let state = AppState {
        analyzer,
        max_upload_bytes,
    };

    Router::new()
        .route("/health", get(health))
        .route("/analyze", post(analyze))
        .route("/batch_analyze", post(batch_analyze))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(middleware::from_fn_with_state(state.clone(), json_payload_too_large))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve the API until the process is stopped
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails
pub async fn serve(analyzer: Arc<FacialAnalyzer>, config: &ServerConfig) -> Result<()> {
    let app = router(analyzer, config.max_upload_bytes);
    let addr = format!("{}:{}", config.host, config.port);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    log::info!("Starting Facial Emotion Detection API on http://{addr}");
    log::info!("  GET  /health - Health check");
    log::info!("  POST /analyze - Single image analysis");
    log::info!("  POST /batch_analyze - Multiple image analysis");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "message": "Facial Emotion Detection API is running",
        "version": SERVICE_VERSION,
    }))
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Endpoint not found" }))).into_response()
}

/// Body limit rejections that escaped the handlers still answer in JSON
async fn json_payload_too_large(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let response = next.run(request).await;
    let is_json = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));

    if response.status() == StatusCode::PAYLOAD_TOO_LARGE && !is_json {
        return state.too_large().into_response();
    }
    response
}

async fn run_analyze(state: &AppState, request: Request) -> Result<AnalysisRecord> {
    let image = read_analyze_image(state, request).await?;
    let analyzer = Arc::clone(&state.analyzer);
    tokio::task::spawn_blocking(move || analyzer.analyze(&image))
        .await
        .map_err(|e| Error::ModelError(format!("analysis task failed: {e}")))?
}

async fn analyze(State(state): State<AppState>, request: Request) -> Response {
    match run_analyze(&state, request).await {
        Ok(record) => Json(record).into_response(),
        Err(e) if e.status_code().is_client_error() => e.into_response(),
        Err(e) => {
            log::error!("Error in analyze: {e}");
            let record = AnalysisRecord::unknown(format!("Internal server error: {e}"));
            (StatusCode::INTERNAL_SERVER_ERROR, Json(record)).into_response()
        }
    }
}

async fn run_batch_analyze(state: &AppState, request: Request) -> Result<BatchResponse> {
    let uploads = read_batch_uploads(state, request).await?;
    let analyzer = Arc::clone(&state.analyzer);
    tokio::task::spawn_blocking(move || analyzer.analyze_batch(&uploads))
        .await
        .map_err(|e| Error::ModelError(format!("batch task failed: {e}")))
}

async fn batch_analyze(State(state): State<AppState>, request: Request) -> Response {
    match run_batch_analyze(&state, request).await {
        Ok(response) => Json(response).into_response(),
        Err(e) if e.status_code().is_client_error() => e.into_response(),
        Err(e) => {
            log::error!("Error in batch_analyze: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": format!("Batch analysis failed: {e}") })),
            )
                .into_response()
        }
    }
}

fn content_type(request: &Request) -> String {
    request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase()
}

async fn read_analyze_image(state: &AppState, request: Request) -> Result<RgbImage> {
    let content_type = content_type(&request);

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, state)
            .await
            .map_err(|e| state.rejection(e.status(), e.body_text()))?;

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| state.rejection(e.status(), e.body_text()))?
        {
            if field.name() != Some("image") {
                continue;
            }
            let Some(file_name) = field.file_name().map(str::to_owned) else {
                continue;
            };
            if file_name.is_empty() {
                return Err(Error::NoImage(NO_FILE_SELECTED_MESSAGE.to_string()));
            }

            let data = field
                .bytes()
                .await
                .map_err(|e| state.rejection(e.status(), e.body_text()))?;
            log::debug!("Received upload {file_name} ({} bytes)", data.len());
            return decode_image(&data);
        }
    } else if content_type.starts_with("application/json") {
        let Json(body) = Json::<AnalyzeBody>::from_request(request, state)
            .await
            .map_err(|e| state.rejection(e.status(), e.body_text()))?;

        if let Some(image_data) = body.image_data {
            return decode_base64_image(&image_data);
        }
    }

    Err(Error::NoImage(NO_IMAGE_MESSAGE.to_string()))
}

async fn read_batch_uploads(state: &AppState, request: Request) -> Result<Vec<Upload>> {
    if !content_type(&request).starts_with("multipart/form-data") {
        return Err(Error::NoImage(NO_IMAGES_MESSAGE.to_string()));
    }

    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(|e| state.rejection(e.status(), e.body_text()))?;

    let mut uploads = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| state.rejection(e.status(), e.body_text()))?
    {
        if field.name() != Some("images") {
            continue;
        }
        let Some(filename) = field.file_name().map(str::to_owned) else {
            continue;
        };
        let data = field
            .bytes()
            .await
            .map_err(|e| state.rejection(e.status(), e.body_text()))?;
        uploads.push(Upload {
            filename,
            data: data.to_vec(),
        });
    }

    if uploads.is_empty() {
        return Err(Error::NoImage(NO_IMAGES_MESSAGE.to_string()));
    }
    Ok(uploads)
}
