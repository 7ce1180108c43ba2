//! Error types for the facial analysis service.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    /// File I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Image decoding or processing failed
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// YAML (de)serialization failed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// `ONNX` Runtime inference failed
    #[cfg(feature = "onnx")]
    #[error("ONNX Runtime error: {0}")]
    OnnxRuntime(#[from] ort::OrtError),

    /// Invalid input parameters provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Model loading or inference error
    #[error("Model error: {0}")]
    ModelError(String),

    /// Model input configuration error
    #[error("Model input error: {0}")]
    ModelInputError(String),

    /// Model output processing error
    #[error("Model output error: {0}")]
    ModelOutputError(String),

    /// Model data shape or format error
    #[error("Model data format error: {0}")]
    ModelDataFormatError(String),

    /// Perspective-n-Point solve failed
    #[error("Pose error: {0}")]
    PoseError(String),

    /// The uploaded payload is not a decodable image
    #[error("Failed to decode image: {0}")]
    DecodeError(String),

    /// Request carried no image
    #[error("{0}")]
    NoImage(String),

    /// Request body exceeded the configured limit
    #[error("File too large. Maximum size is {0}MB")]
    PayloadTooLarge(usize),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Convenience type alias for Results with our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// HTTP status reported to clients for this error
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoImage(_) | Self::DecodeError(_) | Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            log::error!("Request failed: {self}");
        } else {
            log::warn!("Rejected request: {self}");
        }

        let message = match &self {
            Self::DecodeError(_) => "Failed to decode image".to_string(),
            other => other.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
