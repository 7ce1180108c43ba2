//! Configuration management for the facial analysis service

use crate::{
    constants::{DEFAULT_MAX_UPLOAD_BYTES, DEFAULT_REFINE_ITERATIONS},
    Error, Result,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Model configuration
    pub models: ModelConfig,

    /// Face detection configuration
    pub face_detection: FaceDetectionConfig,

    /// Head pose configuration
    pub pose: PoseConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Largest accepted request body in bytes
    pub max_upload_bytes: usize,
}

/// Model file paths configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Path to face detection ONNX model
    pub face_detector: PathBuf,

    /// Path to face-mesh landmarks ONNX model
    pub face_landmarks: PathBuf,

    /// Path to emotion classification ONNX model
    pub emotion: PathBuf,

    /// Path to gender/age ONNX model
    pub age_gender: PathBuf,
}

/// Face detection parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceDetectionConfig {
    /// Confidence threshold for face detection (0.0-1.0)
    pub confidence_threshold: f32,

    /// IOU threshold for non-maximum suppression (0.0-1.0)
    pub iou_threshold: f32,

    /// Face region expansion factor for the landmark crop
    pub bbox_expansion: f32,
}

/// Head pose parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoseConfig {
    /// Levenberg-Marquardt iterations after the linear solve (0 disables)
    pub refine_iterations: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            face_detector: PathBuf::from("assets/face_detector.onnx"),
            face_landmarks: PathBuf::from("assets/face_mesh.onnx"),
            emotion: PathBuf::from("assets/emotion.onnx"),
            age_gender: PathBuf::from("assets/genderage.onnx"),
        }
    }
}

impl Default for FaceDetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.5,
            iou_threshold: 0.4,
            bbox_expansion: 0.25,
        }
    }
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self {
            refine_iterations: DEFAULT_REFINE_ITERATIONS,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        log::info!("Loading configuration from {}", path.display());
        let content = std::fs::read_to_string(path)?;

        serde_yaml::from_str(&content).map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))
    }

    /// Save configuration to a YAML file
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate value ranges
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` describing the first invalid setting
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::ConfigError("Port must be greater than 0".to_string()));
        }
        if self.server.max_upload_bytes == 0 {
            return Err(Error::ConfigError(
                "Upload limit must be greater than 0".to_string(),
            ));
        }

        // Validate thresholds
        if !(0.0..=1.0).contains(&self.face_detection.confidence_threshold) {
            return Err(Error::ConfigError(
                "Confidence threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.face_detection.iou_threshold) {
            return Err(Error::ConfigError(
                "IOU threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.face_detection.bbox_expansion) {
            return Err(Error::ConfigError(
                "Bounding box expansion must be between 0.0 and 1.0".to_string(),
            ));
        }

        Ok(())
    }

    /// Check that every model file exists
    ///
    /// # Errors
    ///
    /// Returns `Error::ConfigError` naming the first missing model
    pub fn validate_model_paths(&self) -> Result<()> {
        let models = [
            ("Face detector", &self.models.face_detector),
            ("Face landmarks", &self.models.face_landmarks),
            ("Emotion", &self.models.emotion),
            ("Age/gender", &self.models.age_gender),
        ];

        for (name, path) in models {
            if !path.exists() {
                return Err(Error::ConfigError(format!(
                    "{name} model not found: {}",
                    path.display()
                )));
            }
        }

        Ok(())
    }
}

/// Example configuration file content
pub const EXAMPLE_CONFIG: &str = r#"# Facial Emotion Detection API Configuration

# HTTP server
server:
  host: "0.0.0.0"
  port: 5000
  max_upload_bytes: 16777216

# Model paths
models:
  face_detector: "assets/face_detector.onnx"
  face_landmarks: "assets/face_mesh.onnx"
  emotion: "assets/emotion.onnx"
  age_gender: "assets/genderage.onnx"

# Face detection parameters
face_detection:
  confidence_threshold: 0.5
  iou_threshold: 0.4
  bbox_expansion: 0.25

# Head pose
pose:
  refine_iterations: 20
"#;
