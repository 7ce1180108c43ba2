//! Facial emotion, age/gender and head pose analysis behind an HTTP API.
//!
//! The analysis pipeline consists of:
//! 1. Face detection to locate faces in the image
//! 2. Age, gender and emotion classification of the first face
//! 3. Face-mesh landmark detection for six pose landmarks
//! 4. Head pose estimation with a Perspective-n-Point solve, reported as
//!    pitch, yaw and roll in degrees
//!
//! The detectors and the classifier sit behind traits. ONNX Runtime backed
//! implementations are available with the `onnx` feature; everything else
//! builds and runs without native dependencies.
//!
//! # Examples
//!
//! ## Head pose from landmarks
//!
//! ```
//! use facial_emotion_api::{
//!     pnp::{CameraModel, PnpSolver},
//!     pose_estimation::{model_points, solve_head_pose, LandmarkSet},
//! };
//! use nalgebra::{Point2, Point3};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Landmarks of a face looking straight at a 640x480 camera
//! let camera = CameraModel::from_image_size(640, 480);
//! let mut pixels = [Point2::origin(); 6];
//! for (pixel, point) in pixels.iter_mut().zip(model_points()) {
//!     let in_camera = Point3::new(point.x, point.y, point.z + 1000.0);
//!     *pixel = camera.project(&in_camera).ok_or("behind camera")?;
//! }
//!
//! let pose = solve_head_pose(&LandmarkSet::new(pixels), 640, 480, &PnpSolver::default())?;
//! assert_eq!((pose.pitch, pose.yaw, pose.roll), (0.0, 0.0, 0.0));
//! # Ok(())
//! # }
//! ```
//!
//! ## Injecting a landmark detector
//!
//! ```
//! use facial_emotion_api::{
//!     mark_detection::{FaceLandmarks, LandmarkDetector},
//!     pose_estimation::{HeadPose, PoseEstimator},
//! };
//! use image::RgbImage;
//! use std::sync::Arc;
//!
//! struct NoFaces;
//!
//! impl LandmarkDetector for NoFaces {
//!     fn detect(&self, _image: &RgbImage) -> facial_emotion_api::Result<Option<FaceLandmarks>> {
//!         Ok(None)
//!     }
//! }
//!
//! let estimator = PoseEstimator::new(Arc::new(NoFaces));
//! assert_eq!(estimator.estimate_pose(&RgbImage::new(64, 64)), HeadPose::ZERO);
//! ```

/// Face detection module for finding faces in images
pub mod face_detection;

/// Facial landmark detection module for the face-mesh points
pub mod mark_detection;

/// Perspective-n-Point solver
pub mod pnp;

/// Head pose estimation module
pub mod pose_estimation;

/// Age, gender and emotion classification
pub mod attributes;

/// Analysis pipeline and response records
pub mod analysis;

/// HTTP API
pub mod server;

/// Utility functions for image processing and coordinate transformations
pub mod utils;

/// Error types and result handling
pub mod error;

/// Constants used throughout the application
pub mod constants;

/// Configuration management
pub mod config;

pub use error::{Error, Result};
