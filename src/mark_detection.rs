//! Facial landmark detection: the detector interface and face-mesh decoding.

use crate::{constants::NUM_MESH_LANDMARKS, face_detection::BoundingBox, Error, Result};
use image::RgbImage;
use nalgebra::Point2;

#[cfg(feature = "onnx")]
pub use onnx::MarkDetector;

/// Landmarks of a single face, normalized to `[0, 1]` of the full image
#[derive(Debug, Clone, PartialEq)]
pub struct FaceLandmarks {
    points: Vec<Point2<f32>>,
}

impl FaceLandmarks {
    /// Wrap normalized landmark positions
    #[must_use]
    pub fn new(points: Vec<Point2<f32>>) -> Self {
        Self { points }
    }

    /// Number of landmarks
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether there are no landmarks
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Landmark at a face-mesh index
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Point2<f32>> {
        self.points.get(index)
    }

    /// All landmarks
    #[must_use]
    pub fn points(&self) -> &[Point2<f32>] {
        &self.points
    }
}

/// Locates facial landmarks of the first face in an image.
///
/// Returns `Ok(None)` when the image contains no face.
pub trait LandmarkDetector: Send + Sync {
    /// Detect landmarks
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails
    fn detect(&self, image: &RgbImage) -> Result<Option<FaceLandmarks>>;
}

/// Map face-mesh output back to normalized full-image coordinates.
///
/// `marks` holds `NUM_MESH_LANDMARKS` points as `(x, y, z)` triples (or
/// `(x, y)` pairs) in pixels of the `input_size` square the `crop` was
/// resized to.
///
/// # Errors
///
/// Returns an error if:
/// - the output holds fewer values than the mesh needs
/// - the crop or image is empty
#[allow(clippy::cast_precision_loss)] // Pixel sizes are small
pub fn mesh_output_to_landmarks(
    marks: &[f32],
    crop: &BoundingBox,
    input_size: u32,
    image_width: u32,
    image_height: u32,
) -> Result<FaceLandmarks> {
    let stride = if marks.len() >= NUM_MESH_LANDMARKS * 3 {
        3
    } else if marks.len() >= NUM_MESH_LANDMARKS * 2 {
        2
    } else {
        return Err(Error::ModelOutputError(format!(
            "Expected {NUM_MESH_LANDMARKS} mesh landmarks, got {} values",
            marks.len()
        )));
    };

    if crop.width <= 0 || crop.height <= 0 || input_size == 0 || image_width == 0 || image_height == 0 {
        return Err(Error::InvalidInput(format!(
            "Cannot map landmarks from crop {crop:?} into {image_width}x{image_height}"
        )));
    }

    let scale_x = crop.width as f32 / input_size as f32;
    let scale_y = crop.height as f32 / input_size as f32;
    let image_width = image_width as f32;
    let image_height = image_height as f32;

    let points = marks
        .chunks_exact(stride)
        .take(NUM_MESH_LANDMARKS)
        .map(|mark| {
            let x = crop.x as f32 + mark[0] * scale_x;
            let y = crop.y as f32 + mark[1] * scale_y;
            Point2::new(x / image_width, y / image_height)
        })
        .collect();

    Ok(FaceLandmarks::new(points))
}

#[cfg(feature = "onnx")]
mod onnx {
    use super::{mesh_output_to_landmarks, FaceLandmarks, LandmarkDetector};
    use crate::{
        constants::MESH_INPUT_SIZE,
        face_detection::FaceDetector,
        utils::{
            image_conversion::{crop_to_box, rgb_to_nchw},
            refine_boxes,
            safe_cast::u32_to_i32,
        },
        Error, Result,
    };
    use image::{imageops, imageops::FilterType, RgbImage};
    use ndarray::CowArray;
    use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    /// Face-mesh landmark detector using `ONNX` Runtime
    pub struct MarkDetector {
        face_detector: Arc<dyn FaceDetector>,
        session: Mutex<Session>,
        bbox_expansion: f32,
    }

    impl MarkDetector {
        /// Create a new landmark detector from an `ONNX` model file
        ///
        /// # Errors
        ///
        /// Returns an error if:
        /// - The ONNX model file cannot be loaded
        /// - The model has no outputs
        pub fn new<P: AsRef<Path>>(
            model_path: P,
            face_detector: Arc<dyn FaceDetector>,
            bbox_expansion: f32,
        ) -> Result<Self> {
            log::info!(
                "Initializing MarkDetector with model: {}",
                model_path.as_ref().display()
            );
            let environment = Arc::new(
                Environment::builder()
                    .with_name("mark_detector")
                    .with_log_level(ort::LoggingLevel::Warning)
                    .build()?,
            );

            let session = SessionBuilder::new(&environment)?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_model_from_file(model_path)?;

            if session.outputs.is_empty() {
                return Err(Error::ModelOutputError("Model has no outputs".to_string()));
            }

            Ok(Self {
                face_detector,
                session: Mutex::new(session),
                bbox_expansion,
            })
        }

        fn forward(&self, face: &RgbImage) -> Result<Vec<f32>> {
            let tensor = rgb_to_nchw(face, 0.0, 255.0)?;
            let session = self
                .session
                .lock()
                .map_err(|_| Error::ModelError("Mark detector session lock poisoned".to_string()))?;

            let cow_array = CowArray::from(tensor.into_dyn());
            let input_tensor = Value::from_array(session.allocator(), &cow_array)?;
            let outputs = session.run(vec![input_tensor])?;

            let marks_output = outputs
                .first()
                .ok_or_else(|| Error::ModelOutputError("No output from model".to_string()))?;
            let marks_tensor = marks_output.try_extract::<f32>()?;
            let marks: Vec<f32> = marks_tensor.view().iter().copied().collect();
            Ok(marks)
        }
    }

    impl LandmarkDetector for MarkDetector {
        fn detect(&self, image: &RgbImage) -> Result<Option<FaceLandmarks>> {
            let Some(face) = self.face_detector.detect(image)?.into_iter().next() else {
                return Ok(None);
            };

            let (width, height) = image.dimensions();
            let mut boxes = [face.bbox];
            refine_boxes(&mut boxes, u32_to_i32(width)?, u32_to_i32(height)?, self.bbox_expansion);
            let crop_box = boxes[0];

            let crop = crop_to_box(image, &crop_box)?;
            let resized = imageops::resize(&crop, MESH_INPUT_SIZE, MESH_INPUT_SIZE, FilterType::Triangle);
            let marks = self.forward(&resized)?;

            mesh_output_to_landmarks(&marks, &crop_box, MESH_INPUT_SIZE, width, height).map(Some)
        }
    }
}
