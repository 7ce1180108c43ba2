//! Face detection: the detector interface and SCRFD output decoding.

use crate::{utils::safe_cast::f32_to_i32, Error, Result};
use image::RgbImage;
use nalgebra::Point2;
use ndarray::{Array2, Array3};

#[cfg(feature = "onnx")]
pub use onnx::ScrfdDetector;

/// Number of keypoints predicted per face by keypoint-enabled models
pub const NUM_KEYPOINTS: usize = 5;

/// Axis-aligned box in image pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    /// Left edge
    pub x: i32,
    /// Top edge
    pub y: i32,
    /// Width in pixels
    pub width: i32,
    /// Height in pixels
    pub height: i32,
}

impl BoundingBox {
    /// Create a box from its top-left corner and size
    #[must_use]
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// Create a box from floating point corners
    ///
    /// # Errors
    ///
    /// Returns an error if a coordinate is not finite or out of i32 range
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Result<Self> {
        Ok(Self {
            x: f32_to_i32(x1)?,
            y: f32_to_i32(y1)?,
            width: f32_to_i32(x2 - x1)?,
            height: f32_to_i32(y2 - y1)?,
        })
    }

    /// Area in square pixels (zero for degenerate boxes)
    #[must_use]
    pub fn area(&self) -> i64 {
        i64::from(self.width.max(0)) * i64::from(self.height.max(0))
    }
}

/// Face detection result
#[derive(Debug, Clone, PartialEq)]
pub struct FaceDetection {
    /// Bounding box of the detected face
    pub bbox: BoundingBox,
    /// Confidence score of the detection
    pub score: f32,
    /// Optional keypoints (5 facial landmarks)
    pub keypoints: Option<Vec<Point2<f32>>>,
}

/// Locates faces in an image.
///
/// Detections are returned best first. An image without faces yields an
/// empty vector, not an error.
pub trait FaceDetector: Send + Sync {
    /// Detect faces in an RGB image
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails
    fn detect(&self, image: &RgbImage) -> Result<Vec<FaceDetection>>;
}

/// Output layout of an SCRFD model, derived from its number of outputs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrfdLayout {
    /// Feature map strides
    pub strides: Vec<usize>,
    /// Anchors per feature map cell
    pub num_anchors: usize,
    /// Distance between score, box and keypoint output groups
    pub offset: usize,
    /// Whether keypoint outputs are present
    pub with_kps: bool,
}

impl ScrfdLayout {
    /// Determine the layout from the model's output count
    #[must_use]
    pub fn from_output_count(num_outputs: usize) -> Self {
        let (offset, strides, num_anchors, with_kps) = match num_outputs {
            6 => (3, vec![8, 16, 32], 2, false),
            9 => (3, vec![8, 16, 32], 2, true),
            10 => (5, vec![8, 16, 32, 64, 128], 1, false),
            15 => (5, vec![8, 16, 32, 64, 128], 1, true),
            _ => {
                log::warn!("Unknown model configuration with {num_outputs} outputs, using defaults");
                (3, vec![8, 16, 32], 2, false)
            }
        };
        Self {
            strides,
            num_anchors,
            offset,
            with_kps,
        }
    }

    /// Number of outputs this layout reads
    #[must_use]
    pub fn output_count(&self) -> usize {
        if self.with_kps {
            self.offset * 3
        } else {
            self.offset * 2
        }
    }
}

/// Generate anchor centers for a `height` x `width` feature map
#[allow(clippy::cast_precision_loss)] // Feature map coordinates are small
#[must_use]
pub fn anchor_centers(height: usize, width: usize, stride: usize, num_anchors: usize) -> Array2<f32> {
    let num_anchors = num_anchors.max(1);
    let mut centers = Array2::zeros((height * width * num_anchors, 2));

    let mut row = 0;
    for y in 0..height {
        for x in 0..width {
            for _ in 0..num_anchors {
                centers[[row, 0]] = (x * stride) as f32;
                centers[[row, 1]] = (y * stride) as f32;
                row += 1;
            }
        }
    }

    centers
}

/// Convert per-anchor `(left, top, right, bottom)` distances to corner boxes
#[must_use]
pub fn distance_to_bbox(points: &Array2<f32>, distances: &Array2<f32>) -> Array2<f32> {
    let n_boxes = points.nrows().min(distances.nrows());
    let mut boxes = Array2::zeros((n_boxes, 4));

    for i in 0..n_boxes {
        let cx = points[[i, 0]];
        let cy = points[[i, 1]];
        boxes[[i, 0]] = cx - distances[[i, 0]];
        boxes[[i, 1]] = cy - distances[[i, 1]];
        boxes[[i, 2]] = cx + distances[[i, 2]];
        boxes[[i, 3]] = cy + distances[[i, 3]];
    }

    boxes
}

/// Convert per-anchor keypoint offsets to absolute keypoints
#[must_use]
pub fn distance_to_kps(points: &Array2<f32>, distances: &[f32], num_kps: usize) -> Array3<f32> {
    let n_points = points.nrows();
    let mut kpss = Array3::zeros((n_points, num_kps, 2));

    for i in 0..n_points {
        let cx = points[[i, 0]];
        let cy = points[[i, 1]];

        for j in 0..num_kps {
            let idx = i * (num_kps * 2) + j * 2;
            if idx + 1 >= distances.len() {
                break;
            }
            kpss[[i, j, 0]] = cx + distances[idx];
            kpss[[i, j, 1]] = cy + distances[idx + 1];
        }
    }

    kpss
}

/// Greedy non-maximum suppression over corner boxes.
///
/// `order` lists box indices best first; the kept indices are returned in
/// the same order.
#[must_use]
pub fn nms(bboxes: &Array2<f32>, order: &[usize], iou_threshold: f32) -> Vec<usize> {
    let mut keep = Vec::new();
    let mut order = order.to_vec();

    while let Some((&i, rest)) = order.split_first() {
        keep.push(i);

        let x1_i = bboxes[[i, 0]];
        let y1_i = bboxes[[i, 1]];
        let x2_i = bboxes[[i, 2]];
        let y2_i = bboxes[[i, 3]];
        let area_i = (x2_i - x1_i + 1.0) * (y2_i - y1_i + 1.0);

        order = rest
            .iter()
            .copied()
            .filter(|&j| {
                let x1_j = bboxes[[j, 0]];
                let y1_j = bboxes[[j, 1]];
                let x2_j = bboxes[[j, 2]];
                let y2_j = bboxes[[j, 3]];
                let area_j = (x2_j - x1_j + 1.0) * (y2_j - y1_j + 1.0);

                let w = (x2_i.min(x2_j) - x1_i.max(x1_j) + 1.0).max(0.0);
                let h = (y2_i.min(y2_j) - y1_i.max(y1_j) + 1.0).max(0.0);
                let inter = w * h;

                inter / (area_i + area_j - inter) <= iou_threshold
            })
            .collect();
    }

    keep
}

struct Candidate {
    score: f32,
    corners: [f32; 4],
    keypoints: Option<Vec<Point2<f32>>>,
}

/// Decode raw SCRFD outputs into detections in source-image pixels.
///
/// `outputs` are the flattened model outputs in model order, `input_size` is
/// the network input `(width, height)` and `det_scale` the factor applied
/// when the source image was letterboxed into it.
///
/// # Errors
///
/// Returns an error if:
/// - fewer outputs are given than the layout needs
/// - an output is shorter than its feature map
#[allow(clippy::cast_precision_loss)] // Strides are small
pub fn decode_outputs(
    layout: &ScrfdLayout,
    outputs: &[Vec<f32>],
    input_size: (usize, usize),
    conf_threshold: f32,
    nms_threshold: f32,
    det_scale: f32,
) -> Result<Vec<FaceDetection>> {
    if outputs.len() < layout.output_count() {
        return Err(Error::ModelOutputError(format!(
            "Expected {} outputs, got {}",
            layout.output_count(),
            outputs.len()
        )));
    }
    if det_scale <= 0.0 || !det_scale.is_finite() {
        return Err(Error::InvalidInput(format!("Invalid detection scale {det_scale}")));
    }

    let (input_width, input_height) = input_size;
    let mut candidates = Vec::new();

    for (idx, &stride) in layout.strides.iter().enumerate() {
        let centers = anchor_centers(input_height / stride, input_width / stride, stride, layout.num_anchors);
        let n = centers.nrows();

        let scores = &outputs[idx];
        let bbox_raw = &outputs[idx + layout.offset];
        if scores.len() < n || bbox_raw.len() < n * 4 {
            return Err(Error::ModelDataFormatError(format!(
                "Stride {stride}: expected {n} anchors, got {} scores and {} box values",
                scores.len(),
                bbox_raw.len()
            )));
        }

        let distances = Array2::from_shape_vec(
            (n, 4),
            bbox_raw[..n * 4].iter().map(|&d| d * stride as f32).collect(),
        )
        .map_err(|e| Error::ModelDataFormatError(format!("Failed to reshape bbox: {e}")))?;
        let boxes = distance_to_bbox(&centers, &distances);

        let kpss = if layout.with_kps {
            let kps_raw = &outputs[idx + layout.offset * 2];
            if kps_raw.len() < n * NUM_KEYPOINTS * 2 {
                return Err(Error::ModelDataFormatError(format!(
                    "Stride {stride}: keypoint output too short ({} values)",
                    kps_raw.len()
                )));
            }
            let scaled: Vec<f32> = kps_raw[..n * NUM_KEYPOINTS * 2]
                .iter()
                .map(|&d| d * stride as f32)
                .collect();
            Some(distance_to_kps(&centers, &scaled, NUM_KEYPOINTS))
        } else {
            None
        };

        for (i, &score) in scores.iter().take(n).enumerate() {
            if score < conf_threshold {
                continue;
            }
            let keypoints = kpss.as_ref().map(|k| {
                (0..NUM_KEYPOINTS)
                    .map(|j| Point2::new(k[[i, j, 0]] / det_scale, k[[i, j, 1]] / det_scale))
                    .collect()
            });
            candidates.push(Candidate {
                score,
                corners: [
                    boxes[[i, 0]] / det_scale,
                    boxes[[i, 1]] / det_scale,
                    boxes[[i, 2]] / det_scale,
                    boxes[[i, 3]] / det_scale,
                ],
                keypoints,
            });
        }
    }

    candidates.sort_by(|a, b| b.score.total_cmp(&a.score));

    let corners = Array2::from_shape_vec(
        (candidates.len(), 4),
        candidates.iter().flat_map(|c| c.corners).collect(),
    )
    .map_err(|e| Error::ModelDataFormatError(format!("Failed to collect bboxes: {e}")))?;
    let order: Vec<usize> = (0..candidates.len()).collect();
    let keep = nms(&corners, &order, nms_threshold);

    keep.into_iter()
        .map(|i| {
            let candidate = &candidates[i];
            let [x1, y1, x2, y2] = candidate.corners;
            Ok(FaceDetection {
                bbox: BoundingBox::from_corners(x1, y1, x2, y2)?,
                score: candidate.score,
                keypoints: candidate.keypoints.clone(),
            })
        })
        .collect()
}

#[cfg(feature = "onnx")]
mod onnx {
    use super::{decode_outputs, FaceDetection, FaceDetector, ScrfdLayout};
    use crate::{
        constants::{IMAGE_NORMALIZATION_OFFSET, IMAGE_NORMALIZATION_SCALE},
        utils::image_conversion::{letterbox, rgb_to_nchw},
        Error, Result,
    };
    use image::RgbImage;
    use ndarray::CowArray;
    use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    /// Default SCRFD input size
    const DEFAULT_INPUT_SIZE: u32 = 640;

    /// SCRFD face detector using `ONNX` Runtime
    pub struct ScrfdDetector {
        session: Mutex<Session>,
        input_size: (u32, u32),
        layout: ScrfdLayout,
        conf_threshold: f32,
        nms_threshold: f32,
    }

    impl ScrfdDetector {
        /// Create a new face detector from an `ONNX` model file
        ///
        /// # Errors
        ///
        /// Returns an error if:
        /// - The ONNX model file cannot be loaded
        /// - The model has no inputs
        pub fn new<P: AsRef<Path>>(model_path: P, conf_threshold: f32, nms_threshold: f32) -> Result<Self> {
            log::info!(
                "Initializing ScrfdDetector with model: {}",
                model_path.as_ref().display()
            );
            let environment = Arc::new(
                Environment::builder()
                    .with_name("face_detector")
                    .with_log_level(ort::LoggingLevel::Warning)
                    .build()?,
            );

            let session = SessionBuilder::new(&environment)?
                .with_optimization_level(GraphOptimizationLevel::Level3)?
                .with_model_from_file(model_path)?;

            let input_meta = session
                .inputs
                .first()
                .ok_or_else(|| Error::ModelInputError("Model has no inputs".to_string()))?;

            // [batch, channels, height, width]
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let input_size = if input_meta.dimensions.len() >= 4 {
                let height = input_meta.dimensions[2].map_or(DEFAULT_INPUT_SIZE, |d| d as u32);
                let width = input_meta.dimensions[3].map_or(DEFAULT_INPUT_SIZE, |d| d as u32);
                (width, height)
            } else {
                (DEFAULT_INPUT_SIZE, DEFAULT_INPUT_SIZE)
            };

            let layout = ScrfdLayout::from_output_count(session.outputs.len());
            log::debug!("SCRFD input {input_size:?}, layout {layout:?}");

            Ok(Self {
                session: Mutex::new(session),
                input_size,
                layout,
                conf_threshold,
                nms_threshold,
            })
        }

        fn forward(&self, image: &RgbImage) -> Result<Vec<Vec<f32>>> {
            let tensor = rgb_to_nchw(image, IMAGE_NORMALIZATION_OFFSET, IMAGE_NORMALIZATION_SCALE)?;
            let session = self
                .session
                .lock()
                .map_err(|_| Error::ModelError("Face detector session lock poisoned".to_string()))?;

            let cow_array = CowArray::from(tensor.into_dyn());
            let input_tensor = Value::from_array(session.allocator(), &cow_array)?;
            let outputs = session.run(vec![input_tensor])?;

            outputs
                .iter()
                .map(|output| {
                    let tensor = output.try_extract::<f32>()?;
                    let values: Vec<f32> = tensor.view().iter().copied().collect();
                    Ok(values)
                })
                .collect()
        }
    }

    impl FaceDetector for ScrfdDetector {
        fn detect(&self, image: &RgbImage) -> Result<Vec<FaceDetection>> {
            let (input_width, input_height) = self.input_size;
            let (padded, det_scale) = letterbox(image, input_width, input_height)?;
            let outputs = self.forward(&padded)?;

            decode_outputs(
                &self.layout,
                &outputs,
                (input_width as usize, input_height as usize),
                self.conf_threshold,
                self.nms_threshold,
                det_scale,
            )
        }
    }
}
