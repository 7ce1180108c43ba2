//! Facial analysis: image decoding, attribute classification and head pose
//! merged into the response record.

use crate::{
    attributes::{AttributeClassifier, Emotion, EmotionScores, FaceAttributes, NUM_EMOTIONS},
    constants::EMOTION_DECIMALS,
    face_detection::{FaceDetection, FaceDetector},
    pose_estimation::{HeadPose, PoseEstimator},
    utils::{image_conversion::crop_to_box, round_to},
    Error, Result,
};
use base64::Engine as _;
use image::RgbImage;
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::sync::Arc;

/// Placeholder reported for attributes that could not be determined
pub const UNKNOWN: &str = "unknown";

/// Message reported when no face is found before analysis
pub const NO_FACE_MESSAGE: &str = "No face detected in the image";

/// Decode uploaded image bytes into an RGB image
///
/// # Errors
///
/// Returns `Error::DecodeError` if the bytes are not a supported image
pub fn decode_image(bytes: &[u8]) -> Result<RgbImage> {
    image::load_from_memory(bytes)
        .map(|image| image.to_rgb8())
        .map_err(|e| Error::DecodeError(e.to_string()))
}

/// Decode a base64 image, optionally wrapped in a `data:image/...;base64,` URL
///
/// # Errors
///
/// Returns `Error::DecodeError` if the payload is not valid base64 or not an image
pub fn decode_base64_image(data: &str) -> Result<RgbImage> {
    let payload = if data.starts_with("data:image") {
        data.split(',')
            .nth(1)
            .ok_or_else(|| Error::DecodeError("data URL has no payload".to_string()))?
    } else {
        data
    };

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| Error::DecodeError(format!("invalid base64: {e}")))?;
    decode_image(&bytes)
}

/// Emotion probabilities as fractions, serialized in class order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetailedEmotions([f64; NUM_EMOTIONS]);

impl DetailedEmotions {
    /// Convert percentages to fractions rounded to three decimals
    #[must_use]
    pub fn from_scores(scores: &EmotionScores) -> Self {
        let mut fractions = [0.0; NUM_EMOTIONS];
        for (fraction, (_, score)) in fractions.iter_mut().zip(scores.iter()) {
            *fraction = round_to(score / 100.0, EMOTION_DECIMALS);
        }
        Self(fractions)
    }

    /// Fraction for one emotion
    #[must_use]
    pub fn get(&self, emotion: Emotion) -> f64 {
        self.0[emotion as usize]
    }
}

impl Serialize for DetailedEmotions {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(NUM_EMOTIONS))?;
        for (emotion, fraction) in Emotion::ALL.iter().zip(self.0.iter()) {
            map.serialize_entry(emotion.as_str(), fraction)?;
        }
        map.end()
    }
}

/// Analysis result for one image
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct AnalysisRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub age: String,
    pub gender: String,
    pub emotion: String,
    pub angle: HeadPose,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detailed_emotions: Option<DetailedEmotions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

impl AnalysisRecord {
    /// Successful analysis
    #[must_use]
    pub fn from_attributes(attributes: &FaceAttributes, angle: HeadPose) -> Self {
        let (dominant, score) = attributes.emotions.dominant();
        Self {
            error: None,
            age: format!("{} years", attributes.age),
            gender: attributes.gender.as_str().to_string(),
            emotion: format!("{dominant} ({:.2})", score / 100.0),
            angle,
            detailed_emotions: Some(DetailedEmotions::from_scores(&attributes.emotions)),
            image_index: None,
            filename: None,
        }
    }

    /// Record with every attribute unknown and the zero pose
    #[must_use]
    pub fn unknown(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            age: UNKNOWN.to_string(),
            gender: UNKNOWN.to_string(),
            emotion: UNKNOWN.to_string(),
            angle: HeadPose::ZERO,
            detailed_emotions: None,
            image_index: None,
            filename: None,
        }
    }

    /// Record for an image without a face
    #[must_use]
    pub fn no_face() -> Self {
        Self::unknown(NO_FACE_MESSAGE)
    }

    /// Tag the record with its position in a batch upload
    #[must_use]
    pub fn with_upload(mut self, index: usize, filename: impl Into<String>) -> Self {
        self.image_index = Some(index);
        self.filename = Some(filename.into());
        self
    }

    /// Whether analysis succeeded
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// One file of a batch upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upload {
    /// Client supplied file name; empty when no file was chosen
    pub filename: String,
    /// Raw file contents
    pub data: Vec<u8>,
}

/// Response of a batch analysis
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct BatchResponse {
    pub total_images: usize,
    pub processed_images: usize,
    pub results: Vec<AnalysisRecord>,
}

/// Runs face detection, attribute classification and head pose estimation
pub struct FacialAnalyzer {
    face_detector: Arc<dyn FaceDetector>,
    pose_estimator: PoseEstimator,
    classifier: Arc<dyn AttributeClassifier>,
}

impl FacialAnalyzer {
    /// Create an analyzer from its collaborators
    #[must_use]
    pub fn new(
        face_detector: Arc<dyn FaceDetector>,
        pose_estimator: PoseEstimator,
        classifier: Arc<dyn AttributeClassifier>,
    ) -> Self {
        Self {
            face_detector,
            pose_estimator,
            classifier,
        }
    }

    /// Whether the image contains at least one face
    ///
    /// # Errors
    ///
    /// Returns an error if face detection fails
    pub fn has_face(&self, image: &RgbImage) -> Result<bool> {
        Ok(!self.face_detector.detect(image)?.is_empty())
    }

    /// Single image analysis: report a missing face, otherwise analyze it
    ///
    /// # Errors
    ///
    /// Returns an error if face detection fails
    pub fn analyze(&self, image: &RgbImage) -> Result<AnalysisRecord> {
        let detections = self.face_detector.detect(image)?;
        if detections.is_empty() {
            log::info!("No face detected in {}x{} image", image.width(), image.height());
            return Ok(AnalysisRecord::no_face());
        }
        Ok(self.analyze_detected(image, &detections))
    }

    /// Classify the first face (or the whole image when there is none) and
    /// attach the head pose. Failures become an unknown record.
    pub fn analyze_face(&self, image: &RgbImage) -> AnalysisRecord {
        match self.face_detector.detect(image) {
            Ok(detections) => self.analyze_detected(image, &detections),
            Err(e) => {
                log::error!("Error in facial analysis: {e}");
                AnalysisRecord::unknown(format!("Analysis failed: {e}"))
            }
        }
    }

    fn analyze_detected(&self, image: &RgbImage, detections: &[FaceDetection]) -> AnalysisRecord {
        let face = detections
            .first()
            .and_then(|detection| crop_to_box(image, &detection.bbox).ok());

        let attributes = match self.classifier.classify(face.as_ref().unwrap_or(image)) {
            Ok(attributes) => attributes,
            Err(e) => {
                log::error!("Error in facial analysis: {e}");
                return AnalysisRecord::unknown(format!("Analysis failed: {e}"));
            }
        };

        let angle = self.pose_estimator.estimate_pose(image);
        AnalysisRecord::from_attributes(&attributes, angle)
    }

    /// Analyze every upload; files without a name or that fail to decode
    /// are skipped
    pub fn analyze_batch(&self, uploads: &[Upload]) -> BatchResponse {
        let mut results = Vec::new();

        for (index, upload) in uploads.iter().enumerate() {
            if upload.filename.is_empty() {
                continue;
            }
            match decode_image(&upload.data) {
                Ok(image) => {
                    results.push(self.analyze_face(&image).with_upload(index, upload.filename.as_str()));
                }
                Err(e) => log::warn!("Skipping {}: {e}", upload.filename),
            }
        }

        log::info!("Batch analyzed {} of {} images", results.len(), uploads.len());
        BatchResponse {
            total_images: uploads.len(),
            processed_images: results.len(),
            results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::Gender;
    use base64::Engine as _;
    use image::{ImageFormat, Rgb};
    use std::io::Cursor;

    fn png_bytes() -> Vec<u8> {
        let image = RgbImage::from_pixel(8, 6, Rgb([200, 100, 50]));
        let mut bytes = Vec::new();
        image.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
        bytes
    }

    fn attributes() -> FaceAttributes {
        FaceAttributes {
            age: 31,
            gender: Gender::Woman,
            emotions: EmotionScores::from_percentages([1.0, 0.5, 2.0, 87.3456, 4.0, 3.0, 2.1544]),
        }
    }

    #[test]
    fn test_decode_image() {
        let image = decode_image(&png_bytes()).unwrap();
        assert_eq!(image.dimensions(), (8, 6));
        assert_eq!(image.get_pixel(0, 0), &Rgb([200, 100, 50]));
        assert!(matches!(decode_image(b"not an image"), Err(Error::DecodeError(_))));
    }

    #[test]
    fn test_decode_base64_image() {
        let encoded = base64::engine::general_purpose::STANDARD.encode(png_bytes());
        assert_eq!(decode_base64_image(&encoded).unwrap().dimensions(), (8, 6));

        let data_url = format!("data:image/png;base64,{encoded}");
        assert_eq!(decode_base64_image(&data_url).unwrap().dimensions(), (8, 6));

        assert!(matches!(decode_base64_image("!!!"), Err(Error::DecodeError(_))));
        assert!(matches!(decode_base64_image("data:image/png;base64"), Err(Error::DecodeError(_))));
    }

    #[test]
    fn test_record_from_attributes() {
        let record = AnalysisRecord::from_attributes(&attributes(), HeadPose::from_degrees(1.0, -2.5, 0.0));
        assert_eq!(record.age, "31 years");
        assert_eq!(record.gender, "woman");
        assert_eq!(record.emotion, "happy (0.87)");
        assert!(record.is_success());

        let detailed = record.detailed_emotions.unwrap();
        assert_eq!(detailed.get(Emotion::Happy), 0.873);
        assert_eq!(detailed.get(Emotion::Neutral), 0.022);
    }

    #[test]
    fn test_record_json_shape() {
        let record = AnalysisRecord::from_attributes(&attributes(), HeadPose::ZERO);
        let value = serde_json::to_value(&record).unwrap();

        assert!(value.get("error").is_none());
        assert!(value.get("image_index").is_none());
        assert_eq!(value["angle"]["pitch"], 0.0);

        let text = serde_json::to_string(&record.detailed_emotions).unwrap();
        let angry = text.find("angry").unwrap();
        let neutral = text.find("neutral").unwrap();
        assert!(angry < neutral);
    }

    #[test]
    fn test_unknown_record() {
        let record = AnalysisRecord::no_face().with_upload(2, "a.jpg");
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["error"], NO_FACE_MESSAGE);
        assert_eq!(value["age"], UNKNOWN);
        assert_eq!(value["gender"], UNKNOWN);
        assert_eq!(value["emotion"], UNKNOWN);
        assert_eq!(value["angle"]["yaw"], 0.0);
        assert_eq!(value["image_index"], 2);
        assert_eq!(value["filename"], "a.jpg");
        assert!(value.get("detailed_emotions").is_none());
    }
}
