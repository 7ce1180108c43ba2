//! Age, gender and emotion classification of a face crop.

use crate::{Error, Result};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::fmt;

#[cfg(feature = "onnx")]
pub use onnx::OnnxAttributeClassifier;

/// Number of emotion classes
pub const NUM_EMOTIONS: usize = 7;

/// Emotion classes in model output order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Emotion {
    Angry,
    Disgust,
    Fear,
    Happy,
    Sad,
    Surprise,
    Neutral,
}

impl Emotion {
    /// All emotions in model output order
    pub const ALL: [Self; NUM_EMOTIONS] = [
        Self::Angry,
        Self::Disgust,
        Self::Fear,
        Self::Happy,
        Self::Sad,
        Self::Surprise,
        Self::Neutral,
    ];

    /// Lower-case name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Angry => "angry",
            Self::Disgust => "disgust",
            Self::Fear => "fear",
            Self::Happy => "happy",
            Self::Sad => "sad",
            Self::Surprise => "surprise",
            Self::Neutral => "neutral",
        }
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Apparent gender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Woman,
    Man,
}

impl Gender {
    /// Lower-case name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Woman => "woman",
            Self::Man => "man",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emotion probabilities in percent, indexed like `Emotion::ALL`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmotionScores {
    scores: [f64; NUM_EMOTIONS],
}

impl EmotionScores {
    /// Wrap percentages given in `Emotion::ALL` order
    #[must_use]
    pub fn from_percentages(scores: [f64; NUM_EMOTIONS]) -> Self {
        Self { scores }
    }

    /// Softmax raw model logits into percentages
    ///
    /// # Errors
    ///
    /// Returns an error if there are not exactly seven finite logits
    pub fn from_logits(logits: &[f32]) -> Result<Self> {
        if logits.len() != NUM_EMOTIONS {
            return Err(Error::ModelOutputError(format!(
                "Expected {NUM_EMOTIONS} emotion logits, got {}",
                logits.len()
            )));
        }
        if !logits.iter().all(|v| v.is_finite()) {
            return Err(Error::ModelOutputError("Emotion logits are not finite".to_string()));
        }

        let mut scores = [0.0; NUM_EMOTIONS];
        for (score, p) in scores.iter_mut().zip(softmax(logits)) {
            *score = p * 100.0;
        }
        Ok(Self { scores })
    }

    /// Percentage for one emotion
    #[must_use]
    pub fn get(&self, emotion: Emotion) -> f64 {
        self.scores[emotion as usize]
    }

    /// Highest scoring emotion; ties go to the earlier class
    #[must_use]
    pub fn dominant(&self) -> (Emotion, f64) {
        Emotion::ALL
            .iter()
            .zip(self.scores.iter())
            .fold((Emotion::Angry, f64::NEG_INFINITY), |best, (&emotion, &score)| {
                if score > best.1 {
                    (emotion, score)
                } else {
                    best
                }
            })
    }

    /// `(emotion, percentage)` pairs in class order
    pub fn iter(&self) -> impl Iterator<Item = (Emotion, f64)> + '_ {
        Emotion::ALL.iter().copied().zip(self.scores.iter().copied())
    }
}

/// Classifier output for one face
#[derive(Debug, Clone, PartialEq)]
pub struct FaceAttributes {
    /// Apparent age in years
    pub age: u32,
    /// Apparent gender
    pub gender: Gender,
    /// Emotion probabilities
    pub emotions: EmotionScores,
}

/// Predicts age, gender and emotions for a face crop
pub trait AttributeClassifier: Send + Sync {
    /// Classify a face crop
    ///
    /// # Errors
    ///
    /// Returns an error if inference fails
    fn classify(&self, face: &RgbImage) -> Result<FaceAttributes>;
}

/// Numerically stable softmax
#[must_use]
pub fn softmax(logits: &[f32]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f64> = logits.iter().map(|&v| f64::from(v - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|v| v / sum).collect()
}

/// Decode a gender/age head with outputs `[female, male, age / 100]`
///
/// # Errors
///
/// Returns an error if the output is too short or not finite
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // Age is clamped to 0..=120
pub fn decode_gender_age(output: &[f32]) -> Result<(Gender, u32)> {
    let [female, male, age, ..] = output else {
        return Err(Error::ModelOutputError(format!(
            "Expected 3 gender/age values, got {}",
            output.len()
        )));
    };
    if !female.is_finite() || !male.is_finite() || !age.is_finite() {
        return Err(Error::ModelOutputError("Gender/age output is not finite".to_string()));
    }

    let gender = if male > female { Gender::Man } else { Gender::Woman };
    let age = (age * 100.0).round().clamp(0.0, 120.0) as u32;
    Ok((gender, age))
}

#[cfg(feature = "onnx")]
mod onnx {
    use super::{decode_gender_age, AttributeClassifier, EmotionScores, FaceAttributes};
    use crate::{
        constants::{AGE_GENDER_INPUT_SIZE, EMOTION_INPUT_SIZE},
        utils::image_conversion::{gray_to_nchw, rgb_to_nchw},
        Error, Result,
    };
    use image::{imageops, imageops::FilterType, RgbImage};
    use ndarray::{Array4, CowArray};
    use ort::{Environment, GraphOptimizationLevel, Session, SessionBuilder, Value};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    /// Emotion and gender/age classifier using two `ONNX` models
    pub struct OnnxAttributeClassifier {
        emotion: Mutex<Session>,
        age_gender: Mutex<Session>,
    }

    fn load_session(environment: &Arc<Environment>, model_path: &Path) -> Result<Session> {
        log::info!("Loading attribute model: {}", model_path.display());
        let session = SessionBuilder::new(environment)?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_model_from_file(model_path)?;
        if session.outputs.is_empty() {
            return Err(Error::ModelOutputError(format!(
                "Model {} has no outputs",
                model_path.display()
            )));
        }
        Ok(session)
    }

    fn run(session: &Mutex<Session>, input: Array4<f32>) -> Result<Vec<f32>> {
        let session = session
            .lock()
            .map_err(|_| Error::ModelError("Attribute session lock poisoned".to_string()))?;

        let cow_array = CowArray::from(input.into_dyn());
        let input_tensor = Value::from_array(session.allocator(), &cow_array)?;
        let outputs = session.run(vec![input_tensor])?;

        let output = outputs
            .first()
            .ok_or_else(|| Error::ModelOutputError("No output from model".to_string()))?;
        let tensor = output.try_extract::<f32>()?;
        let values: Vec<f32> = tensor.view().iter().copied().collect();
        Ok(values)
    }

    impl OnnxAttributeClassifier {
        /// Load the emotion and gender/age models
        ///
        /// # Errors
        ///
        /// Returns an error if either model cannot be loaded
        pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(emotion_model: P, age_gender_model: Q) -> Result<Self> {
            let environment = Arc::new(
                Environment::builder()
                    .with_name("attribute_classifier")
                    .with_log_level(ort::LoggingLevel::Warning)
                    .build()?,
            );

            Ok(Self {
                emotion: Mutex::new(load_session(&environment, emotion_model.as_ref())?),
                age_gender: Mutex::new(load_session(&environment, age_gender_model.as_ref())?),
            })
        }
    }

    impl AttributeClassifier for OnnxAttributeClassifier {
        fn classify(&self, face: &RgbImage) -> Result<FaceAttributes> {
            let gray = imageops::grayscale(face);
            let gray = imageops::resize(&gray, EMOTION_INPUT_SIZE, EMOTION_INPUT_SIZE, FilterType::Triangle);
            let logits = run(&self.emotion, gray_to_nchw(&gray)?)?;
            let emotions = EmotionScores::from_logits(&logits)?;

            let resized = imageops::resize(face, AGE_GENDER_INPUT_SIZE, AGE_GENDER_INPUT_SIZE, FilterType::Triangle);
            let output = run(&self.age_gender, rgb_to_nchw(&resized, 0.0, 1.0)?)?;
            let (gender, age) = decode_gender_age(&output)?;

            Ok(FaceAttributes { age, gender, emotions })
        }
    }
}
