//! Head pose estimation from six facial landmarks.
//!
//! The six landmarks are matched against a canonical 3D head, the camera is
//! approximated from the image size, and the Perspective-n-Point solution is
//! decoded into pitch, yaw and roll in degrees.

use crate::{
    constants::{ANGLE_DECIMALS, MODEL_POINTS_3D, NUM_POSE_LANDMARKS, POSE_LANDMARK_INDICES, SINGULARITY_THRESHOLD},
    mark_detection::{FaceLandmarks, LandmarkDetector},
    pnp::{CameraModel, PnpSolver},
    utils::round_to,
    Error, Result,
};
use image::RgbImage;
use nalgebra::{Matrix3, Point2, Point3, Vector3};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Head orientation in degrees, rounded to one decimal
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HeadPose {
    /// Rotation about the camera X axis
    pub pitch: f64,
    /// Rotation about the camera Y axis
    pub yaw: f64,
    /// Rotation about the camera Z axis
    pub roll: f64,
}

impl HeadPose {
    /// The fallback pose reported when estimation fails
    pub const ZERO: Self = Self {
        pitch: 0.0,
        yaw: 0.0,
        roll: 0.0,
    };

    /// Build a pose from raw angles in degrees, applying the reported rounding
    #[must_use]
    pub fn from_degrees(pitch: f64, yaw: f64, roll: f64) -> Self {
        Self {
            pitch: round_to(pitch, ANGLE_DECIMALS),
            yaw: round_to(yaw, ANGLE_DECIMALS),
            roll: round_to(roll, ANGLE_DECIMALS),
        }
    }

    /// Decode a rotation matrix into a rounded pose
    #[must_use]
    pub fn from_rotation(rotation: &Matrix3<f64>) -> Self {
        let angles = rotation_matrix_to_euler(rotation);
        Self::from_degrees(angles.x, angles.y, angles.z)
    }
}

/// What happened during one estimation
#[derive(Debug, Clone, PartialEq)]
pub enum PoseOutcome {
    /// A pose was recovered
    Estimated(HeadPose),
    /// The landmark detector found no face
    NoFace,
    /// The correspondences were insufficient or degenerate
    SolveFailed(String),
    /// Detection failed or the landmarks were malformed
    Failed(String),
}

impl PoseOutcome {
    /// The pose to report; every outcome other than `Estimated` reports zero
    #[must_use]
    pub fn pose(&self) -> HeadPose {
        match self {
            Self::Estimated(pose) => *pose,
            Self::NoFace | Self::SolveFailed(_) | Self::Failed(_) => HeadPose::ZERO,
        }
    }

    /// Short tag for logs
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Estimated(_) => "estimated",
            Self::NoFace => "no_face",
            Self::SolveFailed(_) => "solve_failed",
            Self::Failed(_) => "failed",
        }
    }
}

/// The six pose landmarks in pixel coordinates, in canonical model order
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandmarkSet {
    points: [Point2<f64>; NUM_POSE_LANDMARKS],
}

impl LandmarkSet {
    /// Wrap pixel positions given in canonical model order
    #[must_use]
    pub fn new(points: [Point2<f64>; NUM_POSE_LANDMARKS]) -> Self {
        Self { points }
    }

    /// Build from a slice that must hold exactly six pixel positions
    ///
    /// # Errors
    ///
    /// Returns an error if the slice length is not six
    pub fn from_pixels(points: &[Point2<f64>]) -> Result<Self> {
        let points: [Point2<f64>; NUM_POSE_LANDMARKS] = points.try_into().map_err(|_| {
            Error::InvalidInput(format!(
                "Expected {NUM_POSE_LANDMARKS} landmarks, got {}",
                points.len()
            ))
        })?;
        Ok(Self::new(points))
    }

    /// Pick the pose landmarks out of a face mesh and scale them to whole
    /// pixels, truncating toward zero
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - the mesh does not cover every pose landmark index
    /// - a landmark is not finite
    pub fn from_face_landmarks(landmarks: &FaceLandmarks, width: u32, height: u32) -> Result<Self> {
        let width = f64::from(width);
        let height = f64::from(height);
        let mut points = [Point2::origin(); NUM_POSE_LANDMARKS];

        for (point, &index) in points.iter_mut().zip(POSE_LANDMARK_INDICES.iter()) {
            let mark = landmarks.get(index).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "Landmark {index} missing, detector returned {} points",
                    landmarks.len()
                ))
            })?;
            if !mark.x.is_finite() || !mark.y.is_finite() {
                return Err(Error::InvalidInput(format!("Landmark {index} is not finite")));
            }
            *point = Point2::new(
                (f64::from(mark.x) * width).trunc(),
                (f64::from(mark.y) * height).trunc(),
            );
        }

        Ok(Self::new(points))
    }

    /// Pixel positions
    #[must_use]
    pub fn points(&self) -> &[Point2<f64>] {
        &self.points
    }
}

/// The canonical 3D head model
#[must_use]
pub fn model_points() -> [Point3<f64>; NUM_POSE_LANDMARKS] {
    MODEL_POINTS_3D.map(|[x, y, z]| Point3::new(x, y, z))
}

/// Convert a rotation matrix to `(pitch, yaw, roll)` in degrees
///
/// Near gimbal lock (`sqrt(R00^2 + R10^2)` below `SINGULARITY_THRESHOLD`)
/// roll is fixed at zero.
#[must_use]
pub fn rotation_matrix_to_euler(rotation: &Matrix3<f64>) -> Vector3<f64> {
    let sy = (rotation[(0, 0)].powi(2) + rotation[(1, 0)].powi(2)).sqrt();

    let pitch = (-rotation[(2, 1)]).atan2(rotation[(2, 2)]);
    let yaw = (-rotation[(2, 0)]).atan2(sy);
    let roll = if sy < SINGULARITY_THRESHOLD {
        0.0
    } else {
        rotation[(1, 0)].atan2(rotation[(0, 0)])
    };

    Vector3::new(pitch.to_degrees(), yaw.to_degrees(), roll.to_degrees())
}

/// Solve the head pose for landmarks observed in a `width` x `height` image
///
/// # Errors
///
/// Returns an error if:
/// - the image size is zero
/// - the PnP solve fails
pub fn solve_head_pose(landmarks: &LandmarkSet, width: u32, height: u32, solver: &PnpSolver) -> Result<HeadPose> {
    if width == 0 || height == 0 {
        return Err(Error::InvalidInput(format!("Invalid image dimensions: {width}x{height}")));
    }

    let camera = CameraModel::from_image_size(width, height);
    let solution = solver.solve(&model_points(), landmarks.points(), &camera)?;
    Ok(HeadPose::from_rotation(solution.rotation().matrix()))
}

/// Head pose estimator over an injected landmark detector
pub struct PoseEstimator {
    detector: Arc<dyn LandmarkDetector>,
    solver: PnpSolver,
}

impl PoseEstimator {
    /// Create an estimator with the default solver
    #[must_use]
    pub fn new(detector: Arc<dyn LandmarkDetector>) -> Self {
        Self::with_solver(detector, PnpSolver::default())
    }

    /// Create an estimator with a specific solver
    #[must_use]
    pub fn with_solver(detector: Arc<dyn LandmarkDetector>, solver: PnpSolver) -> Self {
        log::info!(
            "Initializing PoseEstimator ({} refinement iterations)",
            solver.refine_iterations()
        );
        Self { detector, solver }
    }

    /// Estimate the head pose, keeping track of why estimation failed
    pub fn estimate(&self, image: &RgbImage) -> PoseOutcome {
        match self.detector.detect(image) {
            Ok(Some(landmarks)) => {
                let (width, height) = image.dimensions();
                self.estimate_from_landmarks(&landmarks, width, height)
            }
            Ok(None) => PoseOutcome::NoFace,
            Err(e) => PoseOutcome::Failed(format!("landmark detection failed: {e}")),
        }
    }

    /// Estimate from landmarks that were already detected
    pub fn estimate_from_landmarks(&self, landmarks: &FaceLandmarks, width: u32, height: u32) -> PoseOutcome {
        let set = match LandmarkSet::from_face_landmarks(landmarks, width, height) {
            Ok(set) => set,
            Err(e) => return PoseOutcome::Failed(e.to_string()),
        };

        match solve_head_pose(&set, width, height, &self.solver) {
            Ok(pose) => PoseOutcome::Estimated(pose),
            Err(Error::PoseError(reason)) => PoseOutcome::SolveFailed(reason),
            Err(e) => PoseOutcome::Failed(e.to_string()),
        }
    }

    /// Estimate the head pose; any failure yields the zero pose
    pub fn estimate_pose(&self, image: &RgbImage) -> HeadPose {
        let outcome = self.estimate(image);
        match &outcome {
            PoseOutcome::Estimated(pose) => log::debug!("Head pose: {pose:?}"),
            PoseOutcome::NoFace => log::debug!("Head pose: no face detected"),
            PoseOutcome::SolveFailed(reason) | PoseOutcome::Failed(reason) => {
                log::warn!("Head pose {}: {reason}", outcome.label());
            }
        }
        outcome.pose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Rotation3;

    #[test]
    fn test_euler_identity() {
        let angles = rotation_matrix_to_euler(&Matrix3::identity());
        assert!(angles.x.abs() < 1e-12);
        assert!(angles.y.abs() < 1e-12);
        assert!(angles.z.abs() < 1e-12);
    }

    #[test]
    fn test_euler_single_axis() {
        let rz = Rotation3::from_axis_angle(&Vector3::z_axis(), 30f64.to_radians());
        let angles = rotation_matrix_to_euler(rz.matrix());
        assert!((angles.z - 30.0).abs() < 1e-9);
        assert!(angles.x.abs() < 1e-9);
        assert!(angles.y.abs() < 1e-9);

        let ry = Rotation3::from_axis_angle(&Vector3::y_axis(), 20f64.to_radians());
        let angles = rotation_matrix_to_euler(ry.matrix());
        assert!((angles.y - 20.0).abs() < 1e-9);

        let rx = Rotation3::from_axis_angle(&Vector3::x_axis(), 15f64.to_radians());
        let angles = rotation_matrix_to_euler(rx.matrix());
        assert!((angles.x + 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_euler_gimbal_lock_forces_zero_roll() {
        // Rotation of 90 degrees about Y: R00 = R10 = 0
        let rotation = Rotation3::from_axis_angle(&Vector3::y_axis(), 90f64.to_radians());
        let angles = rotation_matrix_to_euler(rotation.matrix());

        assert_eq!(angles.z, 0.0);
        assert!((angles.y - 90.0).abs() < 1e-9);
        assert!(angles.x.abs() < 1e-9);

        let flipped = Matrix3::new(0.0, 0.0, -1.0, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0);
        let angles = rotation_matrix_to_euler(&flipped);
        assert_eq!(angles.z, 0.0);
        assert!((angles.y + 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_euler_just_above_threshold_keeps_roll() {
        let rotation = Matrix3::new(2e-6, 0.0, 1.0, 2e-6, 1.0, 0.0, -1.0, 0.0, 0.0);
        let angles = rotation_matrix_to_euler(&rotation);
        assert!((angles.z - 45.0).abs() < 1e-9);
    }

    #[test]
    fn test_head_pose_rounding() {
        let pose = HeadPose::from_degrees(12.34, 12.35, -12.35);
        assert_eq!(pose.pitch, 12.3);
        assert_eq!(pose.yaw, 12.4);
        assert_eq!(pose.roll, -12.4);
    }

    #[test]
    fn test_outcome_pose_fallbacks() {
        let pose = HeadPose::from_degrees(1.0, 2.0, 3.0);
        assert_eq!(PoseOutcome::Estimated(pose).pose(), pose);
        assert_eq!(PoseOutcome::NoFace.pose(), HeadPose::ZERO);
        assert_eq!(PoseOutcome::SolveFailed("x".into()).pose(), HeadPose::ZERO);
        assert_eq!(PoseOutcome::Failed("x".into()).pose(), HeadPose::ZERO);
        assert_eq!(PoseOutcome::NoFace.label(), "no_face");
    }

    #[test]
    fn test_landmark_set_from_pixels_requires_six() {
        let points = vec![Point2::new(1.0, 2.0); 5];
        assert!(LandmarkSet::from_pixels(&points).is_err());
        let points = vec![Point2::new(1.0, 2.0); 6];
        assert_eq!(LandmarkSet::from_pixels(&points).unwrap().points().len(), 6);
    }

    #[test]
    fn test_landmark_set_from_face_landmarks() {
        let mut points = vec![Point2::new(0.0f32, 0.0); 468];
        points[1] = Point2::new(0.5, 0.25);
        points[291] = Point2::new(0.75, 1.0);
        let landmarks = FaceLandmarks::new(points);

        let set = LandmarkSet::from_face_landmarks(&landmarks, 640, 480).unwrap();
        assert_eq!(set.points()[0], Point2::new(320.0, 120.0));
        assert_eq!(set.points()[5], Point2::new(480.0, 480.0));
    }

    #[test]
    fn test_landmark_set_truncates_to_whole_pixels() {
        let mut points = vec![Point2::new(0.5f32, 0.5); 468];
        points[1] = Point2::new(100.5 / 640.0, 200.75 / 480.0);
        points[152] = Point2::new(319.9 / 640.0, 479.6 / 480.0);
        points[33] = Point2::new(-6.4 / 640.0, -0.3 / 480.0);
        let landmarks = FaceLandmarks::new(points);

        let set = LandmarkSet::from_face_landmarks(&landmarks, 640, 480).unwrap();
        assert_eq!(set.points()[0], Point2::new(100.0, 200.0));
        assert_eq!(set.points()[1], Point2::new(319.0, 479.0));
        assert_eq!(set.points()[2], Point2::new(-6.0, 0.0));
        assert_eq!(set.points()[3], Point2::new(320.0, 240.0));
    }

    #[test]
    fn test_landmark_set_missing_indices() {
        let landmarks = FaceLandmarks::new(vec![Point2::new(0.5f32, 0.5); 200]);
        assert!(LandmarkSet::from_face_landmarks(&landmarks, 640, 480).is_err());

        let mut points = vec![Point2::new(0.5f32, 0.5); 468];
        points[152] = Point2::new(f32::NAN, 0.5);
        assert!(LandmarkSet::from_face_landmarks(&FaceLandmarks::new(points), 640, 480).is_err());
    }

    #[test]
    fn test_solve_head_pose_zero_size() {
        let set = LandmarkSet::new([Point2::new(1.0, 1.0); 6]);
        assert!(matches!(
            solve_head_pose(&set, 0, 480, &PnpSolver::default()),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_model_points_order() {
        let points = model_points();
        assert_eq!(points[0], Point3::origin());
        assert_eq!(points[1], Point3::new(0.0, -330.0, -65.0));
        assert_eq!(points[3].x, -points[2].x);
    }
}
