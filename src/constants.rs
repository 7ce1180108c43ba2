//! Constants used throughout the application

/// Number of landmarks used for pose estimation
pub const NUM_POSE_LANDMARKS: usize = 6;

/// Number of landmarks produced by the face-mesh model
pub const NUM_MESH_LANDMARKS: usize = 468;

/// Face-mesh indices of the pose landmarks: nose tip, chin, left eye outer
/// corner, right eye outer corner, left mouth corner, right mouth corner
pub const POSE_LANDMARK_INDICES: [usize; NUM_POSE_LANDMARKS] = [1, 152, 33, 263, 61, 291];

/// Canonical 3D head model in millimetres, same order as `POSE_LANDMARK_INDICES`
pub const MODEL_POINTS_3D: [[f64; 3]; NUM_POSE_LANDMARKS] = [
    [0.0, 0.0, 0.0],
    [0.0, -330.0, -65.0],
    [-225.0, 170.0, -135.0],
    [225.0, 170.0, -135.0],
    [-150.0, -150.0, -125.0],
    [150.0, -150.0, -125.0],
];

/// Below this value of `sqrt(R00^2 + R10^2)` the rotation is treated as gimbal locked
pub const SINGULARITY_THRESHOLD: f64 = 1e-6;

/// Decimal places reported for pose angles
pub const ANGLE_DECIMALS: i32 = 1;

/// Decimal places reported for per-emotion probabilities
pub const EMOTION_DECIMALS: i32 = 3;

/// Default number of Levenberg-Marquardt iterations after the linear PnP solve
pub const DEFAULT_REFINE_ITERATIONS: usize = 20;

/// Relative tolerance below which a singular value counts as zero
pub const RANK_TOLERANCE: f64 = 1e-9;

/// Value subtracted from each pixel channel before face detection
pub const IMAGE_NORMALIZATION_OFFSET: f32 = 127.5;

/// Divisor applied to each offset pixel channel before face detection
pub const IMAGE_NORMALIZATION_SCALE: f32 = 128.0;

/// Face-mesh model input size
pub const MESH_INPUT_SIZE: u32 = 192;

/// Emotion model input size (grayscale)
pub const EMOTION_INPUT_SIZE: u32 = 48;

/// Age/gender model input size
pub const AGE_GENDER_INPUT_SIZE: u32 = 96;

/// Default upload limit (16 MiB)
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Service version reported by the health endpoint
pub const SERVICE_VERSION: &str = "1.0.0";
