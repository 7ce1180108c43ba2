//! Perspective-n-Point solver for a calibrated pinhole camera.
//!
//! The pose is initialised with a normalized Direct Linear Transform over all
//! correspondences and then polished with a fixed budget of
//! Levenberg-Marquardt steps on the pixel reprojection error. Both stages are
//! deterministic: identical input always yields an identical pose.

use crate::{
    constants::{DEFAULT_REFINE_ITERATIONS, RANK_TOLERANCE},
    Error, Result,
};
use nalgebra::{
    DMatrix, DVector, Matrix2, Matrix3, Matrix3x4, Matrix4, Point2, Point3, Rotation3, Vector2, Vector3, Vector6,
};

/// Minimum number of correspondences for the linear solve
pub const MIN_CORRESPONDENCES: usize = 6;

/// Relative step for the numeric Jacobian
const JACOBIAN_STEP: f64 = 1e-6;

/// Sum of squared pixel residuals treated as an exact fit
const CONVERGED_COST: f64 = 1e-18;

/// Damping bounds for Levenberg-Marquardt
const LAMBDA_INITIAL: f64 = 1e-3;
const LAMBDA_MIN: f64 = 1e-12;
const LAMBDA_MAX: f64 = 1e10;

/// Pinhole camera intrinsics with Brown-Conrady distortion `(k1, k2, p1, p2)`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraModel {
    /// Focal length along x, in pixels
    pub fx: f64,
    /// Focal length along y, in pixels
    pub fy: f64,
    /// Principal point x
    pub cx: f64,
    /// Principal point y
    pub cy: f64,
    /// Lens distortion coefficients
    pub dist_coeffs: [f64; 4],
}

impl CameraModel {
    /// Approximate camera for an image of the given size.
    ///
    /// The focal length equals the image width, the principal point is the
    /// image centre using integer division, and there is no lens distortion.
    #[must_use]
    pub fn from_image_size(width: u32, height: u32) -> Self {
        let focal_length = f64::from(width);
        Self {
            fx: focal_length,
            fy: focal_length,
            cx: f64::from(width / 2),
            cy: f64::from(height / 2),
            dist_coeffs: [0.0; 4],
        }
    }

    /// The 3x3 intrinsic matrix
    #[must_use]
    pub fn matrix(&self) -> Matrix3<f64> {
        Matrix3::new(self.fx, 0.0, self.cx, 0.0, self.fy, self.cy, 0.0, 0.0, 1.0)
    }

    /// Project a point given in camera coordinates to pixels.
    ///
    /// Returns `None` for points on or behind the image plane.
    #[must_use]
    pub fn project(&self, point: &Point3<f64>) -> Option<Point2<f64>> {
        if point.z <= 0.0 {
            return None;
        }
        let x = point.x / point.z;
        let y = point.y / point.z;

        let [k1, k2, p1, p2] = self.dist_coeffs;
        let r2 = x * x + y * y;
        let radial = 1.0 + k1 * r2 + k2 * r2 * r2;
        let xd = x * radial + 2.0 * p1 * x * y + p2 * (r2 + 2.0 * x * x);
        let yd = y * radial + p1 * (r2 + 2.0 * y * y) + 2.0 * p2 * x * y;

        Some(Point2::new(self.fx * xd + self.cx, self.fy * yd + self.cy))
    }

    /// Pixel to normalized image plane, ignoring distortion
    fn normalize(&self, pixel: &Point2<f64>) -> Point2<f64> {
        Point2::new((pixel.x - self.cx) / self.fx, (pixel.y - self.cy) / self.fy)
    }
}

/// Object pose relative to the camera
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PnpSolution {
    /// Axis-angle rotation (Rodrigues vector), radians
    pub rotation_vector: Vector3<f64>,
    /// Translation in object units
    pub translation: Vector3<f64>,
    /// RMS reprojection error in pixels
    pub reprojection_error: f64,
}

impl PnpSolution {
    /// Rotation as a matrix
    #[must_use]
    pub fn rotation(&self) -> Rotation3<f64> {
        rodrigues(&self.rotation_vector)
    }
}

/// Convert a Rodrigues rotation vector to a rotation matrix
#[must_use]
pub fn rodrigues(rotation_vector: &Vector3<f64>) -> Rotation3<f64> {
    Rotation3::new(*rotation_vector)
}

/// Direct PnP solver with optional non-linear refinement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PnpSolver {
    refine_iterations: usize,
}

impl Default for PnpSolver {
    fn default() -> Self {
        Self::new(DEFAULT_REFINE_ITERATIONS)
    }
}

impl PnpSolver {
    /// Create a solver; `refine_iterations == 0` keeps the linear estimate
    #[must_use]
    pub fn new(refine_iterations: usize) -> Self {
        Self { refine_iterations }
    }

    /// Number of Levenberg-Marquardt iterations applied after the linear solve
    #[must_use]
    pub fn refine_iterations(&self) -> usize {
        self.refine_iterations
    }

    /// Recover the pose mapping `object_points` onto `image_points`
    ///
    /// # Errors
    ///
    /// Returns `Error::PoseError` if:
    /// - fewer than six correspondences are given or the slices differ in length
    /// - any coordinate is not finite
    /// - the image points are collinear or the object points are coplanar
    /// - the linear system does not have a unique solution
    /// - the recovered pose places a point behind the camera
    pub fn solve(
        &self,
        object_points: &[Point3<f64>],
        image_points: &[Point2<f64>],
        camera: &CameraModel,
    ) -> Result<PnpSolution> {
        let n = object_points.len();
        if n < MIN_CORRESPONDENCES || image_points.len() != n {
            return Err(Error::PoseError(format!(
                "need at least {MIN_CORRESPONDENCES} matching correspondences, got {n} object and {} image points",
                image_points.len()
            )));
        }

        let finite = object_points.iter().all(|p| p.coords.iter().all(|v| v.is_finite()))
            && image_points.iter().all(|p| p.coords.iter().all(|v| v.is_finite()));
        if !finite {
            return Err(Error::PoseError("non-finite correspondence".to_string()));
        }

        check_image_spread(image_points)?;
        check_object_spread(object_points)?;

        let (rotation, translation) = linear_pose(object_points, image_points, camera)?;
        let mut params = pack(&rotation.scaled_axis(), &translation);

        if self.refine_iterations > 0 {
            params = self.refine(params, object_points, image_points, camera);
        }

        let residuals = residuals(&params, object_points, image_points, camera)
            .ok_or_else(|| Error::PoseError("solution places points behind the camera".to_string()))?;

        #[allow(clippy::cast_precision_loss)] // Point counts are tiny
        let reprojection_error = (residuals.norm_squared() / n as f64).sqrt();

        let rotation_vector = Vector3::new(params[0], params[1], params[2]);
        let translation = Vector3::new(params[3], params[4], params[5]);
        if !params.iter().all(|v| v.is_finite()) || !reprojection_error.is_finite() {
            return Err(Error::PoseError("solution is not finite".to_string()));
        }

        log::trace!(
            "PnP solved: rvec={:?} tvec={:?} rms={:.4}px",
            rotation_vector.as_slice(),
            translation.as_slice(),
            reprojection_error
        );

        Ok(PnpSolution {
            rotation_vector,
            translation,
            reprojection_error,
        })
    }

    /// Levenberg-Marquardt on the pixel residuals
    fn refine(
        &self,
        initial: Vector6<f64>,
        object_points: &[Point3<f64>],
        image_points: &[Point2<f64>],
        camera: &CameraModel,
    ) -> Vector6<f64> {
        let mut params = initial;
        let Some(mut current) = residuals(&params, object_points, image_points, camera) else {
            return params;
        };
        let mut cost = current.norm_squared();
        let mut lambda = LAMBDA_INITIAL;

        for _ in 0..self.refine_iterations {
            if cost < CONVERGED_COST {
                break;
            }
            let Some(jacobian) = numeric_jacobian(&params, object_points, image_points, camera) else {
                break;
            };
            let jtj = jacobian.transpose() * &jacobian;
            let rhs = (jacobian.transpose() * &current).map(|v| -v);

            let mut improved = false;
            while lambda < LAMBDA_MAX {
                let mut damped = jtj.clone();
                for i in 0..6 {
                    damped[(i, i)] += lambda * jtj[(i, i)].max(f64::EPSILON);
                }

                let Some(delta) = damped.lu().solve(&rhs) else {
                    lambda *= 10.0;
                    continue;
                };
                let candidate = params + Vector6::from_iterator(delta.iter().copied());

                match residuals(&candidate, object_points, image_points, camera) {
                    Some(next) if next.norm_squared() < cost => {
                        params = candidate;
                        cost = next.norm_squared();
                        current = next;
                        lambda = (lambda / 10.0).max(LAMBDA_MIN);
                        improved = true;
                        break;
                    }
                    _ => lambda *= 10.0,
                }
            }

            if !improved {
                break;
            }
        }

        params
    }
}

fn pack(rotation_vector: &Vector3<f64>, translation: &Vector3<f64>) -> Vector6<f64> {
    Vector6::new(
        rotation_vector.x,
        rotation_vector.y,
        rotation_vector.z,
        translation.x,
        translation.y,
        translation.z,
    )
}

/// Pixel residuals `projected - observed`, or `None` if a point is behind the camera
fn residuals(
    params: &Vector6<f64>,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    camera: &CameraModel,
) -> Option<DVector<f64>> {
    let rotation = rodrigues(&Vector3::new(params[0], params[1], params[2]));
    let translation = Vector3::new(params[3], params[4], params[5]);

    let mut out = DVector::zeros(2 * object_points.len());
    for (i, (object, observed)) in object_points.iter().zip(image_points).enumerate() {
        let projected = camera.project(&(rotation * object + translation))?;
        out[2 * i] = projected.x - observed.x;
        out[2 * i + 1] = projected.y - observed.y;
    }
    Some(out)
}

/// Central-difference Jacobian of the residuals with respect to the 6 pose parameters
fn numeric_jacobian(
    params: &Vector6<f64>,
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    camera: &CameraModel,
) -> Option<DMatrix<f64>> {
    let mut jacobian = DMatrix::zeros(2 * object_points.len(), 6);
    for j in 0..6 {
        let step = JACOBIAN_STEP * params[j].abs().max(1.0);
        let mut forward = *params;
        forward[j] += step;
        let mut backward = *params;
        backward[j] -= step;

        let diff = (residuals(&forward, object_points, image_points, camera)?
            - residuals(&backward, object_points, image_points, camera)?)
            / (2.0 * step);
        jacobian.set_column(j, &diff);
    }
    Some(jacobian)
}

/// Fail when the image points span less than a 2D area
fn check_image_spread(points: &[Point2<f64>]) -> Result<()> {
    #[allow(clippy::cast_precision_loss)]
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p.coords) / n;
    let covariance = points.iter().fold(Matrix2::zeros(), |acc, p| {
        let d = p.coords - centroid;
        acc + d * d.transpose()
    });

    let eigenvalues = covariance.symmetric_eigenvalues();
    let largest = eigenvalues.max();
    let smallest = eigenvalues.min();
    if largest <= 0.0 || smallest <= RANK_TOLERANCE * largest {
        return Err(Error::PoseError("image points are collinear".to_string()));
    }
    Ok(())
}

/// Fail when the object points do not span a volume
fn check_object_spread(points: &[Point3<f64>]) -> Result<()> {
    #[allow(clippy::cast_precision_loss)]
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n;
    let covariance = points.iter().fold(Matrix3::zeros(), |acc, p| {
        let d = p.coords - centroid;
        acc + d * d.transpose()
    });

    let eigenvalues = covariance.symmetric_eigenvalues();
    let largest = eigenvalues.max();
    let smallest = eigenvalues.min();
    if largest <= 0.0 || smallest <= RANK_TOLERANCE * largest {
        return Err(Error::PoseError("object points are coplanar".to_string()));
    }
    Ok(())
}

/// Similarity moving the centroid to the origin with mean distance `sqrt(2)`
fn normalizing_transform_2d(points: &[Point2<f64>]) -> Matrix3<f64> {
    #[allow(clippy::cast_precision_loss)]
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector2::zeros(), |acc, p| acc + p.coords) / n;
    let mean_distance = points.iter().map(|p| (p.coords - centroid).norm()).sum::<f64>() / n;
    let scale = if mean_distance > 0.0 {
        std::f64::consts::SQRT_2 / mean_distance
    } else {
        1.0
    };

    Matrix3::new(
        scale,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        -scale * centroid.y,
        0.0,
        0.0,
        1.0,
    )
}

/// Similarity moving the centroid to the origin with mean distance `sqrt(3)`
fn normalizing_transform_3d(points: &[Point3<f64>]) -> Matrix4<f64> {
    #[allow(clippy::cast_precision_loss)]
    let n = points.len() as f64;
    let centroid = points.iter().fold(Vector3::zeros(), |acc, p| acc + p.coords) / n;
    let mean_distance = points.iter().map(|p| (p.coords - centroid).norm()).sum::<f64>() / n;
    let scale = if mean_distance > 0.0 {
        3.0_f64.sqrt() / mean_distance
    } else {
        1.0
    };

    Matrix4::new(
        scale,
        0.0,
        0.0,
        -scale * centroid.x,
        0.0,
        scale,
        0.0,
        -scale * centroid.y,
        0.0,
        0.0,
        scale,
        -scale * centroid.z,
        0.0,
        0.0,
        0.0,
        1.0,
    )
}

/// Normalized DLT for `P = [R | t]` in normalized image coordinates
fn linear_pose(
    object_points: &[Point3<f64>],
    image_points: &[Point2<f64>],
    camera: &CameraModel,
) -> Result<(Rotation3<f64>, Vector3<f64>)> {
    let n = object_points.len();
    let normalized: Vec<Point2<f64>> = image_points.iter().map(|p| camera.normalize(p)).collect();

    let t_image = normalizing_transform_2d(&normalized);
    let t_object = normalizing_transform_3d(object_points);

    let mut a = DMatrix::<f64>::zeros(2 * n, 12);
    for (i, (object, image)) in object_points.iter().zip(&normalized).enumerate() {
        let w = t_object * object.to_homogeneous();
        let m = t_image * image.to_homogeneous();
        let (u, v) = (m.x, m.y);

        for c in 0..4 {
            a[(2 * i, c)] = w[c];
            a[(2 * i, 8 + c)] = -u * w[c];
            a[(2 * i + 1, 4 + c)] = w[c];
            a[(2 * i + 1, 8 + c)] = -v * w[c];
        }
    }

    let svd = a.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| Error::PoseError("SVD of the DLT system failed".to_string()))?;

    let values = &svd.singular_values;
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&i, &j| values[i].total_cmp(&values[j]));
    let (Some(&smallest), Some(&second), Some(&largest)) = (order.first(), order.get(1), order.last()) else {
        return Err(Error::PoseError("empty DLT system".to_string()));
    };
    if values[largest] <= 0.0 || values[second] <= RANK_TOLERANCE * values[largest] {
        return Err(Error::PoseError(
            "correspondences do not determine a unique projection".to_string(),
        ));
    }

    let mut p_normalized = Matrix3x4::<f64>::zeros();
    for r in 0..3 {
        for c in 0..4 {
            p_normalized[(r, c)] = v_t[(smallest, 4 * r + c)];
        }
    }

    let t_image_inv = t_image
        .try_inverse()
        .ok_or_else(|| Error::PoseError("degenerate image normalization".to_string()))?;
    let p = t_image_inv * p_normalized * t_object;

    // P = lambda [R | t]; a positive determinant means lambda > 0.
    let mut m = p.fixed_view::<3, 3>(0, 0).into_owned();
    let mut last = p.column(3).into_owned();
    if m.determinant() < 0.0 {
        m = -m;
        last = -last;
    }

    let svd = m.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
        return Err(Error::PoseError("SVD of the rotation block failed".to_string()));
    };
    let r = u * v_t;
    if r.determinant() <= 0.0 {
        return Err(Error::PoseError("rotation block is singular".to_string()));
    }

    let scale = svd.singular_values.sum() / 3.0;
    if !scale.is_finite() || scale <= f64::EPSILON {
        return Err(Error::PoseError("projection scale vanished".to_string()));
    }

    Ok((Rotation3::from_matrix_unchecked(r), last / scale))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MODEL_POINTS_3D;

    fn model() -> Vec<Point3<f64>> {
        MODEL_POINTS_3D.iter().map(|p| Point3::new(p[0], p[1], p[2])).collect()
    }

    fn project_all(
        points: &[Point3<f64>],
        rotation: &Rotation3<f64>,
        translation: &Vector3<f64>,
        camera: &CameraModel,
    ) -> Vec<Point2<f64>> {
        points
            .iter()
            .map(|p| camera.project(&(rotation * p + *translation)).unwrap())
            .collect()
    }

    #[test]
    fn test_camera_from_image_size_floors_center() {
        let camera = CameraModel::from_image_size(641, 481);
        assert_eq!(camera.fx, 641.0);
        assert_eq!(camera.fy, 641.0);
        assert_eq!(camera.cx, 320.0);
        assert_eq!(camera.cy, 240.0);
        assert_eq!(camera.dist_coeffs, [0.0; 4]);

        let k = camera.matrix();
        assert_eq!(k[(0, 2)], 320.0);
        assert_eq!(k[(2, 2)], 1.0);
    }

    #[test]
    fn test_project_rejects_points_behind_camera() {
        let camera = CameraModel::from_image_size(640, 480);
        assert!(camera.project(&Point3::new(0.0, 0.0, -1.0)).is_none());
        assert!(camera.project(&Point3::new(0.0, 0.0, 0.0)).is_none());
        let center = camera.project(&Point3::new(0.0, 0.0, 5.0)).unwrap();
        assert_eq!(center, Point2::new(320.0, 240.0));
    }

    #[test]
    fn test_rodrigues_quarter_turn() {
        let rotation = rodrigues(&Vector3::new(0.0, 0.0, std::f64::consts::FRAC_PI_2));
        let m = rotation.matrix();
        assert!((m[(0, 0)]).abs() < 1e-12);
        assert!((m[(1, 0)] - 1.0).abs() < 1e-12);
        assert!((m[(0, 1)] + 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_linear_solve_recovers_exact_pose() {
        let camera = CameraModel::from_image_size(640, 480);
        let rotation = Rotation3::from_euler_angles(0.2, -0.3, 0.1);
        let translation = Vector3::new(15.0, -20.0, 1200.0);
        let object = model();
        let image = project_all(&object, &rotation, &translation, &camera);

        let solution = PnpSolver::new(0).solve(&object, &image, &camera).unwrap();

        assert!(solution.rotation().angle_to(&rotation) < 1e-6);
        assert!((solution.translation - translation).norm() < 1e-3);
        assert!(solution.reprojection_error < 1e-6);
    }

    #[test]
    fn test_refinement_reduces_noisy_error() {
        let camera = CameraModel::from_image_size(640, 480);
        let rotation = Rotation3::from_euler_angles(-0.15, 0.25, 0.05);
        let translation = Vector3::new(0.0, 10.0, 1000.0);
        let object = model();
        let noise = [(0.8, -0.5), (-0.6, 0.7), (0.4, 0.9), (-0.9, -0.3), (0.5, -0.8), (-0.2, 0.6)];
        let image: Vec<Point2<f64>> = project_all(&object, &rotation, &translation, &camera)
            .into_iter()
            .zip(noise)
            .map(|(p, (dx, dy))| Point2::new(p.x + dx, p.y + dy))
            .collect();

        let linear = PnpSolver::new(0).solve(&object, &image, &camera).unwrap();
        let refined = PnpSolver::default().solve(&object, &image, &camera).unwrap();

        assert!(refined.reprojection_error <= linear.reprojection_error + 1e-12);
        assert!(refined.rotation().angle_to(&rotation) < 0.05);
    }

    #[test]
    fn test_too_few_points() {
        let camera = CameraModel::from_image_size(640, 480);
        let object = &model()[..5];
        let image = vec![Point2::new(1.0, 2.0); 5];
        assert!(matches!(
            PnpSolver::default().solve(object, &image, &camera),
            Err(Error::PoseError(_))
        ));
    }

    #[test]
    fn test_mismatched_lengths() {
        let camera = CameraModel::from_image_size(640, 480);
        let image = vec![Point2::new(1.0, 2.0); 7];
        assert!(PnpSolver::default().solve(&model(), &image, &camera).is_err());
    }

    #[test]
    fn test_collinear_image_points_fail() {
        let camera = CameraModel::from_image_size(640, 480);
        let image: Vec<Point2<f64>> = (0..6).map(|i| Point2::new(100.0 + 40.0 * f64::from(i), 240.0)).collect();
        let err = PnpSolver::default().solve(&model(), &image, &camera).unwrap_err();
        assert!(err.to_string().contains("collinear"));
    }

    #[test]
    fn test_coincident_image_points_fail() {
        let camera = CameraModel::from_image_size(640, 480);
        let image = vec![Point2::new(320.0, 240.0); 6];
        assert!(PnpSolver::default().solve(&model(), &image, &camera).is_err());
    }

    #[test]
    fn test_coplanar_object_points_fail() {
        let camera = CameraModel::from_image_size(640, 480);
        let object: Vec<Point3<f64>> = (0..6)
            .map(|i| Point3::new(f64::from(i) * 10.0, f64::from(i * i), 0.0))
            .collect();
        let image: Vec<Point2<f64>> = (0..6)
            .map(|i| Point2::new(f64::from(i) * 13.0, f64::from(i * i) + 3.0))
            .collect();
        let err = PnpSolver::default().solve(&object, &image, &camera).unwrap_err();
        assert!(err.to_string().contains("coplanar"));
    }

    #[test]
    fn test_non_finite_input_fails() {
        let camera = CameraModel::from_image_size(640, 480);
        let mut image = vec![Point2::new(1.0, 2.0); 6];
        image[3] = Point2::new(f64::NAN, 0.0);
        assert!(PnpSolver::default().solve(&model(), &image, &camera).is_err());
    }

    #[test]
    fn test_solver_is_deterministic() {
        let camera = CameraModel::from_image_size(800, 600);
        let rotation = Rotation3::from_euler_angles(0.05, 0.4, -0.2);
        let translation = Vector3::new(-30.0, 5.0, 1500.0);
        let object = model();
        let image = project_all(&object, &rotation, &translation, &camera);

        let solver = PnpSolver::default();
        let first = solver.solve(&object, &image, &camera).unwrap();
        let second = solver.solve(&object, &image, &camera).unwrap();
        assert_eq!(first, second);
    }
}
