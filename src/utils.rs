//! Utility functions for bounding boxes, rounding and image conversion.

pub mod image_conversion;
pub mod safe_cast;

use crate::face_detection::BoundingBox;
use safe_cast::f32_to_i32_clamp;

/// Round to a fixed number of decimals.
///
/// The value is scaled by `10^decimals` in binary floating point and the
/// product is rounded half away from zero, so `12.35` (scaled to exactly
/// `123.5`) becomes `12.4` and `0.15` becomes `0.2`.
///
/// Negative zero is normalised to `0.0` so it serializes without a sign.
#[must_use]
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor + 0.0
}

/// Expand bounding boxes by `shift` of their size, square them and keep
/// them inside a `max_width` x `max_height` image.
#[allow(clippy::cast_precision_loss)] // Precision loss acceptable for box dimensions
pub fn refine_boxes(boxes: &mut [BoundingBox], max_width: i32, max_height: i32, shift: f32) {
    for bbox in boxes.iter_mut() {
        let x_shift = f32_to_i32_clamp(bbox.width as f32 * shift, 0, max_width);
        let y_shift = f32_to_i32_clamp(bbox.height as f32 * shift, 0, max_height);

        bbox.x = (bbox.x - x_shift).max(0);
        bbox.y = (bbox.y - y_shift).max(0);
        bbox.width = (bbox.width + 2 * x_shift).min(max_width - bbox.x);
        bbox.height = (bbox.height + 2 * y_shift).min(max_height - bbox.y);

        // Square, bounded by the smaller image side
        let side_length = bbox.width.max(bbox.height).min(max_width).min(max_height);
        bbox.width = side_length;
        bbox.height = side_length;

        if bbox.x + bbox.width > max_width {
            bbox.x = max_width - bbox.width;
        }
        if bbox.y + bbox.height > max_height {
            bbox.y = max_height - bbox.height;
        }
    }
}
