//! Checked numeric conversions between pixel coordinate types

use crate::{Error, Result};

/// Safely convert u32 to i32 with overflow checking
///
/// # Errors
///
/// Returns an error if the value exceeds i32::MAX
pub fn u32_to_i32(value: u32) -> Result<i32> {
    value
        .try_into()
        .map_err(|_| Error::InvalidInput(format!("Value {value} too large to fit in i32")))
}

/// Safely convert f32 to i32 with bounds checking
///
/// # Errors
///
/// Returns an error if the value is not finite or outside i32 range
#[allow(clippy::cast_precision_loss)] // MIN/MAX bounds checking is approximate
#[allow(clippy::cast_possible_truncation)] // Truncation after bounds check is safe
pub fn f32_to_i32(value: f32) -> Result<i32> {
    if value.is_finite() && value >= i32::MIN as f32 && value <= i32::MAX as f32 {
        Ok(value as i32)
    } else {
        Err(Error::InvalidInput(format!(
            "Value {value} cannot be safely converted to i32"
        )))
    }
}

/// Clamp and convert f32 to i32 for pixel coordinates
#[must_use]
#[allow(clippy::cast_precision_loss)] // Acceptable for clamping bounds
#[allow(clippy::cast_possible_truncation)] // Clamping ensures safe truncation
pub fn f32_to_i32_clamp(value: f32, min: i32, max: i32) -> i32 {
    let (min, max) = if min <= max { (min, max) } else { (max, min) };

    if !value.is_finite() {
        return min;
    }

    let clamped = value.clamp(min as f32, max as f32);
    let result = clamped as i32;
    result.clamp(min, max)
}

/// Clamp an i32 pixel coordinate into `0..=max` and return it as u32
#[must_use]
#[allow(clippy::cast_sign_loss)] // Negative values are clamped away first
pub fn i32_to_u32_clamp(value: i32, max: u32) -> u32 {
    let value = value.max(0) as u32;
    value.min(max)
}
