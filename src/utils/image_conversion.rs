//! Image conversion utilities between `image` buffers and model tensors.

use crate::{
    face_detection::BoundingBox,
    utils::safe_cast::i32_to_u32_clamp,
    Error, Result,
};
use image::{imageops, imageops::FilterType, GrayImage, Rgb, RgbImage};
use ndarray::Array4;

/// Convert an RGB image to an NCHW tensor with `(value - offset) / scale`
///
/// # Returns
/// * `Array4<f32>` with shape (1, 3, height, width)
///
/// # Errors
/// * Returns error if the image is empty
pub fn rgb_to_nchw(image: &RgbImage, offset: f32, scale: f32) -> Result<Array4<f32>> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(Error::InvalidInput(format!("Invalid image dimensions: {width}x{height}")));
    }

    let mut array = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        for ch in 0..3 {
            array[[0, ch, y as usize, x as usize]] = (f32::from(pixel[ch]) - offset) / scale;
        }
    }
    Ok(array)
}

/// Convert a grayscale image to an NCHW tensor scaled to `[0, 1]`
///
/// # Returns
/// * `Array4<f32>` with shape (1, 1, height, width)
///
/// # Errors
/// * Returns error if the image is empty
pub fn gray_to_nchw(image: &GrayImage) -> Result<Array4<f32>> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(Error::InvalidInput(format!("Invalid image dimensions: {width}x{height}")));
    }

    let mut array = Array4::<f32>::zeros((1, 1, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        array[[0, 0, y as usize, x as usize]] = f32::from(pixel[0]) / 255.0;
    }
    Ok(array)
}

/// Crop the part of `bbox` that lies inside the image
///
/// # Errors
/// * Returns error if the box does not overlap the image
pub fn crop_to_box(image: &RgbImage, bbox: &BoundingBox) -> Result<RgbImage> {
    let (width, height) = image.dimensions();
    let x0 = i32_to_u32_clamp(bbox.x, width);
    let y0 = i32_to_u32_clamp(bbox.y, height);
    let x1 = i32_to_u32_clamp(bbox.x.saturating_add(bbox.width), width);
    let y1 = i32_to_u32_clamp(bbox.y.saturating_add(bbox.height), height);

    if x1 <= x0 || y1 <= y0 {
        return Err(Error::InvalidInput(format!(
            "Bounding box {bbox:?} does not overlap {width}x{height} image"
        )));
    }

    Ok(imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image())
}

/// Resize keeping the aspect ratio and pad the bottom/right with black.
///
/// Returns the padded image and the factor from source to resized pixels.
///
/// # Errors
/// * Returns error if either image is empty
#[allow(clippy::cast_precision_loss)] // Image sizes are far below f32 precision limits
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // Sizes are positive and bounded
pub fn letterbox(image: &RgbImage, input_width: u32, input_height: u32) -> Result<(RgbImage, f32)> {
    let (img_width, img_height) = image.dimensions();
    if img_width == 0 || img_height == 0 || input_width == 0 || input_height == 0 {
        return Err(Error::InvalidInput(format!(
            "Cannot letterbox {img_width}x{img_height} into {input_width}x{input_height}"
        )));
    }

    let ratio_img = img_height as f32 / img_width as f32;
    let ratio_model = input_height as f32 / input_width as f32;

    let (new_width, new_height) = if ratio_img > ratio_model {
        let new_height = input_height;
        let new_width = ((new_height as f32 / ratio_img) as u32).clamp(1, input_width);
        (new_width, new_height)
    } else {
        let new_width = input_width;
        let new_height = ((new_width as f32 * ratio_img) as u32).clamp(1, input_height);
        (new_width, new_height)
    };

    let det_scale = new_height as f32 / img_height as f32;
    let resized = imageops::resize(image, new_width, new_height, FilterType::Triangle);

    let mut padded = RgbImage::from_pixel(input_width, input_height, Rgb([0, 0, 0]));
    imageops::replace(&mut padded, &resized, 0, 0);

    Ok((padded, det_scale))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_to_nchw_layout() {
        let mut image = RgbImage::new(4, 2);
        image.put_pixel(3, 1, Rgb([255, 0, 128]));

        let tensor = rgb_to_nchw(&image, 0.0, 255.0).unwrap();
        assert_eq!(tensor.shape(), &[1, 3, 2, 4]);
        assert_eq!(tensor[[0, 0, 1, 3]], 1.0);
        assert_eq!(tensor[[0, 1, 1, 3]], 0.0);
        assert!((tensor[[0, 2, 1, 3]] - 128.0 / 255.0).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
    }

    #[test]
    fn test_rgb_to_nchw_normalization() {
        let image = RgbImage::from_pixel(2, 2, Rgb([127, 255, 0]));
        let tensor = rgb_to_nchw(&image, 127.5, 128.0).unwrap();
        assert!((tensor[[0, 0, 0, 0]] - (-0.5 / 128.0)).abs() < 1e-6);
        assert!((tensor[[0, 1, 0, 0]] - (127.5 / 128.0)).abs() < 1e-6);
        assert!((tensor[[0, 2, 0, 0]] - (-127.5 / 128.0)).abs() < 1e-6);
    }

    #[test]
    fn test_empty_image_rejected() {
        assert!(rgb_to_nchw(&RgbImage::new(0, 0), 0.0, 1.0).is_err());
        assert!(gray_to_nchw(&GrayImage::new(0, 3)).is_err());
    }

    #[test]
    fn test_gray_to_nchw() {
        let image = GrayImage::from_pixel(3, 3, image::Luma([51]));
        let tensor = gray_to_nchw(&image).unwrap();
        assert_eq!(tensor.shape(), &[1, 1, 3, 3]);
        assert!((tensor[[0, 0, 2, 2]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_crop_to_box_clamps() {
        let image = RgbImage::from_pixel(100, 80, Rgb([10, 20, 30]));
        let crop = crop_to_box(&image, &BoundingBox::new(-10, 60, 50, 50)).unwrap();
        assert_eq!(crop.dimensions(), (40, 20));

        assert!(crop_to_box(&image, &BoundingBox::new(200, 200, 10, 10)).is_err());
    }

    #[test]
    fn test_letterbox_wide_image() {
        let image = RgbImage::from_pixel(200, 100, Rgb([255, 255, 255]));
        let (padded, scale) = letterbox(&image, 64, 64).unwrap();

        assert_eq!(padded.dimensions(), (64, 64));
        assert!((scale - 0.32).abs() < 1e-6);
        assert!(padded.get_pixel(10, 10)[0] > 250);
        assert_eq!(padded.get_pixel(0, 63), &Rgb([0, 0, 0]));
    }
}
