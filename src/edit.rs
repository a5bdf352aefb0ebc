//! Simple post-processing for raster images: brightness/contrast
//! rescaling and two-image alpha blending.

use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use image::RgbImage;

use crate::error::{Error, Result};

/// Brightness offsets and contrast percentages are clamped to this range
/// before the transform is applied.
const ADJUST_LIMIT: i32 = 100;

fn open_rgb(path: &Path) -> Result<RgbImage> {
    let image = image::open(path)
        .map_err(|source| Error::ImageLoad { path: path.to_path_buf(), source })?;
    Ok(image.to_rgb8())
}

fn save_rgb(image: &RgbImage, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)
                .map_err(|source| Error::OutputDir { path: dir.to_path_buf(), source })?;
        }
    }
    image.save(path).map_err(|source| Error::ImageSave { path: path.to_path_buf(), source })
}

/// Round a computed channel value and saturate it to the u8 range.
fn saturate(value: f64) -> u8 {
    value.round().clamp(0., 255.) as u8
}

/// Rescale pixel values as `value * factor + offset` with saturation.
///
/// `brightness` is an additive offset in [-100, 100]. `contrast` is a
/// percentage in [-100, 100] turned into the multiplicative factor
/// `contrast / 100 + 1`, so -100 flattens the image to the offset, 0
/// leaves the values unchanged and 100 doubles them. Values outside the
/// range are clamped to it.
pub fn adjust_brightness_contrast(
    input: &Path,
    output: &Path,
    brightness: i32,
    contrast: i32,
) -> Result<PathBuf> {
    let mut image = open_rgb(input)?;
    let offset = f64::from(brightness.clamp(-ADJUST_LIMIT, ADJUST_LIMIT));
    let factor = f64::from(contrast.clamp(-ADJUST_LIMIT, ADJUST_LIMIT)) / 100. + 1.;
    for pixel in image.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            *channel = saturate(f64::from(*channel) * factor + offset);
        }
    }
    save_rgb(&image, output)?;
    Ok(output.to_path_buf())
}

/// Per-pixel weighted average of two images, `alpha` being the weight of
/// the first one and `1 - alpha` the weight of the second.
///
/// When the dimensions differ the second image is resized to match the
/// first. Alpha values outside [0, 1] are not rejected, they extrapolate
/// and are only bounded by the final saturation.
pub fn blend_images(first: &Path, second: &Path, output: &Path, alpha: f64) -> Result<PathBuf> {
    let image1 = open_rgb(first)?;
    let mut image2 = open_rgb(second)?;
    if image1.dimensions() != image2.dimensions() {
        image2 = image::imageops::resize(
            &image2,
            image1.width(),
            image1.height(),
            FilterType::Triangle,
        );
    }
    let mut blended = RgbImage::new(image1.width(), image1.height());
    for (target, (p1, p2)) in blended.pixels_mut().zip(image1.pixels().zip(image2.pixels())) {
        for channel in 0..3 {
            target.0[channel] =
                saturate(alpha * f64::from(p1.0[channel]) + (1. - alpha) * f64::from(p2.0[channel]));
        }
    }
    save_rgb(&blended, output)?;
    Ok(output.to_path_buf())
}
