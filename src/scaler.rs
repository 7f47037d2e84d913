//! Scaling and JPEG re-encoding of decoded rasters.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use anyhow::{Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use tracing::debug;

use crate::config::ScaleMode;

impl ScaleMode {
    fn filter(self) -> FilterType {
        match self {
            // CatmullRom is a good quality/speed balance for downscaling
            ScaleMode::Fast => FilterType::Triangle,
            ScaleMode::Quality => FilterType::CatmullRom,
        }
    }
}

/// The scale factor that fits `source` inside `target`, preserving aspect
/// ratio. With `dont_enlarge` the factor never exceeds 1.0.
pub fn fit_factor(source: (u32, u32), target: (u32, u32), dont_enlarge: bool) -> f64 {
    if source.0 == 0 || source.1 == 0 {
        return 1.0;
    }
    let factor_x = f64::from(target.0) / f64::from(source.0);
    let factor_y = f64::from(target.1) / f64::from(source.1);
    let factor = factor_x.min(factor_y);
    if dont_enlarge && factor > 1.0 {
        1.0
    } else {
        factor
    }
}

/// Scale `img` to fit inside `target`.
pub fn scale_to_fit(
    img: &DynamicImage,
    target: (u32, u32),
    mode: ScaleMode,
    dont_enlarge: bool,
) -> DynamicImage {
    let factor = fit_factor((img.width(), img.height()), target, dont_enlarge);
    let width = ((f64::from(img.width()) * factor).round() as u32).max(1);
    let height = ((f64::from(img.height()) * factor).round() as u32).max(1);
    if (width, height) == (img.width(), img.height()) {
        return img.clone();
    }
    img.resize_exact(width, height, mode.filter())
}

/// Write `img` to `path` as JPEG, creating parent directories as needed.
pub fn write_jpeg(img: &DynamicImage, path: &Path, quality: u8) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create preview directory: {:?}", parent))?;
    }

    let file =
        File::create(path).with_context(|| format!("Failed to create preview file: {:?}", path))?;
    let mut writer = BufWriter::new(file);

    // JPEG has no alpha channel
    let rgb_img = img.to_rgb8();
    let encoder = JpegEncoder::new_with_quality(&mut writer, quality);
    rgb_img
        .write_with_encoder(encoder)
        .with_context(|| format!("Failed to encode preview: {:?}", path))?;

    debug!(?path, "Saved preview");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    fn img(w: u32, h: u32) -> DynamicImage {
        DynamicImage::ImageRgba8(RgbaImage::new(w, h))
    }

    #[test]
    fn test_fit_factor_downscale() {
        let factor = fit_factor((1920, 1080), (350, 350), false);
        // limited by height: 350/1080
        assert!((factor - 350.0 / 1080.0).abs() < 1e-9);
    }

    #[test]
    fn test_fit_factor_enlarge_policy() {
        assert!((fit_factor((100, 100), (350, 350), false) - 3.5).abs() < 1e-9);
        assert_eq!(fit_factor((100, 100), (350, 350), true), 1.0);
    }

    #[test]
    fn test_scale_to_fit_dimensions() {
        let scaled = scale_to_fit(&img(1920, 1080), (350, 350), ScaleMode::Fast, false);
        assert_eq!(scaled.height(), 350);
        assert!((scaled.width() as i32 - 622).abs() <= 1);
    }

    #[test]
    fn test_scale_to_fit_small_source_untouched() {
        let scaled = scale_to_fit(&img(200, 100), (350, 350), ScaleMode::Quality, true);
        assert_eq!((scaled.width(), scaled.height()), (200, 100));
    }

    #[test]
    fn test_write_jpeg_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("thumb.jpg");
        write_jpeg(&img(32, 24), &path, 80).unwrap();
        let loaded = image::open(&path).unwrap();
        assert_eq!((loaded.width(), loaded.height()), (32, 24));
    }
}
