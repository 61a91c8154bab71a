use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage, RgbaImage};
use std::path::Path;

/// Resize `heat` to `base`, alpha-composite it on top, then blend the result
/// with `base` at `alpha`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
#[must_use]
pub fn blend_heatmap(base: &RgbaImage, heat: &RgbaImage, alpha: f32) -> RgbImage {
    let (width, height) = base.dimensions();
    let heat = if heat.dimensions() == (width, height) {
        heat.clone()
    } else {
        imageops::resize(heat, width, height, FilterType::CatmullRom)
    };

    let mut composed = base.clone();
    imageops::overlay(&mut composed, &heat, 0, 0);

    let alpha = alpha.clamp(0.0, 1.0);
    RgbImage::from_fn(width, height, |x, y| {
        let b = base.get_pixel(x, y).0;
        let c = composed.get_pixel(x, y).0;
        let mix = |i: usize| {
            f32::from(b[i])
                .mul_add(1.0 - alpha, f32::from(c[i]) * alpha)
                .round()
                .clamp(0.0, 255.0) as u8
        };
        Rgb([mix(0), mix(1), mix(2)])
    })
}

fn open_rgba(path: Option<&Path>) -> Option<RgbaImage> {
    let path = path?;
    match image::open(path) {
        Ok(image) => Some(image.to_rgba8()),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "skipping unreadable image");
            None
        }
    }
}

/// Overlay for a classification item. Falls back to whichever of the two
/// images could be read.
#[must_use]
pub fn overlay_heatmap(base: Option<&Path>, heat: Option<&Path>, alpha: f32) -> Option<RgbImage> {
    match (open_rgba(base), open_rgba(heat)) {
        (Some(base), Some(heat)) => Some(blend_heatmap(&base, &heat, alpha)),
        (Some(only), None) | (None, Some(only)) => {
            Some(image::DynamicImage::ImageRgba8(only).to_rgb8())
        }
        (None, None) => None,
    }
}
