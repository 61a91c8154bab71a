use crate::config::{load_model_config, ClipConfig, PreprocessConfig, ResizeMode};
use crate::error::{DetectError, Result};
use crate::onnx::{extract_output, Device, OnnxSession};
use crate::references::l2_normalize;
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::{Array1, Array2, Array4, ArrayViewMut3, Axis};
use ort::value::Value;
use rayon::prelude::*;
use std::path::Path;

/// Decode uploaded bytes into an RGB image.
pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage> {
    let image = image::load_from_memory(bytes)?;
    Ok(DynamicImage::ImageRgb8(image.to_rgb8()))
}

/// CLIP image tower producing L2-normalised embeddings.
pub struct VisionEmbedder {
    pub session: OnnxSession,
    pub config: ClipConfig,
    pub input_name: String,
}

impl VisionEmbedder {
    pub fn new(model_dir: &Path, device: Device) -> Result<Self> {
        let config: ClipConfig = load_model_config(model_dir)?;
        let session = OnnxSession::new(model_dir.join("visual.onnx"), device)?;
        let input_name = session.require_input(&["pixel_values", "input"])?;

        Ok(Self {
            session,
            config,
            input_name,
        })
    }

    /// Embed a single image
    pub fn embed_image(&mut self, image: &DynamicImage) -> Result<Array1<f32>> {
        let embs = self.embed_images(std::slice::from_ref(image))?;
        Ok(embs.row(0).to_owned())
    }

    /// Embed a batch of images, one normalised row per image.
    pub fn embed_images(&mut self, images: &[DynamicImage]) -> Result<Array2<f32>> {
        let batch_tensor = preprocess_batch(images, &self.config.preprocess)?;

        let input_tensor = Value::from_array(batch_tensor)?;
        let outputs = self
            .session
            .session
            .run(ort::inputs![self.input_name.as_str() => input_tensor])?;

        let mut embs = extract_output(&outputs[0])?
            .into_dimensionality::<ndarray::Ix2>()
            .map_err(|e| DetectError::Inference(e.to_string()))?;
        for mut row in embs.axis_iter_mut(Axis(0)) {
            l2_normalize(&mut row);
        }
        Ok(embs)
    }
}

/// Preprocess batch of images into `(N, 3, size, size)`.
pub fn preprocess_batch(images: &[DynamicImage], config: &PreprocessConfig) -> Result<Array4<f32>> {
    if images.is_empty() {
        return Err(DetectError::Inference("Empty batch".to_string()));
    }

    let size = config.image_size as usize;
    let mut batch_tensor = Array4::<f32>::zeros((images.len(), 3, size, size));
    batch_tensor
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .zip(images.par_iter())
        .try_for_each(|(mut slot, img)| preprocess_into(img, config, &mut slot))?;

    Ok(batch_tensor)
}

fn preprocess_into(
    image: &DynamicImage,
    config: &PreprocessConfig,
    out_view: &mut ArrayViewMut3<f32>,
) -> Result<()> {
    let size = config.image_size;
    let interp = match config.interpolation.as_str() {
        "bicubic" => FilterType::CatmullRom,
        "bilinear" => FilterType::Triangle,
        _ => FilterType::Nearest,
    };

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let resized = match config.resize_mode {
        ResizeMode::Squash => image.resize_exact(size, size, interp),
        ResizeMode::Shortest => {
            let (width, height) = image.dimensions();
            let scale = size as f32 / width.min(height) as f32;
            let scaled_width = ((width as f32 * scale).round() as u32).max(size);
            let scaled_height = ((height as f32 * scale).round() as u32).max(size);
            let resized = image.resize_exact(scaled_width, scaled_height, interp);
            let x = (scaled_width - size) / 2;
            let y = (scaled_height - size) / 2;
            resized.crop_imm(x, y, size, size)
        }
    };

    let rgb = resized.to_rgb8();
    let (mean, std) = (config.mean, config.std);

    let pixels = rgb.as_raw();
    for c in 0..3 {
        let channel_slice = out_view.index_axis_mut(Axis(0), c);
        let flat_channel = channel_slice
            .into_slice()
            .ok_or_else(|| DetectError::Inference("Layout mismatch".into()))?;
        for (i, value) in flat_channel.iter_mut().enumerate() {
            let val = f32::from(pixels[i * 3 + c]) / 255.0;
            *value = (val - mean[c]) / std[c];
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    fn solid(width: u32, height: u32, color: [u8; 3]) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb(color)))
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_image(b"definitely not an image").is_err());
    }

    #[test]
    fn decode_converts_to_rgb() {
        let mut png = Vec::new();
        DynamicImage::ImageLumaA8(image::GrayAlphaImage::new(4, 4))
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let decoded = decode_image(&png).unwrap();
        assert!(matches!(decoded, DynamicImage::ImageRgb8(_)));
    }

    #[test]
    fn preprocess_normalises_per_channel() {
        let config = PreprocessConfig {
            image_size: 8,
            ..PreprocessConfig::default()
        };
        let batch = preprocess_batch(&[solid(20, 10, [255, 0, 128])], &config).unwrap();
        assert_eq!(batch.shape(), &[1, 3, 8, 8]);

        let red = (1.0 - config.mean[0]) / config.std[0];
        let green = (0.0 - config.mean[1]) / config.std[1];
        assert!((batch[[0, 0, 3, 3]] - red).abs() < 1e-5);
        assert!((batch[[0, 1, 7, 0]] - green).abs() < 1e-5);
    }

    #[test]
    fn preprocess_keeps_batch_order() {
        let config = PreprocessConfig {
            image_size: 4,
            resize_mode: ResizeMode::Squash,
            ..PreprocessConfig::default()
        };
        let images = [solid(5, 5, [0, 0, 0]), solid(9, 3, [255, 255, 255])];
        let batch = preprocess_batch(&images, &config).unwrap();
        assert!(batch[[0, 0, 0, 0]] < 0.0);
        assert!(batch[[1, 0, 0, 0]] > 0.0);
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(preprocess_batch(&[], &PreprocessConfig::default()).is_err());
    }
}
