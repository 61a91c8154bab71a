use crate::caption::Captioner;
use crate::diffusion::ImageGenerator;
use crate::error::Result;
use crate::onnx::Device;
use crate::vision::VisionEmbedder;
use image::{DynamicImage, RgbImage};
use ndarray::{Array1, Array2};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

/// Produces one L2-normalised embedding per image.
pub trait ImageEmbedding: Send {
    fn embed_images(&mut self, images: &[DynamicImage]) -> Result<Array2<f32>>;

    fn embed_image(&mut self, image: &DynamicImage) -> Result<Array1<f32>> {
        let embs = self.embed_images(std::slice::from_ref(image))?;
        Ok(embs.row(0).to_owned())
    }
}

pub trait ImageCaptioning: Send {
    fn describe(&mut self, image: &DynamicImage) -> Result<String>;
}

pub trait ImageGeneration: Send {
    fn generate(&mut self, prompt: &str) -> Result<RgbImage>;
}

impl ImageEmbedding for VisionEmbedder {
    fn embed_images(&mut self, images: &[DynamicImage]) -> Result<Array2<f32>> {
        Self::embed_images(self, images)
    }
}

impl ImageCaptioning for Captioner {
    fn describe(&mut self, image: &DynamicImage) -> Result<String> {
        Self::describe(self, image)
    }
}

impl ImageGeneration for ImageGenerator {
    fn generate(&mut self, prompt: &str) -> Result<RgbImage> {
        Self::generate(self, prompt)
    }
}

pub type SharedModel<T> = Arc<Mutex<T>>;

/// Where to find each model. A `None` directory leaves that model unloaded.
#[derive(Debug, Clone, Default)]
pub struct ModelPaths {
    pub clip_dir: Option<PathBuf>,
    pub blip_dir: Option<PathBuf>,
    pub diffusion_dir: Option<PathBuf>,
    pub device: Device,
}

/// The pretrained models, loaded once and held for the process lifetime.
#[derive(Clone, Default)]
pub struct ModelSet {
    pub embedder: Option<SharedModel<dyn ImageEmbedding>>,
    pub captioner: Option<SharedModel<dyn ImageCaptioning>>,
    pub generator: Option<SharedModel<dyn ImageGeneration>>,
    pub device: Device,
}

impl std::fmt::Debug for ModelSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSet")
            .field("clip", &self.embedder.is_some())
            .field("blip", &self.captioner.is_some())
            .field("stable_diffusion", &self.generator.is_some())
            .field("device", &self.device)
            .finish()
    }
}

impl ModelSet {
    pub fn load(paths: &ModelPaths) -> Result<Self> {
        let device = paths.device.active();
        tracing::info!(requested = %paths.device, %device, "Loading models");

        let embedder = match &paths.clip_dir {
            Some(dir) => {
                let start = Instant::now();
                let model = VisionEmbedder::new(dir, device)?;
                tracing::info!(dir = %dir.display(), elapsed = ?start.elapsed(), "CLIP model loaded");
                Some(Arc::new(Mutex::new(model)) as SharedModel<dyn ImageEmbedding>)
            }
            None => {
                tracing::warn!("No CLIP model directory given, /upload_references and /classify are disabled");
                None
            }
        };

        let captioner = match &paths.blip_dir {
            Some(dir) => {
                let start = Instant::now();
                let model = Captioner::new(dir, device)?;
                tracing::info!(dir = %dir.display(), elapsed = ?start.elapsed(), "BLIP model loaded");
                Some(Arc::new(Mutex::new(model)) as SharedModel<dyn ImageCaptioning>)
            }
            None => {
                tracing::warn!("No BLIP model directory given, /describe is disabled");
                None
            }
        };

        let generator = match &paths.diffusion_dir {
            Some(dir) => {
                let start = Instant::now();
                let model = ImageGenerator::new(dir, device)?;
                tracing::info!(dir = %dir.display(), elapsed = ?start.elapsed(), "Stable Diffusion model loaded");
                Some(Arc::new(Mutex::new(model)) as SharedModel<dyn ImageGeneration>)
            }
            None => {
                tracing::warn!("No Stable Diffusion model directory given, /generate is disabled");
                None
            }
        };

        Ok(Self {
            embedder,
            captioner,
            generator,
            device,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_paths_load_nothing() {
        let models = ModelSet::load(&ModelPaths::default()).unwrap();
        assert!(models.embedder.is_none());
        assert!(models.captioner.is_none());
        assert!(models.generator.is_none());
        assert_eq!(models.device, Device::Cpu);
    }

    #[test]
    fn reported_device_is_the_active_one() {
        let paths = ModelPaths {
            device: Device::Cuda,
            ..ModelPaths::default()
        };
        let models = ModelSet::load(&paths).unwrap();
        assert_eq!(models.device, Device::Cuda.active());
    }
}
