use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::Path;

/// Name of the per-model settings file inside each model directory.
pub const MODEL_CONFIG_FILE: &str = "model_config.json";

pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

/// Read a model config from `model_dir/model_config.json`, falling back to
/// the defaults when the file does not exist.
pub fn load_model_config<T>(model_dir: &Path) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    let path = model_dir.join(MODEL_CONFIG_FILE);
    if !path.is_file() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// How an image is brought to the square model input.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResizeMode {
    /// Resize the shortest side, then centre crop.
    #[default]
    Shortest,
    /// Ignore aspect ratio and resize directly.
    Squash,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PreprocessConfig {
    pub image_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub interpolation: String,
    pub resize_mode: ResizeMode,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            image_size: 224,
            mean: CLIP_MEAN,
            std: CLIP_STD,
            interpolation: "bicubic".to_string(),
            resize_mode: ResizeMode::Shortest,
        }
    }
}

/// A partial `preprocess` object; absent keys keep the model's own defaults.
#[derive(Deserialize, Debug, Clone, Default)]
struct PreprocessOverrides {
    image_size: Option<u32>,
    mean: Option<[f32; 3]>,
    std: Option<[f32; 3]>,
    interpolation: Option<String>,
    resize_mode: Option<ResizeMode>,
}

impl PreprocessOverrides {
    fn apply(self, base: PreprocessConfig) -> PreprocessConfig {
        PreprocessConfig {
            image_size: self.image_size.unwrap_or(base.image_size),
            mean: self.mean.unwrap_or(base.mean),
            std: self.std.unwrap_or(base.std),
            interpolation: self.interpolation.unwrap_or(base.interpolation),
            resize_mode: self.resize_mode.unwrap_or(base.resize_mode),
        }
    }
}

fn blip_preprocess() -> PreprocessConfig {
    PreprocessConfig {
        image_size: 384,
        resize_mode: ResizeMode::Squash,
        ..PreprocessConfig::default()
    }
}

fn deserialize_blip_preprocess<'de, D>(deserializer: D) -> std::result::Result<PreprocessConfig, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(PreprocessOverrides::deserialize(deserializer)?.apply(blip_preprocess()))
}

/// CLIP image tower (`visual.onnx`).
#[derive(Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ClipConfig {
    pub preprocess: PreprocessConfig,
}

/// BLIP captioner (`vision_model.onnx` + `text_decoder.onnx`).
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CaptionConfig {
    #[serde(deserialize_with = "deserialize_blip_preprocess")]
    pub preprocess: PreprocessConfig,
    pub bos_token_id: i64,
    pub eos_token_id: i64,
    pub pad_token_id: i64,
    pub max_length: usize,
    pub num_beams: usize,
    pub length_penalty: f32,
}

impl Default for CaptionConfig {
    fn default() -> Self {
        Self {
            preprocess: blip_preprocess(),
            bos_token_id: 30522,
            eos_token_id: 102,
            pad_token_id: 0,
            max_length: 50,
            num_beams: 5,
            length_penalty: 1.0,
        }
    }
}

/// Stable Diffusion pipeline (`text_encoder.onnx`, `unet.onnx`, `vae_decoder.onnx`).
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DiffusionConfig {
    pub num_inference_steps: usize,
    pub guidance_scale: f32,
    pub height: u32,
    pub width: u32,
    pub context_length: usize,
    pub latent_channels: usize,
    pub vae_scale_factor: u32,
    pub vae_scaling: f32,
    pub beta_start: f64,
    pub beta_end: f64,
    pub num_train_timesteps: usize,
    /// Some exports take `input_ids` as int32, others as int64.
    pub input_ids_int32: bool,
    /// Some exports take `timestep` as int64, others as float.
    pub timestep_int64: bool,
    pub seed: Option<u64>,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            num_inference_steps: 20,
            guidance_scale: 7.5,
            height: 512,
            width: 512,
            context_length: 77,
            latent_channels: 4,
            vae_scale_factor: 8,
            vae_scaling: 0.18215,
            beta_start: 0.00085,
            beta_end: 0.012,
            num_train_timesteps: 1000,
            input_ids_int32: true,
            timestep_int64: false,
            seed: None,
        }
    }
}

impl DiffusionConfig {
    #[must_use]
    pub const fn latent_shape(&self) -> (usize, usize) {
        (
            (self.height / self.vae_scale_factor) as usize,
            (self.width / self.vae_scale_factor) as usize,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_config_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config: DiffusionConfig = load_model_config(dir.path()).unwrap();
        assert_eq!(config.num_inference_steps, 20);
        assert!((config.guidance_scale - 7.5).abs() < f32::EPSILON);
        assert_eq!(config.latent_shape(), (64, 64));
    }

    #[test]
    fn partial_config_keeps_remaining_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = fs::File::create(dir.path().join(MODEL_CONFIG_FILE)).unwrap();
        write!(file, r#"{{"num_beams": 3, "preprocess": {{"image_size": 256}}}}"#).unwrap();

        let config: CaptionConfig = load_model_config(dir.path()).unwrap();
        assert_eq!(config.num_beams, 3);
        assert_eq!(config.max_length, 50);
        assert_eq!(config.preprocess.image_size, 256);
        assert_eq!(config.preprocess.resize_mode, ResizeMode::Squash);
    }

    #[test]
    fn partial_caption_preprocess_keeps_blip_defaults() {
        let config: CaptionConfig =
            serde_json::from_str(r#"{"preprocess": {"interpolation": "bilinear"}}"#).unwrap();
        assert_eq!(config.preprocess.image_size, 384);
        assert_eq!(config.preprocess.resize_mode, ResizeMode::Squash);
        assert_eq!(config.preprocess.interpolation, "bilinear");
        assert_eq!(config.preprocess.mean, CLIP_MEAN);

        let empty: CaptionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, CaptionConfig::default());
    }

    #[test]
    fn invalid_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(MODEL_CONFIG_FILE), "{ not json").unwrap();
        assert!(load_model_config::<ClipConfig>(dir.path()).is_err());
    }

    #[test]
    fn resize_mode_parses_snake_case() {
        let cfg: PreprocessConfig = serde_json::from_str(r#"{"resize_mode": "squash"}"#).unwrap();
        assert_eq!(cfg.resize_mode, ResizeMode::Squash);
        assert_eq!(cfg.image_size, 224);
    }
}
