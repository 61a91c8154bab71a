use crate::config::{load_model_config, DiffusionConfig};
use crate::error::{DetectError, Result};
use crate::onnx::{extract_output, Device, OnnxSession};
use crate::text::PromptEncoder;
use base64::Engine;
use image::{ImageFormat, RgbImage};
use ndarray::{concatenate, s, Array1, Array3, Array4, Axis};
use ort::value::Value;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::io::Cursor;
use std::path::Path;

/// Euler discrete scheduler over a scaled-linear beta schedule.
#[derive(Debug, Clone)]
pub struct EulerScheduler {
    pub timesteps: Vec<f64>,
    /// One sigma per timestep plus a trailing zero.
    pub sigmas: Vec<f64>,
}

impl EulerScheduler {
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    #[must_use]
    pub fn new(config: &DiffusionConfig) -> Self {
        let n = config.num_train_timesteps.max(2);
        let (start, end) = (config.beta_start.sqrt(), config.beta_end.sqrt());

        let mut alpha_cumprod = 1.0;
        let train_sigmas: Vec<f64> = (0..n)
            .map(|i| {
                let beta = (start + (end - start) * i as f64 / (n - 1) as f64).powi(2);
                alpha_cumprod *= 1.0 - beta;
                ((1.0 - alpha_cumprod) / alpha_cumprod).sqrt()
            })
            .collect();

        let steps = config.num_inference_steps.max(1);
        let last = (n - 1) as f64;
        let timesteps: Vec<f64> = (0..steps)
            .map(|i| {
                if steps == 1 {
                    last
                } else {
                    last * (steps - 1 - i) as f64 / (steps - 1) as f64
                }
            })
            .collect();

        let mut sigmas: Vec<f64> = timesteps
            .iter()
            .map(|&t| {
                let low = t.floor() as usize;
                let high = (low + 1).min(n - 1);
                let frac = t - low as f64;
                train_sigmas[low] * (1.0 - frac) + train_sigmas[high] * frac
            })
            .collect();
        sigmas.push(0.0);

        Self { timesteps, sigmas }
    }

    #[must_use]
    pub fn init_noise_sigma(&self) -> f64 {
        self.sigmas[0]
    }

    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn scale_model_input(&self, latents: &Array4<f32>, step: usize) -> Array4<f32> {
        let sigma = self.sigmas[step];
        let scale = (sigma.mul_add(sigma, 1.0)).sqrt() as f32;
        latents / scale
    }

    /// Advance `latents` one step given the predicted noise.
    #[allow(clippy::cast_possible_truncation)]
    #[must_use]
    pub fn step(&self, noise_pred: &Array4<f32>, step: usize, latents: &Array4<f32>) -> Array4<f32> {
        let dt = (self.sigmas[step + 1] - self.sigmas[step]) as f32;
        latents + &(noise_pred * dt)
    }
}

/// Stable Diffusion text-to-image pipeline.
pub struct ImageGenerator {
    pub text_encoder: PromptEncoder,
    pub unet: OnnxSession,
    pub vae_decoder: OnnxSession,
    pub config: DiffusionConfig,
    scheduler: EulerScheduler,
    rng: StdRng,
}

impl ImageGenerator {
    pub fn new(model_dir: &Path, device: Device) -> Result<Self> {
        let config: DiffusionConfig = load_model_config(model_dir)?;
        let text_encoder = PromptEncoder::new(
            &model_dir.join("text_encoder.onnx"),
            &model_dir.join("tokenizer.json"),
            config.context_length,
            config.input_ids_int32,
            device,
        )?;
        let unet = OnnxSession::new(model_dir.join("unet.onnx"), device)?;
        let vae_decoder = OnnxSession::new(model_dir.join("vae_decoder.onnx"), device)?;
        for name in ["sample", "timestep", "encoder_hidden_states"] {
            unet.require_input(&[name])?;
        }
        vae_decoder.require_input(&["latent_sample"])?;

        let scheduler = EulerScheduler::new(&config);
        let rng = config
            .seed
            .map_or_else(StdRng::from_os_rng, StdRng::seed_from_u64);

        Ok(Self {
            text_encoder,
            unet,
            vae_decoder,
            config,
            scheduler,
            rng,
        })
    }

    /// Generate one image for `prompt`.
    pub fn generate(&mut self, prompt: &str) -> Result<RgbImage> {
        let embeddings = self.text_encoder.encode(&["", prompt])?;
        let (height, width) = self.config.latent_shape();
        let shape = (1, self.config.latent_channels, height, width);

        #[allow(clippy::cast_possible_truncation)]
        let init_sigma = self.scheduler.init_noise_sigma() as f32;
        let rng = &mut self.rng;
        let mut latents =
            Array4::from_shape_simple_fn(shape, || rng.sample::<f32, _>(StandardNormal) * init_sigma);

        let timesteps = self.scheduler.timesteps.clone();
        for (step, &t) in timesteps.iter().enumerate() {
            let scaled = self.scheduler.scale_model_input(&latents, step);
            let model_input = concatenate(Axis(0), &[scaled.view(), scaled.view()])?;
            let noise = self.predict_noise(model_input, t, &embeddings)?;

            let uncond = noise.slice(s![0..1, .., .., ..]);
            let cond = noise.slice(s![1..2, .., .., ..]);
            let guided = &uncond + &((&cond - &uncond) * self.config.guidance_scale);

            latents = self.scheduler.step(&guided, step, &latents);
            tracing::debug!(step, timestep = t, "denoising step done");
        }

        self.decode_latents(&(latents / self.config.vae_scaling))
    }

    #[allow(clippy::cast_possible_truncation)]
    fn predict_noise(
        &mut self,
        model_input: Array4<f32>,
        timestep: f64,
        embeddings: &Array3<f32>,
    ) -> Result<Array4<f32>> {
        let sample = Value::from_array(model_input)?;
        let hidden = Value::from_array(embeddings.clone())?;
        let outputs = if self.config.timestep_int64 {
            let t = Array1::from_elem(1, timestep.round() as i64);
            self.unet.session.run(ort::inputs![
                "sample" => sample,
                "timestep" => Value::from_array(t)?,
                "encoder_hidden_states" => hidden,
            ])?
        } else {
            let t = Array1::from_elem(1, timestep as f32);
            self.unet.session.run(ort::inputs![
                "sample" => sample,
                "timestep" => Value::from_array(t)?,
                "encoder_hidden_states" => hidden,
            ])?
        };
        extract_output(&outputs[0])?
            .into_dimensionality::<ndarray::Ix4>()
            .map_err(|e| DetectError::Inference(e.to_string()))
    }

    fn decode_latents(&mut self, latents: &Array4<f32>) -> Result<RgbImage> {
        let outputs = self.vae_decoder.session.run(ort::inputs![
            "latent_sample" => Value::from_array(latents.clone())?
        ])?;
        let decoded = extract_output(&outputs[0])?
            .into_dimensionality::<ndarray::Ix4>()
            .map_err(|e| DetectError::Inference(e.to_string()))?;
        Ok(tensor_to_image(&decoded.index_axis(Axis(0), 0).to_owned()))
    }
}

/// Map a `(3, H, W)` tensor in `[-1, 1]` to an RGB image.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
#[must_use]
pub fn tensor_to_image(tensor: &Array3<f32>) -> RgbImage {
    let (_, height, width) = tensor.dim();
    RgbImage::from_fn(width as u32, height as u32, |x, y| {
        let px = |c: usize| {
            let v = (tensor[[c, y as usize, x as usize]] / 2.0 + 0.5).clamp(0.0, 1.0);
            (v * 255.0).round() as u8
        };
        image::Rgb([px(0), px(1), px(2)])
    })
}

pub fn encode_png(image: &RgbImage) -> Result<Vec<u8>> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

/// Encode an image as a `data:image/png;base64,...` URI.
pub fn png_data_uri(image: &RgbImage) -> Result<String> {
    let encoded = base64::engine::general_purpose::STANDARD.encode(encode_png(image)?);
    Ok(format!("data:image/png;base64,{encoded}"))
}
