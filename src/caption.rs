use crate::config::{load_model_config, CaptionConfig};
use crate::error::{DetectError, Result};
use crate::onnx::{extract_output, Device, OnnxSession};
use crate::vision::preprocess_batch;
use image::DynamicImage;
use ndarray::{s, Array2, Array3, ArrayView1, Axis};
use ort::value::Value;
use std::cmp::Ordering;
use std::path::Path;
use tokenizers::Tokenizer;

/// Decoding parameters for [`beam_search`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BeamParams {
    pub num_beams: usize,
    pub max_length: usize,
    pub bos_token_id: i64,
    pub eos_token_id: i64,
    pub length_penalty: f32,
}

impl From<&CaptionConfig> for BeamParams {
    fn from(config: &CaptionConfig) -> Self {
        Self {
            num_beams: config.num_beams.max(1),
            max_length: config.max_length,
            bos_token_id: config.bos_token_id,
            eos_token_id: config.eos_token_id,
            length_penalty: config.length_penalty,
        }
    }
}

#[derive(Debug, Clone)]
struct Hypothesis {
    tokens: Vec<i64>,
    score: f32,
}

impl BeamParams {
    #[allow(clippy::cast_precision_loss)]
    fn normalized(&self, log_prob: f32, len: usize) -> f32 {
        log_prob / (len as f32).powf(self.length_penalty)
    }
}

fn log_softmax(logits: ArrayView1<f32>) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = logits.iter().map(|&x| (x - max).exp()).sum::<f32>().ln();
    logits.iter().map(|&x| x - max - log_sum).collect()
}

/// Indices of the `k` largest values, best first.
fn top_k(values: &[f32], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..values.len()).collect();
    let by_value = |a: &usize, b: &usize| {
        values[*b]
            .partial_cmp(&values[*a])
            .unwrap_or(Ordering::Equal)
    };
    if k < idx.len() {
        idx.select_nth_unstable_by(k, by_value);
        idx.truncate(k);
    }
    idx.sort_by(by_value);
    idx
}

/// Beam search over a decoder.
///
/// `step` receives the live sequences (all of equal length) and returns the
/// next-token logits for each, shaped `(sequences, vocab)`. The result is the
/// best sequence including the BOS token and excluding EOS.
pub fn beam_search<F>(params: &BeamParams, mut step: F) -> Result<Vec<i64>>
where
    F: FnMut(&[Vec<i64>]) -> Result<Array2<f32>>,
{
    let num_beams = params.num_beams.max(1);
    let mut beams = vec![Hypothesis {
        tokens: vec![params.bos_token_id],
        score: 0.0,
    }];
    let mut finished: Vec<Hypothesis> = Vec::new();

    while beams[0].tokens.len() < params.max_length {
        let sequences: Vec<Vec<i64>> = beams.iter().map(|b| b.tokens.clone()).collect();
        let logits = step(&sequences)?;
        if logits.nrows() != beams.len() {
            return Err(DetectError::Inference(format!(
                "decoder returned {} rows for {} beams",
                logits.nrows(),
                beams.len()
            )));
        }

        let mut candidates: Vec<(f32, usize, i64)> = Vec::new();
        for (beam_idx, row) in logits.axis_iter(Axis(0)).enumerate() {
            let log_probs = log_softmax(row);
            for token in top_k(&log_probs, 2 * num_beams) {
                #[allow(clippy::cast_possible_wrap)]
                let token_id = token as i64;
                candidates.push((beams[beam_idx].score + log_probs[token], beam_idx, token_id));
            }
        }
        candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(Ordering::Equal));

        let mut next = Vec::with_capacity(num_beams);
        for (rank, &(score, beam_idx, token)) in candidates.iter().enumerate() {
            if token == params.eos_token_id {
                if rank < num_beams {
                    let tokens = beams[beam_idx].tokens.clone();
                    let len = tokens.len();
                    finished.push(Hypothesis {
                        tokens,
                        score: params.normalized(score, len),
                    });
                }
            } else {
                let mut tokens = beams[beam_idx].tokens.clone();
                tokens.push(token);
                next.push(Hypothesis { tokens, score });
            }
            if next.len() == num_beams {
                break;
            }
        }

        finished.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        finished.truncate(num_beams);

        if next.is_empty() {
            beams.clear();
            break;
        }
        beams = next;

        if finished.len() == num_beams {
            let worst_finished = finished[num_beams - 1].score;
            let best_live = params.normalized(beams[0].score, beams[0].tokens.len());
            if best_live <= worst_finished {
                beams.clear();
                break;
            }
        }
    }

    for beam in beams {
        let len = beam.tokens.len();
        finished.push(Hypothesis {
            score: params.normalized(beam.score, len),
            tokens: beam.tokens,
        });
    }

    finished
        .into_iter()
        .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(Ordering::Equal))
        .map(|h| h.tokens)
        .ok_or_else(|| DetectError::Inference("beam search produced no hypothesis".into()))
}

/// BLIP image captioner: vision encoder plus autoregressive text decoder.
pub struct Captioner {
    pub encoder: OnnxSession,
    pub decoder: OnnxSession,
    pub config: CaptionConfig,
    tokenizer: Tokenizer,
    pixel_name: String,
    encoder_mask_name: Option<String>,
}

impl Captioner {
    pub fn new(model_dir: &Path, device: Device) -> Result<Self> {
        let config: CaptionConfig = load_model_config(model_dir)?;
        let encoder = OnnxSession::new(model_dir.join("vision_model.onnx"), device)?;
        let decoder = OnnxSession::new(model_dir.join("text_decoder.onnx"), device)?;
        let tokenizer = Tokenizer::from_file(model_dir.join("tokenizer.json"))
            .map_err(|e| DetectError::Tokenizer(e.to_string()))?;

        let pixel_name = encoder.require_input(&["pixel_values", "input"])?;
        decoder.require_input(&["input_ids"])?;
        decoder.require_input(&["encoder_hidden_states"])?;
        let encoder_mask_name = decoder.find_input(&["encoder_attention_mask"]);

        Ok(Self {
            encoder,
            decoder,
            config,
            tokenizer,
            pixel_name,
            encoder_mask_name,
        })
    }

    /// Encoder hidden states for one image, shaped `(1, patches, hidden)`.
    pub fn encode_image(&mut self, image: &DynamicImage) -> Result<Array3<f32>> {
        let pixels = preprocess_batch(std::slice::from_ref(image), &self.config.preprocess)?;
        let outputs = self
            .encoder
            .session
            .run(ort::inputs![self.pixel_name.as_str() => Value::from_array(pixels)?])?;
        extract_output(&outputs[0])?
            .into_dimensionality::<ndarray::Ix3>()
            .map_err(|e| DetectError::Inference(e.to_string()))
    }

    /// Generate a caption with beam search.
    pub fn describe(&mut self, image: &DynamicImage) -> Result<String> {
        let image_embeds = self.encode_image(image)?;
        let params = BeamParams::from(&self.config);
        let decoder = &mut self.decoder;
        let encoder_mask_name = self.encoder_mask_name.as_deref();

        let tokens = beam_search(&params, |sequences| {
            decode_step(decoder, encoder_mask_name, &image_embeds, sequences)
        })?;

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let ids: Vec<u32> = tokens.iter().map(|&t| t as u32).collect();
        let text = self
            .tokenizer
            .decode(&ids, true)
            .map_err(|e| DetectError::Tokenizer(e.to_string()))?;
        tracing::debug!(tokens = ids.len(), "caption decoded");
        Ok(text.trim().to_string())
    }
}

fn decode_step(
    decoder: &mut OnnxSession,
    encoder_mask_name: Option<&str>,
    image_embeds: &Array3<f32>,
    sequences: &[Vec<i64>],
) -> Result<Array2<f32>> {
    let batch = sequences.len();
    let seq_len = sequences.first().map_or(0, Vec::len);
    let flat: Vec<i64> = sequences.iter().flatten().copied().collect();
    let input_ids = Array2::from_shape_vec((batch, seq_len), flat)?;
    let attention_mask = Array2::<i64>::ones((batch, seq_len));

    let (_, patches, hidden) = image_embeds.dim();
    let encoder_states = image_embeds
        .broadcast((batch, patches, hidden))
        .ok_or_else(|| DetectError::Inference("cannot broadcast image embeddings".into()))?
        .to_owned();

    let mut inputs = ort::inputs![
        "input_ids" => Value::from_array(input_ids)?,
        "attention_mask" => Value::from_array(attention_mask)?,
        "encoder_hidden_states" => Value::from_array(encoder_states)?,
    ];
    if let Some(name) = encoder_mask_name {
        let mask = Array2::<i64>::ones((batch, patches));
        inputs.push((name.to_string().into(), Value::from_array(mask)?.into()));
    }

    let outputs = decoder.session.run(inputs)?;
    let logits = extract_output(&outputs[0])?
        .into_dimensionality::<ndarray::Ix3>()
        .map_err(|e| DetectError::Inference(e.to_string()))?;
    Ok(logits.slice(s![.., seq_len - 1, ..]).to_owned())
}
