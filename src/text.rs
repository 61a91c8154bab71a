use crate::error::{DetectError, Result};
use crate::onnx::{extract_output, Device, OnnxSession};
use ndarray::{Array2, Array3};
use ort::value::Value;
use std::path::Path;
use tokenizers::{PaddingParams, PaddingStrategy, Tokenizer, TruncationParams};

const PAD_TOKENS: &[&str] = &["<|endoftext|>", "<pad>", "[PAD]"];

/// CLIP text encoder used to condition the diffusion UNet.
pub struct PromptEncoder {
    pub session: OnnxSession,
    tokenizer: Tokenizer,
    context_length: usize,
    input_ids_int32: bool,
    id_name: String,
}

impl PromptEncoder {
    pub fn new(
        model_path: &Path,
        tokenizer_path: &Path,
        context_length: usize,
        input_ids_int32: bool,
        device: Device,
    ) -> Result<Self> {
        let session = OnnxSession::new(model_path, device)?;
        let mut tokenizer = Tokenizer::from_file(tokenizer_path)
            .map_err(|e| DetectError::Tokenizer(e.to_string()))?;

        let vocab = tokenizer.get_vocab(true);
        let pad_id = PAD_TOKENS
            .iter()
            .find_map(|t| vocab.get(*t).copied())
            .ok_or_else(|| DetectError::Config("No pad token found in tokenizer".into()))?;

        tokenizer
            .with_padding(Some(PaddingParams {
                strategy: PaddingStrategy::Fixed(context_length),
                pad_id,
                ..Default::default()
            }))
            .with_truncation(Some(TruncationParams {
                max_length: context_length,
                ..Default::default()
            }))
            .map_err(|e| DetectError::Tokenizer(e.to_string()))?;

        let id_name = session.require_input(&["input_ids"])?;

        Ok(Self {
            session,
            tokenizer,
            context_length,
            input_ids_int32,
            id_name,
        })
    }

    pub fn tokenize<T: AsRef<str>>(&self, texts: &[T]) -> Result<Array2<i64>> {
        let texts: Vec<&str> = texts.iter().map(AsRef::as_ref).collect();
        let encodings = self
            .tokenizer
            .encode_batch(texts, true)
            .map_err(|e| DetectError::Tokenizer(e.to_string()))?;

        let ids: Vec<i64> = encodings
            .iter()
            .flat_map(|e| e.get_ids().iter().map(|&x| i64::from(x)))
            .collect();
        Ok(Array2::from_shape_vec(
            (encodings.len(), self.context_length),
            ids,
        )?)
    }

    /// Hidden states `(batch, context_length, hidden)` for each prompt.
    pub fn encode<T: AsRef<str>>(&mut self, texts: &[T]) -> Result<Array3<f32>> {
        let ids = self.tokenize(texts)?;
        let outputs = if self.input_ids_int32 {
            #[allow(clippy::cast_possible_truncation)]
            let ids = ids.mapv(|x| x as i32);
            self.session
                .session
                .run(ort::inputs![self.id_name.as_str() => Value::from_array(ids)?])?
        } else {
            self.session
                .session
                .run(ort::inputs![self.id_name.as_str() => Value::from_array(ids)?])?
        };

        extract_output(&outputs[0])?
            .into_dimensionality::<ndarray::Ix3>()
            .map_err(|e| DetectError::Inference(e.to_string()))
    }
}
