use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("ONNX error: {0}")]
    Onnx(#[from] ort::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Shape/Tensor error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("Tokenization error: {0}")]
    Tokenizer(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Inference error: {0}")]
    Inference(String),
    #[error("Number of files must match number of captions ({files} files, {captions} captions)")]
    MismatchedUpload { files: usize, captions: usize },
    #[error("No reference images uploaded. Please upload references first.")]
    NoReferences,
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("{0} model not loaded")]
    ModelNotLoaded(&'static str),
}

impl DetectError {
    /// Errors caused by the request itself rather than by the service.
    #[must_use]
    pub const fn is_client_error(&self) -> bool {
        matches!(self, Self::MismatchedUpload { .. } | Self::NoReferences)
    }
}

pub type Result<T> = std::result::Result<T, DetectError>;
