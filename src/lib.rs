#![allow(clippy::missing_errors_doc)]
pub mod caption;
pub mod config;
pub mod diffusion;
pub mod error;
pub mod models;
pub mod onnx;
pub mod references;
pub mod server;
pub mod text;
pub mod viewer;
pub mod vision;

pub use caption::Captioner;
pub use diffusion::ImageGenerator;
pub use error::{DetectError, Result};
pub use models::{ModelPaths, ModelSet};
pub use onnx::Device;
pub use references::{Classification, Label, ReferenceStore, SIMILARITY_THRESHOLD};
pub use text::PromptEncoder;
pub use vision::VisionEmbedder;
