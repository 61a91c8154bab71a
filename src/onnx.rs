use crate::error::{DetectError, Result};
use ndarray::{ArrayD, ArrayView, IxDyn};
use ort::execution_providers::{CPUExecutionProvider, CUDAExecutionProvider, ExecutionProvider};
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::DynValue;
use std::path::Path;

/// Where the sessions run. Reported by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda,
}

impl Device {
    /// The device sessions will actually run on. CUDA falls back to the CPU
    /// when the provider is missing from the ONNX Runtime build.
    #[must_use]
    pub fn active(self) -> Self {
        match self {
            Self::Cpu => Self::Cpu,
            Self::Cuda => match CUDAExecutionProvider::default().is_available() {
                Ok(true) => Self::Cuda,
                Ok(false) => {
                    tracing::warn!("CUDA execution provider unavailable, running on cpu");
                    Self::Cpu
                }
                Err(e) => {
                    tracing::warn!(error = %e, "CUDA availability check failed, running on cpu");
                    Self::Cpu
                }
            },
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => f.write_str("cpu"),
            Self::Cuda => f.write_str("cuda"),
        }
    }
}

pub struct OnnxSession {
    pub session: Session,
}

impl OnnxSession {
    pub fn new(path: impl AsRef<Path>, device: Device) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(DetectError::Config(format!(
                "ONNX model not found: {}",
                path.display()
            )));
        }

        let threads = num_cpus::get();
        let builder = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(threads)?;
        let builder = match device {
            Device::Cuda => builder.with_execution_providers([
                CUDAExecutionProvider::default().build(),
                CPUExecutionProvider::default().build(),
            ])?,
            Device::Cpu => {
                builder.with_execution_providers([CPUExecutionProvider::default().build()])?
            }
        };
        let session = builder.commit_from_file(path)?;
        tracing::debug!(model = %path.display(), %device, "ONNX session ready");

        Ok(Self { session })
    }

    /// Helper to check if the model expects a specific input name
    #[must_use]
    pub fn has_input(&self, name: &str) -> bool {
        self.session.inputs.iter().any(|i| i.name == name)
    }

    /// Helper to find the first likely input name for a specific role
    #[must_use]
    pub fn find_input(&self, possibilities: &[&str]) -> Option<String> {
        possibilities
            .iter()
            .find(|p| self.has_input(p))
            .map(|p| (*p).to_string())
    }

    /// Like [`Self::find_input`], but a missing node is a configuration error.
    pub fn require_input(&self, possibilities: &[&str]) -> Result<String> {
        self.find_input(possibilities).ok_or_else(|| {
            DetectError::Config(format!(
                "Could not find any of the input nodes {possibilities:?}"
            ))
        })
    }
}

/// Copy a float output tensor into an owned dynamic-rank array.
pub fn extract_output(value: &DynValue) -> Result<ArrayD<f32>> {
    let (shape, data) = value.try_extract_tensor::<f32>()?;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let shape_usize: Vec<usize> = shape.iter().map(|&x| x as usize).collect();
    let view = ArrayView::from_shape(IxDyn(&shape_usize), data)?;
    Ok(view.to_owned())
}
