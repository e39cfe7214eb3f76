use anyhow::bail;

use super::{Delegate, RuntimeLocation};

/// The ONNX inference backends a [`RuntimeLocation`] can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnnxBackend {
    /// Pure-Rust CPU inference through `tract`.
    Tract,
}

impl OnnxBackend {
    pub(super) fn from_location(location: &RuntimeLocation) -> anyhow::Result<Self> {
        match location.as_str().trim().to_ascii_lowercase().as_str() {
            "tract" | "builtin:tract" => Ok(Self::Tract),
            "" => bail!("no runtime location configured"),
            "onnxruntime" | "ort" => {
                bail!("runtime '{location}' is not available in this build")
            }
            _ => bail!("unknown runtime '{location}'"),
        }
    }

    /// The delegate this backend will actually use when `requested` is asked for.
    pub fn effective_delegate(&self, requested: Delegate) -> Delegate {
        match (self, requested) {
            (Self::Tract, Delegate::Gpu) => {
                log::info!("{self:?} has no GPU support, falling back to CPU inference");
                Delegate::Cpu
            }
            (Self::Tract, Delegate::Cpu) => Delegate::Cpu,
        }
    }
}
