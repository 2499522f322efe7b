//! Device resolution and precision handling.

use crate::error::{TuningError, TuningResult, TuningWarning};
use crate::peft::PromptTunedModel;
use crate::settings::Settings;
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Sentinel accepted in place of a device id to request auto-detection.
pub const DETECT_DEVICE: &str = "__DETECT__";

/// Upper bound on CUDA ordinals probed by [`CandleAccelerator::detect`].
const MAX_PROBED_DEVICES: usize = 16;

/// Device requested by a caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeviceRequest {
    /// Prefer an accelerator when the runtime reports one.
    #[default]
    Detect,
    /// User override, returned unchanged.
    Explicit(String),
}

impl From<&str> for DeviceRequest {
    fn from(value: &str) -> Self {
        match value {
            DETECT_DEVICE | "auto" => Self::Detect,
            other => Self::Explicit(other.to_string()),
        }
    }
}

/// Runtime accelerator availability.
pub trait Accelerator: Send + Sync {
    /// Number of accelerator devices visible to this process.
    fn device_count(&self) -> usize;

    fn is_available(&self) -> bool {
        self.device_count() > 0
    }

    /// Whether bfloat16 kernels run on the accelerator.
    fn supports_bf16(&self) -> bool;

    /// Release cached accelerator memory.
    fn empty_cache(&self) -> TuningResult<()>;
}

/// Accelerator state probed from the candle runtime once at construction.
#[derive(Debug, Clone, Copy)]
pub struct CandleAccelerator {
    device_count: usize,
    bf16: bool,
}

impl CandleAccelerator {
    #[must_use]
    pub fn detect() -> Self {
        if !candle_core::utils::cuda_is_available() {
            return Self { device_count: 0, bf16: false };
        }

        let device_count =
            (0..MAX_PROBED_DEVICES).take_while(|ordinal| Device::new_cuda(*ordinal).is_ok()).count();
        let bf16 = device_count > 0
            && Device::new_cuda(0)
                .and_then(|device| Tensor::zeros(4, DType::BF16, &device))
                .and_then(|t| t.affine(2.0, 1.0))
                .is_ok();

        tracing::debug!(device_count, bf16, "Probed CUDA accelerators");
        Self { device_count, bf16 }
    }
}

impl Accelerator for CandleAccelerator {
    fn device_count(&self) -> usize {
        self.device_count
    }

    fn supports_bf16(&self) -> bool {
        self.bf16
    }

    fn empty_cache(&self) -> TuningResult<()> {
        Err(TuningError::NotImplemented(
            "the candle runtime exposes no accelerator cache clearing".to_string(),
        ))
    }
}

/// Accelerator with a fixed answer, for hosts whose topology is known up front.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaticAccelerator {
    pub device_count: usize,
    pub bf16: bool,
}

impl StaticAccelerator {
    #[must_use]
    pub fn cpu_only() -> Self {
        Self::default()
    }
}

impl Accelerator for StaticAccelerator {
    fn device_count(&self) -> usize {
        self.device_count
    }

    fn supports_bf16(&self) -> bool {
        self.bf16
    }

    fn empty_cache(&self) -> TuningResult<()> {
        Ok(())
    }
}

/// Resolve a device request into a concrete device id.
///
/// `None` means computation stays on the host processor.
pub fn resolve_device(request: &DeviceRequest, accelerator: &dyn Accelerator) -> Option<String> {
    match request {
        DeviceRequest::Explicit(device) => Some(device.clone()),
        DeviceRequest::Detect => {
            let device = accelerator.is_available().then(|| "cuda".to_string());
            tracing::debug!(device = ?device, "Using device");
            device
        }
    }
}

/// Map a resolved device id onto a candle device.
pub fn candle_device(device: Option<&str>) -> TuningResult<Device> {
    let Some(device) = device else {
        return Ok(Device::Cpu);
    };

    match device {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Ok(Device::new_cuda(0)?),
        "metal" | "mps" => Ok(Device::new_metal(0)?),
        other => {
            let ordinal = other
                .strip_prefix("cuda:")
                .and_then(|o| o.parse::<usize>().ok())
                .ok_or_else(|| TuningError::Configuration(format!("unknown device: {other}")))?;
            Ok(Device::new_cuda(ordinal)?)
        }
    }
}

/// Numeric precision of the trainable model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Float32,
    Float16,
    BFloat16,
    Float64,
}

impl Precision {
    /// Portable name recorded in manifests (`"float32"`, `"bfloat16"`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float16 => "float16",
            Self::BFloat16 => "bfloat16",
            Self::Float64 => "float64",
        }
    }

    #[must_use]
    pub fn dtype(self) -> DType {
        match self {
            Self::Float32 => DType::F32,
            Self::Float16 => DType::F16,
            Self::BFloat16 => DType::BF16,
            Self::Float64 => DType::F64,
        }
    }

    pub fn from_dtype(dtype: DType) -> TuningResult<Self> {
        match dtype {
            DType::F32 => Ok(Self::Float32),
            DType::F16 => Ok(Self::Float16),
            DType::BF16 => Ok(Self::BFloat16),
            DType::F64 => Ok(Self::Float64),
            other => Err(TuningError::Configuration(format!(
                "{other:?} is not a floating point precision"
            ))),
        }
    }

    /// Explicit request wins; otherwise the configured default applies.
    pub fn resolve(requested: Option<&str>, settings: &Settings) -> TuningResult<Self> {
        requested.unwrap_or(&settings.torch_dtype).parse()
    }
}

impl FromStr for Precision {
    type Err = TuningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        let name = name.strip_prefix("torch.").unwrap_or(name);
        match name.to_ascii_lowercase().as_str() {
            "float32" | "float" | "fp32" | "f32" => Ok(Self::Float32),
            "float16" | "half" | "fp16" | "f16" => Ok(Self::Float16),
            "bfloat16" | "bf16" => Ok(Self::BFloat16),
            "float64" | "double" | "fp64" | "f64" => Ok(Self::Float64),
            _ => Err(TuningError::Configuration(format!("unsupported torch_dtype: {s}"))),
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of moving a model onto a device and precision.
#[derive(Debug, Clone)]
pub struct Conversion {
    pub device: Device,
    pub precision: Precision,
    pub warning: Option<TuningWarning>,
}

/// Pick the precision a device can actually run, falling back to float32 for
/// bfloat16 on hosts without bfloat16 support.
pub fn effective_precision(
    device: Option<&str>,
    precision: Precision,
    accelerator: &dyn Accelerator,
) -> (Precision, Option<TuningWarning>) {
    let on_host = matches!(device, None | Some("cpu"));
    if precision == Precision::BFloat16 && (on_host || !accelerator.supports_bf16()) {
        let warning = TuningWarning::UnsupportedPrecision {
            requested: precision.to_string(),
            fallback: Precision::Float32.to_string(),
        };
        warning.emit();
        return (Precision::Float32, Some(warning));
    }
    (precision, None)
}

/// Move `model` to `device` in `precision` in one step.
pub fn convert_model(
    device: Option<&str>,
    model: &mut PromptTunedModel,
    precision: Precision,
    accelerator: &dyn Accelerator,
) -> TuningResult<Conversion> {
    let (precision, warning) = effective_precision(device, precision, accelerator);
    let target = candle_device(device)?;
    model.to(&target, precision.dtype())?;
    Ok(Conversion { device: target, precision, warning })
}
