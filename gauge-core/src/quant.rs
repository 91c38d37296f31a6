//! Quantization descriptors
//!
//! A quantized model directory carries a side-band `quantization_config.json`
//! describing how the weights were produced. The descriptors only feed the
//! result log and the kernel selection; the quantized inference path itself
//! treats them as opaque.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// File name of the side-band config inside a quantized model directory.
pub const QUANTIZATION_CONFIG_FILE: &str = "quantization_config.json";

/// Parameters the quantizer recorded next to the weights.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QuantizationConfig {
    /// Activation-order flag
    pub desc_act: bool,
    pub bits: u32,
    pub group_size: i64,
}

impl QuantizationConfig {
    pub fn from_model_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(QUANTIZATION_CONFIG_FILE);
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Inference kernel used for the quantized path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kernel {
    Exllama,
    Cuda,
    CudaOld,
}

impl Kernel {
    /// Name as it appears in the result log. The `autotogptq-cuda` spelling
    /// is part of the historical log format and must not be corrected.
    pub fn csv_name(self) -> &'static str {
        match self {
            Kernel::Exllama => "exllama",
            Kernel::Cuda => "autotogptq-cuda",
            Kernel::CudaOld => "autogptq-cuda-old",
        }
    }
}

/// Pick the kernel for a quantized run. The exllama kernel handles both the
/// act-order and no-act-order cases; when it is disabled the act-order flag
/// decides between the two CUDA kernels.
pub fn select_kernel(disable_exllama: bool, desc_act: bool) -> Kernel {
    if !disable_exllama {
        Kernel::Exllama
    } else if desc_act {
        Kernel::Cuda
    } else {
        Kernel::CudaOld
    }
}

/// Quantization columns of one result row. All `None` for dense runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuantizationDescriptors {
    pub used: bool,
    pub act_order: Option<bool>,
    pub bits: Option<u32>,
    pub group_size: Option<i64>,
    pub kernel: Option<Kernel>,
}

impl QuantizationDescriptors {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn from_config(config: &QuantizationConfig, kernel: Kernel) -> Self {
        Self {
            used: true,
            act_order: Some(config.desc_act),
            bits: Some(config.bits),
            group_size: Some(config.group_size),
            kernel: Some(kernel),
        }
    }
}
