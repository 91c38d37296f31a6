//! Accelerator session and environment validation
//!
//! The device, its allocator and its peak counters are process-global
//! resources. `DeviceSession` wraps them in an explicit handle so every
//! measurement step drains and resets through the same object instead of
//! touching ambient state.

use anyhow::{bail, Result};
use candle_core::Device;

/// Environment variable naming the visible accelerator devices.
pub const VISIBLE_DEVICES_VAR: &str = "CUDA_VISIBLE_DEVICES";

/// Count the devices named by the visibility variable.
///
/// The benchmark only supports a single visible device: with several devices
/// the placement of tensors becomes ambiguous and the driver-level memory
/// readings stop being attributable to the workload.
pub fn visible_device_count(value: Option<&str>) -> Result<usize> {
    let Some(value) = value else {
        bail!("{VISIBLE_DEVICES_VAR} is not set; set it to a single device index");
    };
    Ok(value
        .split(',')
        .filter(|part| !part.trim().is_empty())
        .count())
}

/// Handle over the accelerator device used for the whole benchmark run.
#[derive(Debug)]
pub struct DeviceSession {
    device: Device,
}

impl DeviceSession {
    /// Acquire the single visible accelerator device.
    ///
    /// Fails when no accelerator is available or when the environment makes
    /// more than one device visible. Multi-device benchmarking is
    /// unsupported.
    #[cfg(feature = "cuda")]
    pub fn acquire() -> Result<Self> {
        let visible = visible_device_count(std::env::var(VISIBLE_DEVICES_VAR).ok().as_deref())?;
        if visible != 1 {
            bail!(
                "{VISIBLE_DEVICES_VAR} names {visible} devices; set it to a single device index, \
                 this benchmark is not tested for multi-device setups"
            );
        }
        let device = match Device::new_cuda(0) {
            Ok(device) => device,
            Err(err) => bail!("a cuda device is necessary to run the benchmark: {err}"),
        };
        Ok(Self { device })
    }

    /// Acquire the single visible accelerator device.
    ///
    /// This build was produced without the `cuda` feature, so acquisition
    /// fails immediately with the missing feature named instead of failing
    /// later inside the model stack.
    #[cfg(not(feature = "cuda"))]
    pub fn acquire() -> Result<Self> {
        bail!("`DeviceSession::acquire` requires the `cuda` feature; rebuild with `--features cuda`");
    }

    /// CPU-backed session, used by tests and offline tooling. The benchmark
    /// binary always goes through [`DeviceSession::acquire`].
    pub fn cpu() -> Self {
        Self { device: Device::Cpu }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Drain all pending device work. Every timed interval is bracketed by
    /// this barrier so measurements do not overlap queued kernels.
    pub fn synchronize(&self) -> Result<()> {
        self.device.synchronize()?;
        Ok(())
    }
}
