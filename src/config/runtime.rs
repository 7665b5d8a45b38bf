//! Process-wide runtime settings
//!
//! These settings live outside any single `optimize` call. The pipeline
//! takes a snapshot ([`runtime_config`]) at entry and only reads that copy.

use crate::backend::DeviceClass;
use crate::config_error;
use crate::error::{ForgeError, ForgeResult};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::RwLock;
use tracing::warn;

static RUNTIME: Lazy<RwLock<RuntimeConfig>> = Lazy::new(|| RwLock::new(RuntimeConfig::default()));

/// Whether convolution weights are converted to channels-last
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ChannelsLastMode {
    /// Host always; accelerators only with 2D block-array support
    #[default]
    Auto,
    Enabled,
    Disabled,
}

/// Graph capture backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum CompilerBackend {
    /// Trace and freeze static segments
    #[default]
    Trace,
    /// Keep segments as interpreted module copies
    Interpret,
}

impl std::str::FromStr for CompilerBackend {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" | "torchscript" => Ok(CompilerBackend::Trace),
            "interpret" | "inductor" => Ok(CompilerBackend::Interpret),
            other => Err(config_error!(
                "unknown compiler backend '{}', expected 'trace' or 'interpret'",
                other
            )),
        }
    }
}

/// Precision allowed for implicit FP32 math
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum Fp32MathMode {
    #[default]
    Fp32,
    /// TensorFloat-32 (accelerator only)
    Tf32,
    /// Inputs rounded to BF16 before FP32 accumulation
    Bf32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RuntimeConfig {
    pub channels_last: ChannelsLastMode,
    pub compiler_backend: CompilerBackend,
    pub host_fp32_math: Fp32MathMode,
    pub accelerator_fp32_math: Fp32MathMode,
}

impl RuntimeConfig {
    pub fn with_channels_last(mut self, mode: ChannelsLastMode) -> Self {
        self.channels_last = mode;
        self
    }

    pub fn with_compiler_backend(mut self, backend: CompilerBackend) -> Self {
        self.compiler_backend = backend;
        self
    }

    pub fn with_fp32_math(mut self, device: DeviceClass, mode: Fp32MathMode) -> ForgeResult<Self> {
        self.set_fp32_math(device, mode)?;
        Ok(self)
    }

    pub fn fp32_math(&self, device: DeviceClass) -> Fp32MathMode {
        match device {
            DeviceClass::Host => self.host_fp32_math,
            DeviceClass::Accelerator => self.accelerator_fp32_math,
        }
    }

    /// Host rejects TF32 with a warning and keeps its current mode
    pub fn set_fp32_math(&mut self, device: DeviceClass, mode: Fp32MathMode) -> ForgeResult<()> {
        match (device, mode) {
            (DeviceClass::Host, Fp32MathMode::Tf32) => {
                warn!("TF32 math is not supported on the host, keeping {:?}", self.host_fp32_math);
            }
            (DeviceClass::Host, m) => self.host_fp32_math = m,
            (DeviceClass::Accelerator, m) => self.accelerator_fp32_math = m,
        }
        Ok(())
    }
}

/// Snapshot of the current process-wide settings
pub fn runtime_config() -> ForgeResult<RuntimeConfig> {
    Ok(*RUNTIME.read()?)
}

fn update(f: impl FnOnce(&mut RuntimeConfig) -> ForgeResult<()>) -> ForgeResult<()> {
    let mut guard = RUNTIME.write()?;
    f(&mut guard)
}

/// Restore automatic channels-last selection
pub fn enable_auto_channels_last() -> ForgeResult<()> {
    update(|c| {
        c.channels_last = ChannelsLastMode::Auto;
        Ok(())
    })
}

/// Never convert convolution weights to channels-last
pub fn disable_auto_channels_last() -> ForgeResult<()> {
    update(|c| {
        c.channels_last = ChannelsLastMode::Disabled;
        Ok(())
    })
}

pub fn set_channels_last(mode: ChannelsLastMode) -> ForgeResult<()> {
    update(|c| {
        c.channels_last = mode;
        Ok(())
    })
}

pub fn set_compiler_backend(backend: CompilerBackend) -> ForgeResult<()> {
    update(|c| {
        c.compiler_backend = backend;
        Ok(())
    })
}

pub fn set_fp32_math_mode(device: DeviceClass, mode: Fp32MathMode) -> ForgeResult<()> {
    update(|c| c.set_fp32_math(device, mode))
}

pub fn fp32_math_mode(device: DeviceClass) -> ForgeResult<Fp32MathMode> {
    Ok(runtime_config()?.fp32_math(device))
}

/// Reset every process-wide setting to its default
pub fn reset_runtime_config() -> ForgeResult<()> {
    update(|c| {
        *c = RuntimeConfig::default();
        Ok(())
    })
}
