//! Device classes and pluggable capability probes
//!
//! The pipeline never inspects hardware directly. It asks a
//! [`CapabilityProbe`] whether a capability is available for a dtype, so
//! tests can substitute a probe that reports any hardware they like.

use crate::backend::cpu::CpuFeatures;
use crate::tensor::DType;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Where a model's parameters live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceClass {
    /// General-purpose CPU
    Host,
    /// Discrete accelerator
    Accelerator,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Host => write!(f, "host"),
            DeviceClass::Accelerator => write!(f, "accelerator"),
        }
    }
}

/// Capabilities the pipeline gates stages on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Blocked weight layouts with kernels for the given dtype
    WeightPrepack,
    /// Automatic kernel-library selection for linear layers
    AutoKernelSelection,
    /// Trace/compile graph capture
    GraphCapture,
    /// Optimized recurrent-layer replacement
    LstmReplacement,
    /// Training with parameters stored in the given dtype
    ReducedPrecisionTraining,
    /// 2D block-array loads (drives auto channels-last on accelerators)
    Block2dArray,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::WeightPrepack => "weight_prepack",
            Capability::AutoKernelSelection => "auto_kernel_selection",
            Capability::GraphCapture => "graph_capture",
            Capability::LstmReplacement => "lstm_replacement",
            Capability::ReducedPrecisionTraining => "reduced_precision_training",
            Capability::Block2dArray => "block_2d_array",
        };
        write!(f, "{}", name)
    }
}

/// Answers capability questions for one device class
pub trait CapabilityProbe: Send + Sync {
    /// Device class this probe describes
    fn device_class(&self) -> DeviceClass;

    /// Whether `capability` is available when working in `dtype`
    fn supports(&self, capability: Capability, dtype: DType) -> bool;

    /// Preferred output block for prepacked weights
    fn preferred_block(&self) -> usize {
        1
    }
}

/// Probe backed by runtime CPU feature detection
#[derive(Debug, Clone, Copy)]
pub struct HostProbe {
    features: CpuFeatures,
}

impl HostProbe {
    /// Probe the running CPU
    pub fn detect() -> Self {
        Self {
            features: CpuFeatures::get(),
        }
    }

    /// Probe a fixed feature set
    pub fn with_features(features: CpuFeatures) -> Self {
        Self { features }
    }

    pub fn features(&self) -> &CpuFeatures {
        &self.features
    }
}

impl CapabilityProbe for HostProbe {
    fn device_class(&self) -> DeviceClass {
        DeviceClass::Host
    }

    fn supports(&self, capability: Capability, dtype: DType) -> bool {
        match capability {
            Capability::WeightPrepack => match dtype {
                DType::F32 => true,
                DType::BF16 => self.features.has_bf16_support(),
                DType::F16 => self.features.has_fp16_support(),
            },
            Capability::AutoKernelSelection
            | Capability::GraphCapture
            | Capability::LstmReplacement
            | Capability::ReducedPrecisionTraining => true,
            Capability::Block2dArray => false,
        }
    }

    fn preferred_block(&self) -> usize {
        // Scalar hosts still get a small block so the layout is exercised
        self.features.preferred_block().max(4)
    }
}

/// Probe for the accelerator device class
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceleratorProbe {
    block_2d_array: bool,
}

impl AcceleratorProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_block_2d_array(mut self, enabled: bool) -> Self {
        self.block_2d_array = enabled;
        self
    }
}

impl CapabilityProbe for AcceleratorProbe {
    fn device_class(&self) -> DeviceClass {
        DeviceClass::Accelerator
    }

    fn supports(&self, capability: Capability, dtype: DType) -> bool {
        match capability {
            Capability::WeightPrepack
            | Capability::AutoKernelSelection
            | Capability::GraphCapture
            | Capability::LstmReplacement => false,
            Capability::ReducedPrecisionTraining => dtype != DType::F16,
            Capability::Block2dArray => self.block_2d_array,
        }
    }
}

/// Default probe for a device class
pub fn probe_for(device: DeviceClass) -> Arc<dyn CapabilityProbe> {
    match device {
        DeviceClass::Host => Arc::new(HostProbe::detect()),
        DeviceClass::Accelerator => Arc::new(AcceleratorProbe::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::CpuArch;

    #[test]
    fn test_host_prepack_follows_cpu_features() {
        let bare = HostProbe::with_features(CpuFeatures::none(CpuArch::X86_64));
        assert!(bare.supports(Capability::WeightPrepack, DType::F32));
        assert!(!bare.supports(Capability::WeightPrepack, DType::BF16));
        assert!(!bare.supports(Capability::WeightPrepack, DType::F16));

        let mut avx512 = CpuFeatures::none(CpuArch::X86_64);
        avx512.avx512f = true;
        avx512.avx512bw = true;
        avx512.avx512vl = true;
        avx512.avx512dq = true;
        let probe = HostProbe::with_features(avx512);
        assert!(probe.supports(Capability::WeightPrepack, DType::BF16));
        assert!(!probe.supports(Capability::WeightPrepack, DType::F16));
        assert_eq!(probe.preferred_block(), 16);
    }

    #[test]
    fn test_accelerator_probe() {
        let probe = AcceleratorProbe::new();
        assert_eq!(probe.device_class(), DeviceClass::Accelerator);
        assert!(!probe.supports(Capability::WeightPrepack, DType::F32));
        assert!(!probe.supports(Capability::GraphCapture, DType::F32));
        assert!(!probe.supports(Capability::ReducedPrecisionTraining, DType::F16));
        assert!(probe.supports(Capability::ReducedPrecisionTraining, DType::BF16));
        assert!(!probe.supports(Capability::Block2dArray, DType::F32));
        assert!(AcceleratorProbe::new()
            .with_block_2d_array(true)
            .supports(Capability::Block2dArray, DType::F32));
    }

    #[test]
    fn test_probe_for_device_class() {
        assert_eq!(probe_for(DeviceClass::Host).device_class(), DeviceClass::Host);
        assert_eq!(
            probe_for(DeviceClass::Accelerator).device_class(),
            DeviceClass::Accelerator
        );
    }
}
