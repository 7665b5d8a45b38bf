//! Device and hardware policy applied to a resolved configuration
//!
//! Runs after level/override resolution and before any stage touches the
//! model. Features the device cannot honor are switched off with a warning;
//! requests that cannot be honored at all fail here, so no stage runs on a
//! doomed configuration.

use crate::backend::{Capability, CapabilityProbe, DeviceClass};
use crate::config::{Feature, PolicyOverride, ResolvedConfig};
use crate::error::{ForgeError, ForgeResult};
use crate::optim::{supports_fused, OptimizerFamily};
use crate::tensor::DType;
use tracing::{debug, warn};

/// Configuration after device policy, plus what the policy changed
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub config: ResolvedConfig,
    pub overrides: Vec<PolicyOverride>,
    /// The sample input cannot be used and must not reach any stage
    pub drop_sample_input: bool,
}

/// Capability a feature needs from the probe, checked at f32
const CAPABILITY_GATES: &[(Feature, Capability)] = &[
    (Feature::AutoKernelSelection, Capability::AutoKernelSelection),
    (Feature::GraphMode, Capability::GraphCapture),
    (Feature::OptimizeLstm, Capability::LstmReplacement),
];

pub fn apply_device_policy(
    config: ResolvedConfig,
    probe: &dyn CapabilityProbe,
    dtype: DType,
    optimizer: Option<OptimizerFamily>,
    has_sample_input: bool,
) -> ForgeResult<PolicyDecision> {
    let device = probe.device_class();
    let mut config = config;
    let mut overrides = Vec::new();

    for &(feature, capability) in CAPABILITY_GATES {
        if !probe.supports(capability, DType::F32) {
            let reason = format!("{} is not supported on {} devices", feature, device);
            config.force_off(feature, &reason, &mut overrides);
        }
    }

    if let Some(family) = optimizer {
        apply_training_policy(&mut config, &mut overrides, probe, dtype, family)?;
    }

    let mut drop_sample_input = false;
    if config.weights_prepack {
        if !probe.supports(Capability::WeightPrepack, DType::F32) {
            let reason = format!("weight prepack is not supported on {} devices", device);
            config.force_off(Feature::WeightsPrepack, &reason, &mut overrides);
        } else if dtype.is_reduced() && !probe.supports(Capability::WeightPrepack, dtype) {
            return Err(ForgeError::UnsupportedHardware(format!(
                "{} weight prepack needs hardware {} support; disable weights_prepack or use f32",
                dtype, dtype
            )));
        }
    }
    if has_sample_input && !config.weights_prepack {
        warn!("sample_input is only used by weight prepack, ignoring it");
        drop_sample_input = true;
    }

    let (config, invariant_overrides) = config.enforce_invariants();
    overrides.extend(invariant_overrides);

    debug!(%device, config = %config.to_json(), "device policy applied");
    Ok(PolicyDecision {
        config,
        overrides,
        drop_sample_input,
    })
}

fn apply_training_policy(
    config: &mut ResolvedConfig,
    overrides: &mut Vec<PolicyOverride>,
    probe: &dyn CapabilityProbe,
    dtype: DType,
    family: OptimizerFamily,
) -> ForgeResult<()> {
    let device = probe.device_class();

    if dtype.is_reduced() && !probe.supports(Capability::ReducedPrecisionTraining, dtype) {
        return Err(ForgeError::ArgumentMismatch(format!(
            "{} training is not supported on {} devices",
            dtype, device
        )));
    }

    match dtype {
        DType::BF16 => {}
        DType::F16 => config.force_off(
            Feature::SplitMasterWeight,
            "split master weight is only available for bf16 training",
            overrides,
        ),
        // Nothing to split without a narrowed copy
        DType::F32 => config.split_master_weight = false,
    }

    if !supports_fused(device, family) {
        let reason = format!("{} has no fused update on {} devices", family, device);
        config.force_off(Feature::SplitMasterWeight, &reason, overrides);
        config.force_off(Feature::FuseUpdateStep, &reason, overrides);
    } else if device == DeviceClass::Accelerator && family != OptimizerFamily::Sgd {
        let reason = format!("split master weight on {} devices supports SGD only, not {}", device, family);
        config.force_off(Feature::SplitMasterWeight, &reason, overrides);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::cpu::{CpuArch, CpuFeatures};
    use crate::backend::{AcceleratorProbe, HostProbe};
    use crate::config::OptLevel;

    fn o1() -> ResolvedConfig {
        ResolvedConfig::preset(OptLevel::O1)
    }

    fn bf16_host() -> HostProbe {
        let mut f = CpuFeatures::none(CpuArch::X86_64);
        f.avx512f = true;
        f.avx512bw = true;
        f.avx512vl = true;
        f.avx512dq = true;
        HostProbe::with_features(f)
    }

    fn plain_host() -> HostProbe {
        HostProbe::with_features(CpuFeatures::none(CpuArch::X86_64))
    }

    #[test]
    fn test_host_inference_keeps_preset() {
        let d = apply_device_policy(o1(), &plain_host(), DType::F32, None, false).unwrap();
        assert_eq!(d.config, o1());
        assert!(d.overrides.is_empty());
    }

    #[test]
    fn test_accelerator_switches_off_host_only_features() {
        let requested = o1().clone_with(|c| {
            c.auto_kernel_selection = true;
            c.graph_mode = true;
        });
        let d = apply_device_policy(requested, &AcceleratorProbe::new(), DType::F32, None, true).unwrap();

        assert!(!d.config.auto_kernel_selection);
        assert!(!d.config.graph_mode);
        assert!(!d.config.optimize_lstm);
        assert!(!d.config.weights_prepack);
        assert!(d.drop_sample_input);
        let forced: Vec<Feature> = d.overrides.iter().map(|o| o.feature).collect();
        assert!(forced.contains(&Feature::WeightsPrepack));
        assert!(forced.contains(&Feature::GraphMode));
    }

    #[test]
    fn test_reduced_prepack_without_hardware_fails() {
        let err = apply_device_policy(o1(), &plain_host(), DType::BF16, None, false).unwrap_err();
        assert!(matches!(err, ForgeError::UnsupportedHardware(_)));

        // Same request without prepack is fine
        let no_prepack = o1().clone_with(|c| c.weights_prepack = false);
        assert!(apply_device_policy(no_prepack, &plain_host(), DType::BF16, None, false).is_ok());
        assert!(apply_device_policy(o1(), &bf16_host(), DType::BF16, None, false).is_ok());
    }

    #[test]
    fn test_unfusable_optimizer_disables_split_and_fusion() {
        let d = apply_device_policy(
            o1(),
            &bf16_host(),
            DType::BF16,
            Some(OptimizerFamily::RmsProp),
            false,
        )
        .unwrap();
        assert!(!d.config.fuse_update_step);
        assert!(!d.config.split_master_weight);
        assert!(d.overrides.iter().any(|o| o.reason.contains("RMSprop")));
    }

    #[test]
    fn test_f16_training() {
        let d = apply_device_policy(o1(), &plain_host(), DType::F16, Some(OptimizerFamily::Adam), false);
        // No fp16 prepack on a plain host
        assert!(matches!(d.unwrap_err(), ForgeError::UnsupportedHardware(_)));

        let no_prepack = o1().clone_with(|c| c.weights_prepack = false);
        let d = apply_device_policy(no_prepack, &plain_host(), DType::F16, Some(OptimizerFamily::Adam), false)
            .unwrap();
        assert!(!d.config.split_master_weight);
        assert!(d.config.fuse_update_step);

        let err = apply_device_policy(o1(), &AcceleratorProbe::new(), DType::F16, Some(OptimizerFamily::Sgd), false)
            .unwrap_err();
        assert!(matches!(err, ForgeError::ArgumentMismatch(_)));
    }

    #[test]
    fn test_accelerator_split_is_sgd_only() {
        let sgd = apply_device_policy(o1(), &AcceleratorProbe::new(), DType::BF16, Some(OptimizerFamily::Sgd), false)
            .unwrap();
        assert!(sgd.config.split_master_weight);

        let adam = apply_device_policy(o1(), &AcceleratorProbe::new(), DType::BF16, Some(OptimizerFamily::Adam), false)
            .unwrap();
        assert!(!adam.config.split_master_weight);
        assert!(adam.config.fuse_update_step);
    }

    #[test]
    fn test_f32_training_has_no_split() {
        let d = apply_device_policy(o1(), &plain_host(), DType::F32, Some(OptimizerFamily::Sgd), false).unwrap();
        assert!(!d.config.split_master_weight);
        assert!(d.config.fuse_update_step);
        // Silent: nothing was requested that could not be honored
        assert!(d.overrides.is_empty());
    }

    trait CloneWith {
        fn clone_with(self, f: impl FnOnce(&mut Self)) -> Self;
    }

    impl CloneWith for ResolvedConfig {
        fn clone_with(mut self, f: impl FnOnce(&mut Self)) -> Self {
            f(&mut self);
            self
        }
    }
}
