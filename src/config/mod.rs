//! Optimization level presets and per-feature overrides
//!
//! A level selects a preset value for every [`Feature`]; an explicit override
//! always wins over the preset for that feature alone. Resolution itself is
//! pure: device and hardware policy is applied later by the pipeline.

pub mod runtime;

pub use runtime::{
    disable_auto_channels_last, enable_auto_channels_last, fp32_math_mode, reset_runtime_config,
    runtime_config, set_channels_last, set_compiler_backend, set_fp32_math_mode, ChannelsLastMode,
    CompilerBackend, Fp32MathMode, RuntimeConfig,
};

use crate::config_error;
use crate::error::{ForgeError, ForgeResult};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// Preset bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum OptLevel {
    /// Every feature off
    O0,
    /// Standard preset
    #[default]
    O1,
}

impl OptLevel {
    pub const NAMES: &'static [&'static str] = &["O0", "O1"];

    /// Preset value for `feature` at this level
    pub fn preset(&self, feature: Feature) -> bool {
        match self {
            OptLevel::O0 => false,
            OptLevel::O1 => !matches!(
                feature,
                Feature::AutoKernelSelection | Feature::GraphMode | Feature::ConcatLinear
            ),
        }
    }
}

impl FromStr for OptLevel {
    type Err = ForgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "O0" | "disabled" => Ok(OptLevel::O0),
            "O1" | "standard" => Ok(OptLevel::O1),
            other => Err(config_error!(
                "unexpected optimization level '{}', expected one of {:?}",
                other,
                OptLevel::NAMES
            )),
        }
    }
}

impl fmt::Display for OptLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptLevel::O0 => write!(f, "O0"),
            OptLevel::O1 => write!(f, "O1"),
        }
    }
}

/// Individually switchable pipeline features
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Feature {
    ConvBnFolding,
    LinearBnFolding,
    WeightsPrepack,
    ReplaceDropoutWithIdentity,
    OptimizeLstm,
    SplitMasterWeight,
    FuseUpdateStep,
    AutoKernelSelection,
    GraphMode,
    ConcatLinear,
}

impl Feature {
    pub const ALL: [Feature; 10] = [
        Feature::ConvBnFolding,
        Feature::LinearBnFolding,
        Feature::WeightsPrepack,
        Feature::ReplaceDropoutWithIdentity,
        Feature::OptimizeLstm,
        Feature::SplitMasterWeight,
        Feature::FuseUpdateStep,
        Feature::AutoKernelSelection,
        Feature::GraphMode,
        Feature::ConcatLinear,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn name(&self) -> &'static str {
        match self {
            Feature::ConvBnFolding => "conv_bn_folding",
            Feature::LinearBnFolding => "linear_bn_folding",
            Feature::WeightsPrepack => "weights_prepack",
            Feature::ReplaceDropoutWithIdentity => "replace_dropout_with_identity",
            Feature::OptimizeLstm => "optimize_lstm",
            Feature::SplitMasterWeight => "split_master_weight",
            Feature::FuseUpdateStep => "fuse_update_step",
            Feature::AutoKernelSelection => "auto_kernel_selection",
            Feature::GraphMode => "graph_mode",
            Feature::ConcatLinear => "concat_linear",
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Tri-state per-feature overrides: `None` defers to the level preset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureOverrides {
    values: [Option<bool>; 10],
}

impl FeatureOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, feature: Feature, enabled: bool) -> Self {
        self.values[feature.index()] = Some(enabled);
        self
    }

    pub fn clear(mut self, feature: Feature) -> Self {
        self.values[feature.index()] = None;
        self
    }

    pub fn get(&self, feature: Feature) -> Option<bool> {
        self.values[feature.index()]
    }

    pub fn conv_bn_folding(self, enabled: bool) -> Self {
        self.with(Feature::ConvBnFolding, enabled)
    }

    pub fn linear_bn_folding(self, enabled: bool) -> Self {
        self.with(Feature::LinearBnFolding, enabled)
    }

    pub fn weights_prepack(self, enabled: bool) -> Self {
        self.with(Feature::WeightsPrepack, enabled)
    }

    pub fn replace_dropout_with_identity(self, enabled: bool) -> Self {
        self.with(Feature::ReplaceDropoutWithIdentity, enabled)
    }

    pub fn optimize_lstm(self, enabled: bool) -> Self {
        self.with(Feature::OptimizeLstm, enabled)
    }

    pub fn split_master_weight(self, enabled: bool) -> Self {
        self.with(Feature::SplitMasterWeight, enabled)
    }

    pub fn fuse_update_step(self, enabled: bool) -> Self {
        self.with(Feature::FuseUpdateStep, enabled)
    }

    pub fn auto_kernel_selection(self, enabled: bool) -> Self {
        self.with(Feature::AutoKernelSelection, enabled)
    }

    pub fn graph_mode(self, enabled: bool) -> Self {
        self.with(Feature::GraphMode, enabled)
    }

    pub fn concat_linear(self, enabled: bool) -> Self {
        self.with(Feature::ConcatLinear, enabled)
    }
}

/// A feature the pipeline switched off (or kept off) against the request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PolicyOverride {
    pub feature: Feature,
    pub reason: String,
}

impl PolicyOverride {
    pub fn new(feature: Feature, reason: impl Into<String>) -> Self {
        Self {
            feature,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for PolicyOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} disabled: {}", self.feature, self.reason)
    }
}

/// Fully resolved feature switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResolvedConfig {
    pub level: OptLevel,
    pub conv_bn_folding: bool,
    pub linear_bn_folding: bool,
    pub weights_prepack: bool,
    pub replace_dropout_with_identity: bool,
    pub optimize_lstm: bool,
    pub split_master_weight: bool,
    pub fuse_update_step: bool,
    pub auto_kernel_selection: bool,
    pub graph_mode: bool,
    pub concat_linear: bool,
}

impl ResolvedConfig {
    /// Preset values for `level` with no overrides
    pub fn preset(level: OptLevel) -> Self {
        let mut config = Self {
            level,
            conv_bn_folding: false,
            linear_bn_folding: false,
            weights_prepack: false,
            replace_dropout_with_identity: false,
            optimize_lstm: false,
            split_master_weight: false,
            fuse_update_step: false,
            auto_kernel_selection: false,
            graph_mode: false,
            concat_linear: false,
        };
        for feature in Feature::ALL {
            config.set(feature, level.preset(feature));
        }
        config
    }

    pub fn get(&self, feature: Feature) -> bool {
        match feature {
            Feature::ConvBnFolding => self.conv_bn_folding,
            Feature::LinearBnFolding => self.linear_bn_folding,
            Feature::WeightsPrepack => self.weights_prepack,
            Feature::ReplaceDropoutWithIdentity => self.replace_dropout_with_identity,
            Feature::OptimizeLstm => self.optimize_lstm,
            Feature::SplitMasterWeight => self.split_master_weight,
            Feature::FuseUpdateStep => self.fuse_update_step,
            Feature::AutoKernelSelection => self.auto_kernel_selection,
            Feature::GraphMode => self.graph_mode,
            Feature::ConcatLinear => self.concat_linear,
        }
    }

    pub fn set(&mut self, feature: Feature, enabled: bool) {
        let slot = match feature {
            Feature::ConvBnFolding => &mut self.conv_bn_folding,
            Feature::LinearBnFolding => &mut self.linear_bn_folding,
            Feature::WeightsPrepack => &mut self.weights_prepack,
            Feature::ReplaceDropoutWithIdentity => &mut self.replace_dropout_with_identity,
            Feature::OptimizeLstm => &mut self.optimize_lstm,
            Feature::SplitMasterWeight => &mut self.split_master_weight,
            Feature::FuseUpdateStep => &mut self.fuse_update_step,
            Feature::AutoKernelSelection => &mut self.auto_kernel_selection,
            Feature::GraphMode => &mut self.graph_mode,
            Feature::ConcatLinear => &mut self.concat_linear,
        };
        *slot = enabled;
    }

    /// Switch `feature` off, recording and logging why. No-op if already off.
    pub fn force_off(&mut self, feature: Feature, reason: &str, overrides: &mut Vec<PolicyOverride>) {
        if self.get(feature) {
            warn!(feature = feature.name(), "{}", reason);
            self.set(feature, false);
            overrides.push(PolicyOverride::new(feature, reason));
        }
    }

    /// Enforce cross-feature invariants that hold on every device.
    ///
    /// Split master weights only exist inside the fused update, so split is
    /// forced off whenever fusion is off.
    pub fn enforce_invariants(mut self) -> (Self, Vec<PolicyOverride>) {
        let mut overrides = Vec::new();
        if !self.fuse_update_step {
            self.force_off(
                Feature::SplitMasterWeight,
                "split master weight requires the fused update step",
                &mut overrides,
            );
        }
        (self, overrides)
    }

    pub fn enabled_features(&self) -> Vec<Feature> {
        Feature::ALL.into_iter().filter(|f| self.get(*f)).collect()
    }

    /// JSON summary, for logs
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"error\":\"{}\"}}", e))
    }
}

/// Resolve a level name plus overrides into concrete switches
pub fn resolve(level: &str, overrides: &FeatureOverrides) -> ForgeResult<ResolvedConfig> {
    let level: OptLevel = level.parse()?;
    Ok(resolve_level(level, overrides))
}

pub fn resolve_level(level: OptLevel, overrides: &FeatureOverrides) -> ResolvedConfig {
    let mut config = ResolvedConfig::preset(level);
    for feature in Feature::ALL {
        if let Some(value) = overrides.get(feature) {
            config.set(feature, value);
        }
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_o0_disables_everything() {
        let config = resolve("O0", &FeatureOverrides::new()).unwrap();
        assert!(config.enabled_features().is_empty());
    }

    #[test]
    fn test_o1_preset() {
        let config = resolve("O1", &FeatureOverrides::new()).unwrap();
        assert!(config.conv_bn_folding);
        assert!(config.linear_bn_folding);
        assert!(config.weights_prepack);
        assert!(config.replace_dropout_with_identity);
        assert!(config.optimize_lstm);
        assert!(config.split_master_weight);
        assert!(config.fuse_update_step);
        assert!(!config.auto_kernel_selection);
        assert!(!config.graph_mode);
        assert!(!config.concat_linear);
    }

    #[test]
    fn test_level_aliases() {
        assert_eq!("disabled".parse::<OptLevel>().unwrap(), OptLevel::O0);
        assert_eq!("standard".parse::<OptLevel>().unwrap(), OptLevel::O1);
    }

    #[test]
    fn test_unknown_level_lists_options() {
        let err = resolve("O3", &FeatureOverrides::new()).unwrap_err();
        assert!(err.is_user_error());
        let msg = err.to_string();
        assert!(msg.contains("O3"));
        assert!(msg.contains("O0") && msg.contains("O1"));
    }

    #[test]
    fn test_split_without_fusion_is_forced_off() {
        let overrides = FeatureOverrides::new().fuse_update_step(false);
        let (config, forced) = resolve("O1", &overrides).unwrap().enforce_invariants();
        assert!(!config.split_master_weight);
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].feature, Feature::SplitMasterWeight);
    }

    #[test]
    fn test_json_summary() {
        let json = ResolvedConfig::preset(OptLevel::O1).to_json();
        assert!(json.contains("\"weights_prepack\":true"));
        assert!(json.contains("\"graph_mode\":false"));
    }

    fn overrides_strategy() -> impl Strategy<Value = FeatureOverrides> {
        proptest::collection::vec(proptest::option::of(any::<bool>()), 10).prop_map(|values| {
            let mut overrides = FeatureOverrides::new();
            for (feature, value) in Feature::ALL.into_iter().zip(values) {
                if let Some(v) = value {
                    overrides = overrides.with(feature, v);
                }
            }
            overrides
        })
    }

    proptest! {
        #[test]
        fn prop_override_always_wins(overrides in overrides_strategy(), o1 in any::<bool>()) {
            let level = if o1 { OptLevel::O1 } else { OptLevel::O0 };
            let config = resolve_level(level, &overrides);
            for feature in Feature::ALL {
                let expected = overrides.get(feature).unwrap_or_else(|| level.preset(feature));
                prop_assert_eq!(config.get(feature), expected);
            }
        }

        #[test]
        fn prop_o0_without_overrides_is_all_off(_seed in any::<u8>()) {
            let config = resolve_level(OptLevel::O0, &FeatureOverrides::new());
            prop_assert!(Feature::ALL.iter().all(|f| !config.get(*f)));
        }

        #[test]
        fn prop_split_never_survives_without_fusion(overrides in overrides_strategy()) {
            let (config, _) = resolve_level(OptLevel::O1, &overrides).enforce_invariants();
            if !config.fuse_update_step {
                prop_assert!(!config.split_master_weight);
            }
        }
    }
}
