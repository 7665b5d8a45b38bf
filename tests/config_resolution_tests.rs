//! Level resolution, process-wide runtime settings and logging setup

mod common;

use common::tempfile_helpers::{create_temp_dir, log_file_in};
use common::{accelerator, conv_net, host_options, input, mlp_with_norm, serial, trainable, BF16_HOST};
use proptest::prelude::*;
use tuneforge::config::{
    disable_auto_channels_last, enable_auto_channels_last, fp32_math_mode, reset_runtime_config,
    runtime_config, set_fp32_math_mode, ChannelsLastMode, Fp32MathMode,
};
use tuneforge::logging::{init_with_config, is_initialized, LogFormat, LogLevel, LoggingConfig};
use tuneforge::pipeline::StageOutcome;
use tuneforge::{
    optimize, resolve, DType, DeviceClass, Feature, FeatureOverrides, OptLevel, OptimizeOptions, Optimized,
    Optimizer, OptimizerKind,
};

fn feature_strategy() -> impl Strategy<Value = Feature> {
    proptest::sample::select(Feature::ALL.to_vec())
}

fn level_strategy() -> impl Strategy<Value = &'static str> {
    proptest::sample::select(vec!["O0", "O1", "disabled", "standard"])
}

proptest! {
    #[test]
    fn prop_override_wins(level in level_strategy(), feature in feature_strategy(), value in any::<bool>()) {
        let overrides = FeatureOverrides::new().with(feature, value);
        let config = resolve(level, &overrides).unwrap();
        prop_assert_eq!(config.get(feature), value);
    }

    #[test]
    fn prop_other_features_follow_preset(level in level_strategy(), feature in feature_strategy(), value in any::<bool>()) {
        let overrides = FeatureOverrides::new().with(feature, value);
        let config = resolve(level, &overrides).unwrap();
        let parsed: OptLevel = level.parse().unwrap();
        for other in Feature::ALL.iter().filter(|f| **f != feature) {
            prop_assert_eq!(config.get(*other), parsed.preset(*other));
        }
    }
}

/// Options without an explicit runtime, so the process settings apply
fn process_options() -> OptimizeOptions {
    OptimizeOptions::new().with_probe(BF16_HOST.clone())
}

#[test]
#[serial]
fn test_channels_last_toggle_reaches_pipeline() {
    reset_runtime_config().unwrap();
    disable_auto_channels_last().unwrap();
    assert_eq!(runtime_config().unwrap().channels_last, ChannelsLastMode::Disabled);

    let out = optimize(&conv_net(), None, process_options()).unwrap();
    assert_eq!(out.model().stats().outcome("channels_last"), Some(&StageOutcome::Skipped));

    enable_auto_channels_last().unwrap();
    let out = optimize(&conv_net(), None, process_options()).unwrap();
    assert_eq!(out.model().stats().applied("channels_last"), Some(1));

    reset_runtime_config().unwrap();
}

#[test]
#[serial]
fn test_runtime_snapshot_taken_per_call() {
    reset_runtime_config().unwrap();
    set_fp32_math_mode(DeviceClass::Host, Fp32MathMode::Bf32).unwrap();
    let out = match optimize(&mlp_with_norm(), None, process_options()).unwrap() {
        Optimized::Inference(m) => m,
        Optimized::Training(..) => panic!("expected an inference result"),
    };

    // Later changes do not leak into an already optimized model
    reset_runtime_config().unwrap();
    let x = input(vec![2, 8]);
    let rounded = x.to_dtype(DType::BF16).to_dtype(DType::F32);
    assert_eq!(out.forward(&x).unwrap(), out.module().forward(&rounded).unwrap());
}

#[test]
#[serial]
fn test_host_rejects_tf32() {
    reset_runtime_config().unwrap();
    set_fp32_math_mode(DeviceClass::Host, Fp32MathMode::Tf32).unwrap();
    assert_eq!(fp32_math_mode(DeviceClass::Host).unwrap(), Fp32MathMode::Fp32);

    set_fp32_math_mode(DeviceClass::Accelerator, Fp32MathMode::Tf32).unwrap();
    assert_eq!(fp32_math_mode(DeviceClass::Accelerator).unwrap(), Fp32MathMode::Tf32);
    reset_runtime_config().unwrap();
}

#[test]
#[serial]
fn test_policy_overrides_are_logged() -> anyhow::Result<()> {
    let dir = create_temp_dir()?;
    let path = log_file_in(&dir);
    let config = LoggingConfig::new()
        .with_level(LogLevel::Warn)
        .with_format(LogFormat::Json)
        .with_log_file(path.clone());
    init_with_config(&config);
    assert!(is_initialized());

    let model = mlp_with_norm().to_device(DeviceClass::Accelerator);
    let options = OptimizeOptions::new()
        .with_probe(accelerator())
        .with_runtime(Default::default())
        .with_overrides(FeatureOverrides::new().weights_prepack(true));
    optimize(&model, None, options)?;

    // Graph capture refuses training models with a warning
    let trainable = trainable();
    let opt = Optimizer::for_model(OptimizerKind::sgd(0.0), &trainable, 0.1);
    let options = host_options().with_overrides(FeatureOverrides::new().graph_mode(true));
    let captured = optimize(&trainable, Some(&opt), options)?;
    captured.model().forward(&input(vec![1, 6]))?;

    let logged = std::fs::read_to_string(&path)?;
    assert!(logged.contains("weights_prepack"));
    assert!(logged.contains("does not support training"));
    Ok(())
}
