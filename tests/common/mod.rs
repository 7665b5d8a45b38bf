//! Common test utilities for pipeline integration tests
//!
//! Shared model builders, probes and option presets. Tests that touch the
//! process-wide runtime settings must be marked `#[serial]`; everything else
//! passes an explicit `RuntimeConfig` so it can run in parallel.
//!
//! # Usage
//!
//! ```ignore
//! mod common;
//! use common::{host_options, mlp_with_norm};
//!
//! #[test]
//! fn my_test() {
//!     let model = mlp_with_norm();
//!     let out = optimize(&model, None, host_options()).unwrap();
//! }
//! ```

#![allow(dead_code)]

pub mod tempfile_helpers;

use once_cell::sync::Lazy;
pub use serial_test::serial;
use std::sync::Arc;
use tuneforge::backend::cpu::{CpuArch, CpuFeatures};
use tuneforge::backend::{AcceleratorProbe, CapabilityProbe, HostProbe};
use tuneforge::config::RuntimeConfig;
use tuneforge::model::Combine;
use tuneforge::{Module, OptimizeOptions, Tensor};

/// Host with AVX-512 BF16-capable prepack kernels
pub static BF16_HOST: Lazy<Arc<dyn CapabilityProbe>> = Lazy::new(|| {
    let mut f = CpuFeatures::none(CpuArch::X86_64);
    f.avx512f = true;
    f.avx512bw = true;
    f.avx512vl = true;
    f.avx512dq = true;
    Arc::new(HostProbe::with_features(f))
});

/// Host without any reduced-precision prepack support
pub static PLAIN_HOST: Lazy<Arc<dyn CapabilityProbe>> =
    Lazy::new(|| Arc::new(HostProbe::with_features(CpuFeatures::none(CpuArch::X86_64))));

pub fn accelerator() -> Arc<dyn CapabilityProbe> {
    Arc::new(AcceleratorProbe::new())
}

/// Options pinned to a BF16-capable host and default runtime settings
pub fn host_options() -> OptimizeOptions {
    OptimizeOptions::new()
        .with_probe(BF16_HOST.clone())
        .with_runtime(RuntimeConfig::default())
}

pub fn plain_host_options() -> OptimizeOptions {
    OptimizeOptions::new()
        .with_probe(PLAIN_HOST.clone())
        .with_runtime(RuntimeConfig::default())
}

/// Deterministic input with mixed signs
pub fn input(shape: Vec<usize>) -> Tensor {
    let n: usize = shape.iter().product();
    let values = (0..n).map(|i| ((i * 7 + 3) % 13) as f32 / 6.0 - 1.0).collect();
    Tensor::from_vec(values, shape).unwrap()
}

/// linear -> batch norm -> relu -> dropout -> linear, in eval mode
pub fn mlp_with_norm() -> Module {
    let mut m = Module::sequential(
        "mlp",
        vec![
            Module::linear("fc1", 8, 16, 1).unwrap(),
            Module::batch_norm("bn1", 16).unwrap().with_random_stats(7).unwrap(),
            Module::relu("act"),
            Module::dropout("drop", 0.1),
            Module::linear("fc2", 16, 4, 2).unwrap(),
        ],
    );
    m.eval();
    m
}

/// conv -> batch norm -> relu, in eval mode
pub fn conv_net() -> Module {
    let mut m = Module::sequential(
        "convnet",
        vec![
            Module::conv("conv", 2, 3, 8, 3, 3).unwrap(),
            Module::batch_norm("bn", 8).unwrap().with_random_stats(5).unwrap(),
            Module::relu("act"),
        ],
    );
    m.eval();
    m
}

/// Three projections of the same input, concatenated
pub fn qkv() -> Module {
    let mut m = Module::parallel(
        "qkv",
        Combine::Concat,
        vec![
            Module::linear("q", 8, 8, 11).unwrap(),
            Module::linear("k", 8, 8, 12).unwrap(),
            Module::linear("v", 8, 8, 13).unwrap(),
        ],
    );
    m.eval();
    m
}

/// Two-layer classifier in training mode
pub fn trainable() -> Module {
    let mut m = Module::sequential(
        "clf",
        vec![
            Module::linear("fc1", 6, 12, 21).unwrap(),
            Module::relu("act"),
            Module::linear("fc2", 12, 3, 22).unwrap(),
        ],
    );
    m.train(true);
    m
}

/// Fill every trainable parameter's gradient with a fixed pattern
pub fn seed_grads(model: &mut Module, scale: f32) {
    for p in model.parameters_mut() {
        if !p.requires_grad {
            continue;
        }
        let n = p.data.numel();
        let values: Vec<f32> = (0..n).map(|i| scale * (((i % 5) as f32) - 2.0)).collect();
        let grad = Tensor::from_vec(values, p.shape().to_vec())
            .unwrap()
            .to_dtype(p.dtype());
        p.set_grad(grad);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixtures_build() {
        assert_eq!(mlp_with_norm().children().len(), 5);
        assert!(!conv_net().is_training());
        assert!(trainable().is_training());
        assert_eq!(input(vec![2, 3]).numel(), 6);
    }
}
