//! tuneforge - model and optimizer transformation pipeline
//!
//! Takes a module tree and an optional optimizer, resolves optimization
//! features from a level plus overrides, and applies an ordered, device-gated
//! sequence of rewrites: normalization folding, dropout elision, linear
//! concatenation, dtype narrowing with master weights, weight prepacking,
//! LSTM replacement and a fused optimizer update. The result can be wrapped
//! in a lazily resolved graph capture.

#![allow(clippy::too_many_arguments)] // Update kernels take every hyper-parameter
#![allow(clippy::needless_range_loop)] // Index loops mirror the update formulas
#![allow(clippy::type_complexity)] // Nested closures over module trees

pub mod backend;
pub mod capture;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod optim;
pub mod pipeline;
pub mod tensor;
pub mod transform;

pub use backend::{CapabilityProbe, DeviceClass};
pub use capture::{compile, CaptureState, GraphCapture};
pub use config::{resolve, Feature, FeatureOverrides, OptLevel, ResolvedConfig};
pub use error::{ErrorCategory, ForgeError, ForgeResult};
pub use model::{Module, ModuleKind, ParamId, Parameter};
pub use optim::{Optimizer, OptimizerKind};
pub use pipeline::{optimize, optimize_in_place, OptimizeOptions, Optimized, OptimizedModel, TransformPipeline};
pub use tensor::{DType, MemoryFormat, Tensor};

#[cfg(test)]
mod library_tests {
    use super::*;

    #[test]
    fn test_library_imports() {
        let model = Module::sequential("empty", vec![]);
        let out = optimize(
            &model,
            None,
            OptimizeOptions::new().with_runtime(config::RuntimeConfig::default()),
        )
        .unwrap();
        assert!(matches!(out, Optimized::Inference(_)));
    }
}
