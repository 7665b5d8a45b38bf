//! Optimizers, fused update kernels and parameter attribute records

pub mod fused;
pub mod optimizer;
pub mod param_attr;

pub use fused::{fused_allow_list, supports_fused};
pub use optimizer::{Optimizer, OptimizerFamily, OptimizerKind, ParamGroup, ParamState, StepMode};
pub use param_attr::{OriginalParam, PackedWeight, ParamAttr, ParamAttrRegistry};
