//! Module trees, parameters and the model/optimizer cloner

pub mod clone;
pub mod layers;
pub mod module;
pub mod parameter;

pub use clone::{clone_model_and_optimizer, propagate_flags, ClonedPair, ParamRemap};
pub use module::{Combine, Module, ModuleFlags, ModuleKind};
pub use parameter::{ParamId, Parameter};
