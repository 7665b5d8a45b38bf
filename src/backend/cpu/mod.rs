//! Host CPU backend
//!
//! Capability detection for the host device class.

pub mod cpu_features;

pub use cpu_features::{CpuArch, CpuFeatures};
