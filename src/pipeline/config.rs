//! Options for a single `optimize` call
//!
//! [`OptimizeOptions`] selects the level, overrides, target dtype and the
//! collaborators (capability probe, tracer, compiler) used by one run.

use crate::backend::CapabilityProbe;
use crate::capture::{CaptureConfig, GraphCompiler, GraphTracer};
use crate::config::{FeatureOverrides, RuntimeConfig};
use crate::tensor::{DType, Tensor};
use std::fmt;
use std::sync::Arc;

/// Options for an optimization run
#[derive(Clone)]
pub struct OptimizeOptions {
    /// Level name, `"O0"`/`"disabled"` or `"O1"`/`"standard"`
    pub level: String,

    /// Per-feature overrides layered over the level preset
    pub overrides: FeatureOverrides,

    /// Target parameter dtype; f32 means no narrowing
    pub dtype: DType,

    /// Representative input, used to choose prepack block sizes
    pub sample_input: Option<Tensor>,

    /// Capability probe; probed from the model's device when unset
    pub probe: Option<Arc<dyn CapabilityProbe>>,

    /// Runtime settings; the process-wide snapshot when unset
    pub runtime: Option<RuntimeConfig>,

    /// Graph capture limits; defaults plus the runtime backend when unset
    pub capture: Option<CaptureConfig>,

    pub tracer: Option<Arc<dyn GraphTracer>>,

    pub compiler: Option<Arc<dyn GraphCompiler>>,
}

impl Default for OptimizeOptions {
    fn default() -> Self {
        OptimizeOptions {
            level: "O1".to_string(),
            overrides: FeatureOverrides::default(),
            dtype: DType::F32,
            sample_input: None,
            probe: None,
            runtime: None,
            capture: None,
            tracer: None,
            compiler: None,
        }
    }
}

impl fmt::Debug for OptimizeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptimizeOptions")
            .field("level", &self.level)
            .field("overrides", &self.overrides)
            .field("dtype", &self.dtype)
            .field("sample_input", &self.sample_input.as_ref().map(|t| t.shape().to_vec()))
            .field("probe", &self.probe.as_ref().map(|p| p.device_class()))
            .field("runtime", &self.runtime)
            .field("capture", &self.capture)
            .field("custom_tracer", &self.tracer.is_some())
            .field("custom_compiler", &self.compiler.is_some())
            .finish()
    }
}

impl OptimizeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_overrides(mut self, overrides: FeatureOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn with_sample_input(mut self, sample: Tensor) -> Self {
        self.sample_input = Some(sample);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn CapabilityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Use `runtime` instead of the process-wide settings
    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn with_capture_config(mut self, capture: CaptureConfig) -> Self {
        self.capture = Some(capture);
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn GraphTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn with_compiler(mut self, compiler: Arc<dyn GraphCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AcceleratorProbe;
    use crate::config::Feature;

    #[test]
    fn test_defaults() {
        let opts = OptimizeOptions::new();
        assert_eq!(opts.level, "O1");
        assert_eq!(opts.dtype, DType::F32);
        assert!(opts.probe.is_none());
        assert_eq!(opts.overrides, FeatureOverrides::default());
    }

    #[test]
    fn test_builder_and_debug() {
        let opts = OptimizeOptions::new()
            .with_level("O0")
            .with_dtype(DType::BF16)
            .with_overrides(FeatureOverrides::new().graph_mode(true))
            .with_sample_input(Tensor::zeros(vec![4, 8]))
            .with_probe(Arc::new(AcceleratorProbe::new()));

        assert_eq!(opts.overrides.get(Feature::GraphMode), Some(true));
        let debug = format!("{:?}", opts);
        assert!(debug.contains("O0"));
        assert!(debug.contains("[4, 8]"));
        assert!(debug.contains("Accelerator"));
    }
}
