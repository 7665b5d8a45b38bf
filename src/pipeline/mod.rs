//! The optimization pipeline
//!
//! [`optimize`] and [`optimize_in_place`] drive one run:
//!
//! 1. resolve the level and overrides, apply device policy
//! 2. validate the model/optimizer pair against training mode and devices
//! 3. clone the pair (unless running in place)
//! 4. channels-last pre-pass, then the ordered [`Transform`] stages
//! 5. optionally wrap the result in a [`GraphCapture`]
//!
//! Configuration and argument errors abort before step 3. Recoverable stage
//! failures are logged and the run continues with the model as the failed
//! stage left it.

pub mod config;
pub mod policy;
pub mod stats;

pub use config::OptimizeOptions;
pub use policy::{apply_device_policy, PolicyDecision};
pub use stats::{PipelineStats, StageOutcome, StageReport};

use crate::backend::{probe_for, Capability, CapabilityProbe, DeviceClass};
use crate::capture::{CaptureConfig, CaptureState, DefaultCompiler, DefaultTracer, GraphCapture};
use crate::config::{
    resolve, runtime_config, ChannelsLastMode, Feature, Fp32MathMode, ResolvedConfig, RuntimeConfig,
};
use crate::argument_error;
use crate::error::{transform_failed, ForgeError, ForgeResult};
use crate::model::{clone_model_and_optimizer, Module};
use crate::optim::{Optimizer, ParamAttrRegistry};
use crate::tensor::{DType, Tensor};
use crate::transform::{
    ChannelsLastConversion, ConcatLinear, ConvBnFolding, DtypeConversion, FusedStepInstall,
    LinearBnFolding, OptimizeLstm, OptimizerStateConversion, ReplaceDropout, Transform,
    TransformContext, WeightPrepack,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// When a stage runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageGate {
    /// Every run
    Always,
    /// When the feature is on
    Feature(Feature),
    /// Inference runs with the feature on
    InferenceFeature(Feature),
    /// Training runs with the feature on
    TrainingFeature(Feature),
    /// Runs targeting a reduced dtype
    ReducedDtype,
    /// Every training run
    Training,
}

impl StageGate {
    fn allows(&self, config: &ResolvedConfig, training: bool, dtype: DType) -> bool {
        match *self {
            StageGate::Always => true,
            StageGate::Feature(f) => config.get(f),
            StageGate::InferenceFeature(f) => !training && config.get(f),
            StageGate::TrainingFeature(f) => training && config.get(f),
            StageGate::ReducedDtype => dtype.is_reduced(),
            StageGate::Training => training,
        }
    }
}

struct Stage {
    transform: Box<dyn Transform>,
    gate: StageGate,
    /// Built-in prepack, rebuilt per run with the kernel selection setting
    builtin_prepack: bool,
}

impl Stage {
    fn new(transform: Box<dyn Transform>, gate: StageGate) -> Self {
        Self {
            transform,
            gate,
            builtin_prepack: false,
        }
    }
}

/// Ordered, replaceable list of rewrite stages
pub struct TransformPipeline {
    stages: Vec<Stage>,
}

impl Default for TransformPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl TransformPipeline {
    /// The standard stage order
    pub fn new() -> Self {
        let mut prepack = Stage::new(
            Box::new(WeightPrepack::default()),
            StageGate::Feature(Feature::WeightsPrepack),
        );
        prepack.builtin_prepack = true;

        let stages = vec![
            Stage::new(Box::new(ConvBnFolding), StageGate::InferenceFeature(Feature::ConvBnFolding)),
            Stage::new(Box::new(LinearBnFolding), StageGate::InferenceFeature(Feature::LinearBnFolding)),
            Stage::new(
                Box::new(ReplaceDropout),
                StageGate::InferenceFeature(Feature::ReplaceDropoutWithIdentity),
            ),
            Stage::new(Box::new(ConcatLinear), StageGate::InferenceFeature(Feature::ConcatLinear)),
            Stage::new(Box::new(OptimizeLstm), StageGate::Feature(Feature::OptimizeLstm)),
            Stage::new(Box::new(DtypeConversion), StageGate::ReducedDtype),
            Stage::new(Box::new(OptimizerStateConversion), StageGate::Training),
            prepack,
            Stage::new(Box::new(FusedStepInstall), StageGate::TrainingFeature(Feature::FuseUpdateStep)),
        ];
        Self { stages }
    }

    /// Replace the stage with the same name, or append a new always-on stage
    pub fn with_transform(mut self, transform: Box<dyn Transform>) -> Self {
        match self.stages.iter_mut().find(|s| s.transform.name() == transform.name()) {
            Some(stage) => {
                stage.transform = transform;
                stage.builtin_prepack = false;
            }
            None => self.stages.push(Stage::new(transform, StageGate::Always)),
        }
        self
    }

    /// Replace or append a stage with an explicit gate
    pub fn with_gated_transform(mut self, transform: Box<dyn Transform>, gate: StageGate) -> Self {
        self.stages.retain(|s| s.transform.name() != transform.name());
        self.stages.push(Stage::new(transform, gate));
        self
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.transform.name()).collect()
    }

    /// Optimize a copy of `model` (and `optimizer`); the inputs are untouched
    pub fn optimize(
        &self,
        model: &Module,
        optimizer: Option<&Optimizer>,
        options: OptimizeOptions,
    ) -> ForgeResult<Optimized> {
        let plan = self.prepare(model, optimizer.map(Optimizer::family), &options)?;
        if plan.device == DeviceClass::Accelerator {
            warn!("optimizing a copy on an accelerator device; optimize_in_place avoids the extra memory");
        }
        let cloned = clone_model_and_optimizer(model, optimizer);
        debug!(remapped = cloned.remap.len(), "cloned model and optimizer");
        self.execute(plan, cloned.model, cloned.optimizer, options)
    }

    /// Optimize `model` (and `optimizer`) directly, consuming them
    pub fn optimize_in_place(
        &self,
        model: Module,
        optimizer: Option<Optimizer>,
        options: OptimizeOptions,
    ) -> ForgeResult<Optimized> {
        let plan = self.prepare(&model, optimizer.as_ref().map(Optimizer::family), &options)?;
        self.execute(plan, model, optimizer, options)
    }

    /// Resolve, validate and apply policy. Nothing is modified here.
    fn prepare(
        &self,
        model: &Module,
        optimizer: Option<crate::optim::OptimizerFamily>,
        options: &OptimizeOptions,
    ) -> ForgeResult<RunPlan> {
        let requested = resolve(&options.level, &options.overrides)?;
        let runtime = match options.runtime {
            Some(rt) => rt,
            None => runtime_config()?,
        };

        if model.is_scripted() {
            warn!(model = %model.name, "model is already captured, returning it unchanged");
            return Ok(RunPlan::passthrough(requested, runtime, optimizer.is_some()));
        }

        let training = model.is_training();
        match (training, optimizer.is_some()) {
            (true, false) => {
                return Err(argument_error!(
                    "{} is in training mode but no optimizer was given",
                    model.name
                ))
            }
            (false, true) => {
                return Err(argument_error!(
                    "an optimizer was given but {} is in eval mode",
                    model.name
                ))
            }
            _ => {}
        }

        let model_device = model.device()?;
        let probe = match &options.probe {
            Some(p) => p.clone(),
            None => probe_for(model_device.unwrap_or(DeviceClass::Host)),
        };
        let device = probe.device_class();
        if let Some(md) = model_device {
            if md != device {
                return Err(ForgeError::MixedDevice(format!(
                    "{} lives on {} but the capability probe is for {}",
                    model.name, md, device
                )));
            }
        }

        let decision = apply_device_policy(
            requested,
            probe.as_ref(),
            options.dtype,
            optimizer,
            options.sample_input.is_some(),
        )?;
        info!(
            level = %decision.config.level,
            %device,
            dtype = %options.dtype,
            training,
            features = ?decision.config.enabled_features(),
            "optimization plan resolved"
        );

        Ok(RunPlan {
            config: decision.config,
            overrides: decision.overrides,
            drop_sample_input: decision.drop_sample_input,
            runtime,
            probe,
            device,
            training,
            passthrough: false,
        })
    }

    fn execute(
        &self,
        plan: RunPlan,
        mut model: Module,
        mut optimizer: Option<Optimizer>,
        options: OptimizeOptions,
    ) -> ForgeResult<Optimized> {
        let mut stats = PipelineStats {
            policy_overrides: plan.overrides.clone(),
            passthrough: plan.passthrough,
            ..Default::default()
        };
        let dtype = if plan.passthrough { DType::F32 } else { options.dtype };

        let mut attrs = optimizer
            .as_mut()
            .map(Optimizer::take_param_attrs)
            .unwrap_or_default();

        if !plan.passthrough {
            let sample = if plan.drop_sample_input {
                None
            } else {
                options.sample_input.as_ref()
            };
            let mut ctx = TransformContext {
                model: &mut model,
                optimizer: optimizer.as_mut(),
                attrs: &mut attrs,
                probe: plan.probe.as_ref(),
                dtype,
                split_master_weight: plan.config.split_master_weight,
                sample_input: sample,
            };

            if channels_last_applies(plan.runtime.channels_last, plan.probe.as_ref()) {
                run_stage(&ChannelsLastConversion, &mut ctx, &mut stats)?;
            } else {
                stats.record("channels_last", StageOutcome::Skipped);
            }

            let prepack = WeightPrepack::new(plan.config.auto_kernel_selection);
            for stage in &self.stages {
                let name = stage.transform.name();
                if !stage.gate.allows(&plan.config, plan.training, dtype) {
                    stats.record(name, StageOutcome::Skipped);
                    continue;
                }
                let transform: &dyn Transform = if stage.builtin_prepack {
                    &prepack
                } else {
                    stage.transform.as_ref()
                };
                run_stage(transform, &mut ctx, &mut stats)?;
            }
        }

        let training_attrs = match optimizer.as_mut() {
            Some(opt) => {
                opt.set_param_attrs(attrs);
                None
            }
            None => Some(attrs),
        };

        let capture = if plan.config.graph_mode && !plan.passthrough {
            let config = match options.capture {
                Some(c) => c,
                None => CaptureConfig::default().with_backend(plan.runtime.compiler_backend),
            };
            let tracer = options
                .tracer
                .clone()
                .unwrap_or_else(|| Arc::new(DefaultTracer::strict()));
            let compiler = options.compiler.clone().unwrap_or_else(|| Arc::new(DefaultCompiler));
            Some(GraphCapture::with_backends(&model, plan.training, tracer, compiler, config))
        } else {
            None
        };

        info!(stats = %stats, "optimization finished");
        let optimized = OptimizedModel {
            module: model,
            capture,
            config: plan.config,
            attrs: training_attrs.unwrap_or_default(),
            stats,
            dtype,
            device: plan.device,
            fp32_math: plan.runtime.fp32_math(plan.device),
        };
        Ok(match optimizer {
            Some(opt) => Optimized::Training(optimized, opt),
            None => Optimized::Inference(optimized),
        })
    }
}

/// Run one stage, downgrading recoverable failures to warnings
fn run_stage(transform: &dyn Transform, ctx: &mut TransformContext<'_>, stats: &mut PipelineStats) -> ForgeResult<()> {
    let name = transform.name();
    // Shape surprises inside a rewrite leave the model as it was for that stage
    let result = transform.apply(ctx).map_err(|e| match e {
        ForgeError::ShapeMismatch(reason) => transform_failed(name, reason),
        other => other,
    });
    match result {
        Ok(changed) => {
            debug!(stage = name, changed, "stage applied");
            stats.record(name, StageOutcome::Applied(changed));
            Ok(())
        }
        Err(e) if e.is_recoverable() => {
            warn!(stage = name, "stage skipped: {}", e);
            stats.record(name, StageOutcome::Failed(e.to_string()));
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn channels_last_applies(mode: ChannelsLastMode, probe: &dyn CapabilityProbe) -> bool {
    match mode {
        ChannelsLastMode::Disabled => false,
        ChannelsLastMode::Enabled => true,
        ChannelsLastMode::Auto => match probe.device_class() {
            DeviceClass::Host => true,
            DeviceClass::Accelerator => probe.supports(Capability::Block2dArray, DType::F32),
        },
    }
}

struct RunPlan {
    config: ResolvedConfig,
    overrides: Vec<crate::config::PolicyOverride>,
    drop_sample_input: bool,
    runtime: RuntimeConfig,
    probe: Arc<dyn CapabilityProbe>,
    device: DeviceClass,
    training: bool,
    passthrough: bool,
}

impl RunPlan {
    fn passthrough(config: ResolvedConfig, runtime: RuntimeConfig, training: bool) -> Self {
        Self {
            config,
            overrides: Vec::new(),
            drop_sample_input: true,
            runtime,
            probe: probe_for(DeviceClass::Host),
            device: DeviceClass::Host,
            training,
            passthrough: true,
        }
    }
}

/// Result of an optimization run
#[derive(Debug)]
pub enum Optimized {
    Inference(OptimizedModel),
    Training(OptimizedModel, Optimizer),
}

impl Optimized {
    pub fn model(&self) -> &OptimizedModel {
        match self {
            Optimized::Inference(m) | Optimized::Training(m, _) => m,
        }
    }

    pub fn optimizer(&self) -> Option<&Optimizer> {
        match self {
            Optimized::Training(_, opt) => Some(opt),
            Optimized::Inference(_) => None,
        }
    }

    pub fn into_parts(self) -> (OptimizedModel, Option<Optimizer>) {
        match self {
            Optimized::Inference(m) => (m, None),
            Optimized::Training(m, opt) => (m, Some(opt)),
        }
    }
}

/// An optimized model, optionally behind a graph capture wrapper
#[derive(Debug)]
pub struct OptimizedModel {
    module: Module,
    capture: Option<GraphCapture>,
    config: ResolvedConfig,
    attrs: ParamAttrRegistry,
    stats: PipelineStats,
    dtype: DType,
    device: DeviceClass,
    fp32_math: Fp32MathMode,
}

impl OptimizedModel {
    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Mutable access for training. A resolved inference capture keeps
    /// running the snapshot it was built from.
    pub fn module_mut(&mut self) -> &mut Module {
        &mut self.module
    }

    pub fn into_module(self) -> Module {
        self.module
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Bookkeeping for inference runs; training runs keep it on the optimizer
    pub fn param_attrs(&self) -> &ParamAttrRegistry {
        &self.attrs
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> DeviceClass {
        self.device
    }

    pub fn capture(&self) -> Option<&GraphCapture> {
        self.capture.as_ref()
    }

    pub fn capture_state(&self) -> Option<CaptureState> {
        self.capture.as_ref().map(GraphCapture::state)
    }

    pub fn forward(&self, input: &Tensor) -> ForgeResult<Tensor> {
        let rounded;
        let input = if self.fp32_math == Fp32MathMode::Bf32 && input.dtype() == DType::F32 {
            rounded = input.to_dtype(DType::BF16).to_dtype(DType::F32);
            &rounded
        } else {
            input
        };
        match &self.capture {
            Some(capture) => capture.run(&self.module, input),
            None => self.module.forward(input),
        }
    }
}

/// Optimize a copy of `model` with the standard pipeline
pub fn optimize(model: &Module, optimizer: Option<&Optimizer>, options: OptimizeOptions) -> ForgeResult<Optimized> {
    TransformPipeline::new().optimize(model, optimizer, options)
}

/// Optimize `model` in place with the standard pipeline
pub fn optimize_in_place(
    model: Module,
    optimizer: Option<Optimizer>,
    options: OptimizeOptions,
) -> ForgeResult<Optimized> {
    TransformPipeline::new().optimize_in_place(model, optimizer, options)
}
