//! Lazy graph capture
//!
//! A [`GraphCapture`] wraps an optimized model and resolves its execution
//! strategy on the first call, using that call's input as the example:
//!
//! ```text
//! Unresolved --(training)--------------------> EagerFallbackTrain
//! Unresolved --(trace ok)--------------------> JitTraced
//! Unresolved --(trace fails, compile ok)-----> DynamicCompiled
//! Unresolved --(both fail)-------------------> EagerFallbackInfer
//! ```
//!
//! Resolution happens exactly once. Concurrent first calls serialize on the
//! resolve lock; later calls read the published plan without locking.

pub mod compile;
pub mod trace;

pub use compile::{CompiledGraph, DefaultCompiler};
pub use trace::{DefaultTracer, TracedGraph};

use crate::config::{runtime_config, CompilerBackend};
use crate::error::ForgeResult;
use crate::internal_error;
use crate::model::Module;
use crate::tensor::Tensor;
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Default bound on guarded graph breaks before compilation is abandoned
pub const DEFAULT_MAX_GRAPH_BREAKS: usize = 8;

/// Resolution state of a capture wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum CaptureState {
    Unresolved = 0,
    JitTraced = 1,
    DynamicCompiled = 2,
    EagerFallbackInfer = 3,
    EagerFallbackTrain = 4,
}

impl CaptureState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => CaptureState::JitTraced,
            2 => CaptureState::DynamicCompiled,
            3 => CaptureState::EagerFallbackInfer,
            4 => CaptureState::EagerFallbackTrain,
            _ => CaptureState::Unresolved,
        }
    }

    pub fn is_resolved(&self) -> bool {
        *self != CaptureState::Unresolved
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CaptureConfig {
    pub max_graph_breaks: usize,
    pub backend: CompilerBackend,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_graph_breaks: DEFAULT_MAX_GRAPH_BREAKS,
            backend: CompilerBackend::Trace,
        }
    }
}

impl CaptureConfig {
    /// Default limits with the backend from the process runtime settings
    pub fn from_runtime() -> ForgeResult<Self> {
        Ok(Self::default().with_backend(runtime_config()?.compiler_backend))
    }

    pub fn with_max_graph_breaks(mut self, max: usize) -> Self {
        self.max_graph_breaks = max;
        self
    }

    pub fn with_backend(mut self, backend: CompilerBackend) -> Self {
        self.backend = backend;
        self
    }
}

/// Produces a static graph from a module and an example input
pub trait GraphTracer: Send + Sync {
    fn trace(&self, module: &Module, example: &Tensor) -> ForgeResult<TracedGraph>;
}

/// Produces a guarded, compiled graph from a module and an example input
pub trait GraphCompiler: Send + Sync {
    fn compile(&self, module: &Module, example: &Tensor, config: &CaptureConfig) -> ForgeResult<CompiledGraph>;
}

#[derive(Debug)]
enum Plan {
    Traced(TracedGraph),
    Compiled(CompiledGraph),
}

/// Once-resolving capture wrapper around a model snapshot
pub struct GraphCapture {
    state: AtomicU8,
    resolve_lock: Mutex<()>,
    plan: OnceCell<Plan>,
    snapshot: Module,
    training: bool,
    tracer: Arc<dyn GraphTracer>,
    compiler: Arc<dyn GraphCompiler>,
    config: CaptureConfig,
}

impl std::fmt::Debug for GraphCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphCapture")
            .field("state", &self.state())
            .field("training", &self.training)
            .field("config", &self.config)
            .finish()
    }
}

impl GraphCapture {
    /// Wrap a snapshot of `module` with the default tracer and compiler
    pub fn new(module: &Module, training: bool, config: CaptureConfig) -> Self {
        Self::with_backends(
            module,
            training,
            Arc::new(DefaultTracer::strict()),
            Arc::new(DefaultCompiler),
            config,
        )
    }

    pub fn with_backends(
        module: &Module,
        training: bool,
        tracer: Arc<dyn GraphTracer>,
        compiler: Arc<dyn GraphCompiler>,
        config: CaptureConfig,
    ) -> Self {
        Self {
            state: AtomicU8::new(CaptureState::Unresolved as u8),
            resolve_lock: Mutex::new(()),
            plan: OnceCell::new(),
            snapshot: module.deep_copy(),
            training,
            tracer,
            compiler,
            config,
        }
    }

    pub fn state(&self) -> CaptureState {
        CaptureState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &CaptureConfig {
        &self.config
    }

    /// Graph breaks of the compiled plan, if one was chosen
    pub fn graph_breaks(&self) -> Option<usize> {
        match self.plan.get() {
            Some(Plan::Compiled(g)) => Some(g.graph_breaks()),
            _ => None,
        }
    }

    /// Run one forward call. `live` is the caller's current model, used when
    /// training falls back to eager execution.
    pub fn run(&self, live: &Module, input: &Tensor) -> ForgeResult<Tensor> {
        if self.state().is_resolved() {
            return self.dispatch(live, input);
        }

        let _guard = self.resolve_lock.lock()?;
        // Another caller may have resolved while this one waited
        if self.state().is_resolved() {
            return self.dispatch(live, input);
        }
        self.resolve(input);
        self.dispatch(live, input)
    }

    fn dispatch(&self, live: &Module, input: &Tensor) -> ForgeResult<Tensor> {
        match self.state() {
            CaptureState::JitTraced | CaptureState::DynamicCompiled => match self.plan.get() {
                Some(Plan::Traced(g)) => g.execute(input),
                Some(Plan::Compiled(g)) => g.execute(input),
                None => Err(internal_error!("capture resolved without a published plan")),
            },
            CaptureState::EagerFallbackInfer => self.snapshot.forward(input),
            CaptureState::EagerFallbackTrain => live.forward(input),
            CaptureState::Unresolved => Err(internal_error!("dispatch on an unresolved capture")),
        }
    }

    /// Pick a plan; must be called with the resolve lock held
    fn resolve(&self, example: &Tensor) {
        if self.training {
            warn!("graph capture does not support training, running eagerly");
            self.publish(None, CaptureState::EagerFallbackTrain);
            return;
        }

        match self.tracer.trace(&self.snapshot, example) {
            Ok(graph) => {
                debug!(ops = graph.len(), "graph capture traced");
                self.publish(Some(Plan::Traced(graph)), CaptureState::JitTraced);
                return;
            }
            Err(e) => warn!("tracing failed ({}), trying dynamic compilation", e),
        }

        match self.compiler.compile(&self.snapshot, example, &self.config) {
            Ok(graph) => {
                debug!(graph_breaks = graph.graph_breaks(), "graph capture compiled");
                self.publish(Some(Plan::Compiled(graph)), CaptureState::DynamicCompiled);
            }
            Err(e) => {
                warn!("dynamic compilation failed ({}), running eagerly", e);
                self.publish(None, CaptureState::EagerFallbackInfer);
            }
        }
    }

    fn publish(&self, plan: Option<Plan>, state: CaptureState) {
        if let Some(plan) = plan {
            // Only reachable once per wrapper, under the resolve lock
            let _ = self.plan.set(plan);
        }
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Output of [`compile`]
#[derive(Debug)]
pub enum CompiledModule {
    Traced(TracedGraph),
    Compiled(CompiledGraph),
    Eager(Module),
}

impl CompiledModule {
    pub fn forward(&self, input: &Tensor) -> ForgeResult<Tensor> {
        match self {
            CompiledModule::Traced(g) => g.execute(input),
            CompiledModule::Compiled(g) => g.execute(input),
            CompiledModule::Eager(m) => m.forward(input),
        }
    }

    pub fn is_eager(&self) -> bool {
        matches!(self, CompiledModule::Eager(_))
    }
}

/// Capture `module` with the backend selected in the runtime settings,
/// returning the eager module unchanged if capture fails
pub fn compile(module: Module, example: &Tensor) -> ForgeResult<CompiledModule> {
    let config = CaptureConfig::from_runtime()?;
    let attempt = match config.backend {
        CompilerBackend::Trace => DefaultTracer::strict().trace(&module, example).map(CompiledModule::Traced),
        CompilerBackend::Interpret => DefaultCompiler
            .compile(&module, example, &config)
            .map(CompiledModule::Compiled),
    };
    match attempt {
        Ok(compiled) => Ok(compiled),
        Err(e) if e.is_recoverable() => {
            warn!("capture with {:?} failed ({}), keeping the eager module", config.backend, e);
            Ok(CompiledModule::Eager(module))
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mlp() -> Module {
        Module::sequential(
            "mlp",
            vec![Module::linear("fc", 3, 2, 9).unwrap(), Module::relu("act")],
        )
    }

    #[test]
    fn test_state_round_trip() {
        for s in [
            CaptureState::Unresolved,
            CaptureState::JitTraced,
            CaptureState::DynamicCompiled,
            CaptureState::EagerFallbackInfer,
            CaptureState::EagerFallbackTrain,
        ] {
            assert_eq!(CaptureState::from_u8(s as u8), s);
        }
    }

    #[test]
    fn test_static_model_is_traced() {
        let model = mlp();
        let capture = GraphCapture::new(&model, false, CaptureConfig::default());
        assert_eq!(capture.state(), CaptureState::Unresolved);

        let x = Tensor::filled(vec![2, 3], 0.4);
        let y = capture.run(&model, &x).unwrap();
        assert_eq!(capture.state(), CaptureState::JitTraced);
        assert_eq!(y, model.forward(&x).unwrap());
        assert_eq!(capture.graph_breaks(), None);
    }

    #[test]
    fn test_control_flow_is_compiled() {
        let model = Module::sequential(
            "net",
            vec![
                mlp(),
                Module::conditional("gate", 0.1, Module::relu("a"), Module::identity("b")),
            ],
        );
        let capture = GraphCapture::new(&model, false, CaptureConfig::default());
        let x = Tensor::filled(vec![1, 3], 1.0);
        capture.run(&model, &x).unwrap();
        assert_eq!(capture.state(), CaptureState::DynamicCompiled);
        assert_eq!(capture.graph_breaks(), Some(1));
    }

    #[test]
    fn test_training_runs_live_model() {
        let mut model = mlp();
        let capture = GraphCapture::new(&model, true, CaptureConfig::default());
        let x = Tensor::filled(vec![1, 3], 1.0);
        capture.run(&model, &x).unwrap();
        assert_eq!(capture.state(), CaptureState::EagerFallbackTrain);

        // Later edits to the live model are visible
        model.children_mut()[0].param_mut("bias").unwrap().data.assign_f32(&[5.0, 5.0]).unwrap();
        let y = capture.run(&model, &x).unwrap();
        assert_eq!(y, model.forward(&x).unwrap());
    }
}
