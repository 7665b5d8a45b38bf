//! Example-driven tracing into a flat, frozen op list
//!
//! The tracer walks the module tree alongside an example activation.
//! Sequential containers are flattened, no-op layers dropped, and every
//! remaining layer is frozen: its weights are materialized as contiguous f32
//! so replay never re-decodes packed or reduced-precision storage.
//!
//! Input-dependent control flow and opaque modules produce tracer warnings.
//! A strict tracer turns any warning into a failure; a lenient one bakes in
//! the branch the example took.

use super::GraphTracer;
use crate::error::{ForgeError, ForgeResult};
use crate::model::{Module, ModuleKind, Parameter};
use crate::tensor::{DType, Tensor};
use tracing::{debug, warn};

/// A traced and frozen forward pass
#[derive(Debug)]
pub struct TracedGraph {
    ops: Vec<Module>,
}

impl TracedGraph {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Names of the frozen ops in execution order
    pub fn op_names(&self) -> Vec<&str> {
        self.ops.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn execute(&self, input: &Tensor) -> ForgeResult<Tensor> {
        let mut x = input.clone();
        for op in &self.ops {
            x = op.forward(&x)?;
        }
        Ok(x)
    }
}

/// Copy `module` with every parameter as contiguous f32
pub(crate) fn freeze(module: &Module) -> Module {
    let mut frozen = module.deep_copy();
    for p in frozen.parameters_mut() {
        let data = p.data.to_contiguous().to_dtype(DType::F32);
        *p = Parameter::frozen(data);
    }
    frozen
}

/// Tracer that records the path an example input takes
#[derive(Debug, Clone, Copy)]
pub struct DefaultTracer {
    strict: bool,
}

impl Default for DefaultTracer {
    fn default() -> Self {
        Self { strict: true }
    }
}

impl DefaultTracer {
    /// Strict: any tracer warning fails the trace
    pub fn strict() -> Self {
        Self { strict: true }
    }

    /// Lenient: warnings are logged and the example's path is frozen in
    pub fn lenient() -> Self {
        Self { strict: false }
    }

    fn flatten(
        &self,
        module: &Module,
        x: Tensor,
        ops: &mut Vec<Module>,
        warnings: &mut Vec<String>,
    ) -> ForgeResult<Tensor> {
        match &module.kind {
            ModuleKind::Sequential => {
                let mut x = x;
                for child in module.children() {
                    x = self.flatten(child, x, ops, warnings)?;
                }
                Ok(x)
            }
            ModuleKind::Identity => Ok(x),
            ModuleKind::Dropout { .. } if !module.is_training() => Ok(x),
            ModuleKind::Conditional { threshold } => {
                warnings.push(format!(
                    "{}: branch depends on input values and will be fixed by the example",
                    module.name
                ));
                let values = x.to_f32_vec();
                let mean = values.iter().sum::<f32>() / values.len().max(1) as f32;
                let branch = if mean > *threshold { 0 } else { 1 };
                match module.children().get(branch) {
                    Some(child) => self.flatten(child, x, ops, warnings),
                    None => Ok(x),
                }
            }
            ModuleKind::Opaque { type_name } => {
                warnings.push(format!("{}: cannot trace into opaque {}", module.name, type_name));
                let y = module.forward(&x)?;
                ops.push(freeze(module));
                Ok(y)
            }
            _ => {
                module.visit(&mut |m| {
                    if matches!(m.kind, ModuleKind::Conditional { .. } | ModuleKind::Opaque { .. }) {
                        warnings.push(format!("{}: {} nested in {}", m.name, m.kind.type_name(), module.name));
                    }
                });
                let op = freeze(module);
                let y = op.forward(&x)?;
                ops.push(op);
                Ok(y)
            }
        }
    }
}

impl GraphTracer for DefaultTracer {
    fn trace(&self, module: &Module, example: &Tensor) -> ForgeResult<TracedGraph> {
        let mut ops = Vec::new();
        let mut warnings = Vec::new();
        self.flatten(module, example.clone(), &mut ops, &mut warnings)?;

        if !warnings.is_empty() {
            if self.strict {
                return Err(ForgeError::CaptureFailed(format!(
                    "tracer warnings treated as errors: {}",
                    warnings.join("; ")
                )));
            }
            for w in &warnings {
                warn!("tracer: {}", w);
            }
        }

        let graph = TracedGraph { ops };
        debug!(ops = graph.len(), "traced module");
        Ok(graph)
    }
}
