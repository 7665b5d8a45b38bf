//! Dynamic compilation with guarded graph breaks
//!
//! Static stretches of the model become frozen segments. Every conditional
//! is lowered to a guard that evaluates the branch condition at run time and
//! dispatches to one of two compiled sub-segments; each guard counts as a
//! graph break. Opaque modules cannot be lowered at all.

use super::trace::freeze;
use super::{CaptureConfig, GraphCompiler};
use crate::config::CompilerBackend;
use crate::error::{ForgeError, ForgeResult};
use crate::model::{Module, ModuleKind};
use crate::tensor::Tensor;
use tracing::debug;

#[derive(Debug)]
enum Segment {
    /// Module with weights frozen to contiguous f32
    Frozen(Module),
    /// Module kept as an interpreted copy
    Interpreted(Module),
    Chain(Vec<Segment>),
    Guard {
        threshold: f32,
        then_branch: Box<Segment>,
        else_branch: Box<Segment>,
    },
}

impl Segment {
    fn run(&self, input: &Tensor) -> ForgeResult<Tensor> {
        match self {
            Segment::Frozen(m) | Segment::Interpreted(m) => m.forward(input),
            Segment::Chain(segments) => {
                let mut x = input.clone();
                for s in segments {
                    x = s.run(&x)?;
                }
                Ok(x)
            }
            Segment::Guard {
                threshold,
                then_branch,
                else_branch,
            } => {
                let values = input.to_f32_vec();
                let mean = values.iter().sum::<f32>() / values.len().max(1) as f32;
                if mean > *threshold {
                    then_branch.run(input)
                } else {
                    else_branch.run(input)
                }
            }
        }
    }
}

/// A compiled module
#[derive(Debug)]
pub struct CompiledGraph {
    root: Segment,
    graph_breaks: usize,
    backend: CompilerBackend,
}

impl CompiledGraph {
    pub fn graph_breaks(&self) -> usize {
        self.graph_breaks
    }

    pub fn backend(&self) -> CompilerBackend {
        self.backend
    }

    pub fn execute(&self, input: &Tensor) -> ForgeResult<Tensor> {
        self.root.run(input)
    }
}

/// Compiler lowering the module tree into guarded segments
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCompiler;

impl DefaultCompiler {
    fn lower(&self, module: &Module, backend: CompilerBackend, breaks: &mut usize) -> ForgeResult<Segment> {
        match &module.kind {
            ModuleKind::Opaque { type_name } => Err(ForgeError::CaptureFailed(format!(
                "{}: cannot compile opaque {}",
                module.name, type_name
            ))),
            ModuleKind::Sequential => {
                let segments = module
                    .children()
                    .iter()
                    .map(|child| self.lower(child, backend, breaks))
                    .collect::<ForgeResult<Vec<_>>>()?;
                Ok(Segment::Chain(segments))
            }
            ModuleKind::Conditional { threshold } => {
                *breaks += 1;
                let [then_branch, else_branch] = module.children() else {
                    return Err(ForgeError::CaptureFailed(format!(
                        "{}: conditional needs exactly two branches",
                        module.name
                    )));
                };
                Ok(Segment::Guard {
                    threshold: *threshold,
                    then_branch: Box::new(self.lower(then_branch, backend, breaks)?),
                    else_branch: Box::new(self.lower(else_branch, backend, breaks)?),
                })
            }
            _ => {
                let mut dynamic = false;
                let mut opaque = None;
                module.visit(&mut |m| match &m.kind {
                    ModuleKind::Conditional { .. } => dynamic = true,
                    ModuleKind::Opaque { type_name } if opaque.is_none() => opaque = Some(type_name.clone()),
                    _ => {}
                });
                if let Some(type_name) = opaque {
                    return Err(ForgeError::CaptureFailed(format!(
                        "{}: contains opaque {}",
                        module.name, type_name
                    )));
                }
                if dynamic {
                    // Control flow nested below a non-sequential container runs as a whole
                    *breaks += 1;
                    return Ok(Segment::Interpreted(module.deep_copy()));
                }
                Ok(match backend {
                    CompilerBackend::Trace => Segment::Frozen(freeze(module)),
                    CompilerBackend::Interpret => Segment::Interpreted(module.deep_copy()),
                })
            }
        }
    }
}

impl GraphCompiler for DefaultCompiler {
    fn compile(&self, module: &Module, example: &Tensor, config: &CaptureConfig) -> ForgeResult<CompiledGraph> {
        let mut graph_breaks = 0;
        let root = self.lower(module, config.backend, &mut graph_breaks)?;
        if graph_breaks > config.max_graph_breaks {
            return Err(ForgeError::CaptureFailed(format!(
                "{} graph breaks exceed the limit of {}",
                graph_breaks, config.max_graph_breaks
            )));
        }
        let graph = CompiledGraph {
            root,
            graph_breaks,
            backend: config.backend,
        };
        // Validate on the example before handing the graph out
        graph.execute(example)?;
        debug!(graph_breaks, backend = ?config.backend, "compiled module");
        Ok(graph)
    }
}
