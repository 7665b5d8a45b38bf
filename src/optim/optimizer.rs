//! Optimizers over a module's parameters
//!
//! An [`Optimizer`] refers to parameters by [`ParamId`] only. The values it
//! updates live either in the model, in a master copy held by the
//! [`ParamAttrRegistry`], or in a split-mode shadow tensor, depending on how
//! the pipeline transformed each parameter.

use super::fused::{fused_update, supports_fused};
use super::param_attr::ParamAttrRegistry;
use crate::backend::DeviceClass;
use crate::error::{ForgeError, ForgeResult};
use crate::model::{Module, ParamId};
use crate::tensor::{DType, Tensor};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Optimizer algorithm family, used for fused-update allow-lists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum OptimizerFamily {
    Sgd,
    Adam,
    AdamW,
    Adagrad,
    Lamb,
    RmsProp,
}

impl fmt::Display for OptimizerFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptimizerFamily::Sgd => "SGD",
            OptimizerFamily::Adam => "Adam",
            OptimizerFamily::AdamW => "AdamW",
            OptimizerFamily::Adagrad => "Adagrad",
            OptimizerFamily::Lamb => "Lamb",
            OptimizerFamily::RmsProp => "RMSprop",
        };
        write!(f, "{}", name)
    }
}

/// Algorithm and its hyper-parameters (learning rate lives on the group)
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OptimizerKind {
    Sgd {
        momentum: f32,
        dampening: f32,
        nesterov: bool,
    },
    Adam { beta1: f32, beta2: f32, eps: f32 },
    AdamW { beta1: f32, beta2: f32, eps: f32 },
    Adagrad { lr_decay: f32, eps: f32 },
    Lamb { beta1: f32, beta2: f32, eps: f32 },
    RmsProp { alpha: f32, eps: f32, momentum: f32 },
}

impl OptimizerKind {
    pub fn sgd(momentum: f32) -> Self {
        OptimizerKind::Sgd {
            momentum,
            dampening: 0.0,
            nesterov: false,
        }
    }

    pub fn adam() -> Self {
        OptimizerKind::Adam {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }

    pub fn adamw() -> Self {
        OptimizerKind::AdamW {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }

    pub fn adagrad() -> Self {
        OptimizerKind::Adagrad {
            lr_decay: 0.0,
            eps: 1e-10,
        }
    }

    pub fn lamb() -> Self {
        OptimizerKind::Lamb {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-6,
        }
    }

    pub fn rmsprop(momentum: f32) -> Self {
        OptimizerKind::RmsProp {
            alpha: 0.99,
            eps: 1e-8,
            momentum,
        }
    }

    pub fn family(&self) -> OptimizerFamily {
        match self {
            OptimizerKind::Sgd { .. } => OptimizerFamily::Sgd,
            OptimizerKind::Adam { .. } => OptimizerFamily::Adam,
            OptimizerKind::AdamW { .. } => OptimizerFamily::AdamW,
            OptimizerKind::Adagrad { .. } => OptimizerFamily::Adagrad,
            OptimizerKind::Lamb { .. } => OptimizerFamily::Lamb,
            OptimizerKind::RmsProp { .. } => OptimizerFamily::RmsProp,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParamGroup {
    pub params: Vec<ParamId>,
    pub lr: f32,
    pub weight_decay: f32,
}

impl ParamGroup {
    pub fn new(params: Vec<ParamId>, lr: f32) -> Self {
        Self {
            params,
            lr,
            weight_decay: 0.0,
        }
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

/// Per-parameter step counter and named buffers (momentum, moments, ...)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamState {
    pub step: u64,
    pub buffers: BTreeMap<String, Tensor>,
}

impl ParamState {
    /// Buffer values, or zeros if the buffer does not exist yet
    pub(crate) fn read(&self, name: &str, len: usize) -> Vec<f32> {
        self.buffers
            .get(name)
            .map(Tensor::to_f32_vec)
            .unwrap_or_else(|| vec![0.0; len])
    }

    pub(crate) fn write(&mut self, name: &str, values: Vec<f32>, shape: &[usize]) -> ForgeResult<()> {
        match self.buffers.get_mut(name) {
            Some(buf) => buf.assign_f32(&values),
            None => {
                self.buffers
                    .insert(name.to_string(), Tensor::from_vec(values, shape.to_vec())?);
                Ok(())
            }
        }
    }

    pub fn has(&self, name: &str) -> bool {
        self.buffers.contains_key(name)
    }
}

/// How `step` applies updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum StepMode {
    /// Discrete elementwise passes on the parameter (or its master copy)
    #[default]
    Plain,
    /// Single-pass update kernel; with `split_master_weight` the kernel
    /// updates the full-precision shadow and writes back the reduced copy
    Fused { split_master_weight: bool },
}

#[derive(Debug)]
pub struct Optimizer {
    kind: OptimizerKind,
    groups: Vec<ParamGroup>,
    state: HashMap<ParamId, ParamState>,
    param_attrs: ParamAttrRegistry,
    step_mode: StepMode,
}

impl Optimizer {
    pub fn new(kind: OptimizerKind, groups: Vec<ParamGroup>) -> Self {
        Self {
            kind,
            groups,
            state: HashMap::new(),
            param_attrs: ParamAttrRegistry::new(),
            step_mode: StepMode::Plain,
        }
    }

    /// One group over every trainable parameter of `model`
    pub fn for_model(kind: OptimizerKind, model: &Module, lr: f32) -> Self {
        let params = model
            .parameters()
            .into_iter()
            .filter(|p| p.requires_grad)
            .map(|p| p.id())
            .collect();
        Self::new(kind, vec![ParamGroup::new(params, lr)])
    }

    pub(crate) fn from_parts(
        kind: OptimizerKind,
        groups: Vec<ParamGroup>,
        state: HashMap<ParamId, ParamState>,
        param_attrs: ParamAttrRegistry,
        step_mode: StepMode,
    ) -> Self {
        Self {
            kind,
            groups,
            state,
            param_attrs,
            step_mode,
        }
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn family(&self) -> OptimizerFamily {
        self.kind.family()
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub fn groups_mut(&mut self) -> &mut Vec<ParamGroup> {
        &mut self.groups
    }

    pub fn param_ids(&self) -> Vec<ParamId> {
        self.groups.iter().flat_map(|g| g.params.iter().copied()).collect()
    }

    pub fn state(&self) -> &HashMap<ParamId, ParamState> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut HashMap<ParamId, ParamState> {
        &mut self.state
    }

    pub fn param_attrs(&self) -> &ParamAttrRegistry {
        &self.param_attrs
    }

    pub fn param_attrs_mut(&mut self) -> &mut ParamAttrRegistry {
        &mut self.param_attrs
    }

    pub(crate) fn take_param_attrs(&mut self) -> ParamAttrRegistry {
        std::mem::take(&mut self.param_attrs)
    }

    pub(crate) fn set_param_attrs(&mut self, attrs: ParamAttrRegistry) {
        self.param_attrs = attrs;
    }

    pub fn step_mode(&self) -> StepMode {
        self.step_mode
    }

    /// Switch update strategy. Fused modes require the family to be fusable on `device`.
    pub fn set_step_mode(&mut self, mode: StepMode, device: DeviceClass) -> ForgeResult<()> {
        if let StepMode::Fused { .. } = mode {
            if !supports_fused(device, self.family()) {
                return Err(ForgeError::InvalidConfiguration(format!(
                    "{} has no fused update on {}",
                    self.family(),
                    device
                )));
            }
        }
        self.step_mode = mode;
        Ok(())
    }

    /// Re-encode every state buffer as f32
    pub fn promote_state_to_f32(&mut self) -> usize {
        let mut promoted = 0;
        for state in self.state.values_mut() {
            for buf in state.buffers.values_mut() {
                if buf.dtype() != DType::F32 {
                    *buf = buf.to_dtype(DType::F32);
                    promoted += 1;
                }
            }
        }
        promoted
    }

    /// Clear gradients of every parameter the optimizer tracks
    pub fn zero_grad(&self, model: &mut Module) {
        let tracked: HashSet<ParamId> = self
            .param_ids()
            .into_iter()
            .map(|id| self.param_attrs.get(id).map(|a| a.parameter).unwrap_or(id))
            .collect();
        for p in model.parameters_mut() {
            if tracked.contains(&p.id()) {
                p.zero_grad();
            }
        }
    }

    /// Apply one update to every parameter that has a gradient.
    ///
    /// Gradients are always read from the parameter installed in the model.
    pub fn step(&mut self, model: &mut Module) -> ForgeResult<()> {
        let kind = self.kind;
        let mode = self.step_mode;

        for group in &self.groups {
            for &id in &group.params {
                let attr = self.param_attrs.get_mut(id);
                let model_id = attr.as_ref().map(|a| a.parameter).unwrap_or(id);

                let param = model
                    .find_parameter_mut(model_id)
                    .ok_or(ForgeError::ParameterNotFound(model_id.raw()))?;
                let grad = match &param.grad {
                    Some(g) => g.to_f32_vec(),
                    None => continue,
                };
                let shape = param.shape().to_vec();
                let state = self.state.entry(id).or_default();
                state.step += 1;

                match (attr, mode) {
                    // Reduced model copy, full-precision master updated
                    (Some(attr), _) if attr.master.is_some() => {
                        let master = attr
                            .master
                            .as_mut()
                            .ok_or_else(|| ForgeError::InternalError("master vanished".into()))?;
                        let mut values = master.data.to_f32_vec();
                        run_kernel(kind, mode, group, &mut values, &grad, state, &shape)?;
                        master.data.assign_f32(&values)?;
                        param.data.assign_f32(&values)?;
                    }
                    // Split: shadow carries the precision the reduced copy drops
                    (
                        Some(attr),
                        StepMode::Fused {
                            split_master_weight: true,
                        },
                    ) if attr.split.is_some() => {
                        let shadow = attr
                            .split
                            .as_mut()
                            .ok_or_else(|| ForgeError::InternalError("split shadow vanished".into()))?;
                        let mut values = shadow.to_f32_vec();
                        run_kernel(kind, mode, group, &mut values, &grad, state, &shape)?;
                        shadow.assign_f32(&values)?;
                        param.data.assign_f32(&values)?;
                    }
                    _ => {
                        let mut values = param.data.to_f32_vec();
                        run_kernel(kind, mode, group, &mut values, &grad, state, &shape)?;
                        param.data.assign_f32(&values)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn run_kernel(
    kind: OptimizerKind,
    mode: StepMode,
    group: &ParamGroup,
    values: &mut [f32],
    grad: &[f32],
    state: &mut ParamState,
    shape: &[usize],
) -> ForgeResult<()> {
    if values.len() != grad.len() {
        return Err(ForgeError::ShapeMismatch(format!(
            "gradient has {} values, parameter {}",
            grad.len(),
            values.len()
        )));
    }
    match mode {
        StepMode::Plain => plain_update(kind, group.lr, group.weight_decay, values, grad, state, shape),
        StepMode::Fused { .. } => fused_update(kind, group.lr, group.weight_decay, values, grad, state, shape),
    }
}

fn add_scaled(dst: &mut [f32], src: &[f32], alpha: f32) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += alpha * s;
    }
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Reference update: one elementwise pass per term
pub(crate) fn plain_update(
    kind: OptimizerKind,
    lr: f32,
    weight_decay: f32,
    p: &mut [f32],
    grad: &[f32],
    state: &mut ParamState,
    shape: &[usize],
) -> ForgeResult<()> {
    let n = p.len();
    let t = state.step as i32;
    let mut g = grad.to_vec();

    match kind {
        OptimizerKind::Sgd {
            momentum,
            dampening,
            nesterov,
        } => {
            if weight_decay != 0.0 {
                add_scaled(&mut g, p, weight_decay);
            }
            if momentum != 0.0 {
                let buf = if state.has("momentum_buffer") {
                    let mut buf = state.read("momentum_buffer", n);
                    buf.iter_mut().for_each(|b| *b *= momentum);
                    add_scaled(&mut buf, &g, 1.0 - dampening);
                    buf
                } else {
                    g.clone()
                };
                if nesterov {
                    add_scaled(&mut g, &buf, momentum);
                } else {
                    g.copy_from_slice(&buf);
                }
                state.write("momentum_buffer", buf, shape)?;
            }
            add_scaled(p, &g, -lr);
        }
        OptimizerKind::Adam { beta1, beta2, eps } | OptimizerKind::AdamW { beta1, beta2, eps } => {
            let decoupled = matches!(kind, OptimizerKind::AdamW { .. });
            if weight_decay != 0.0 {
                if decoupled {
                    p.iter_mut().for_each(|v| *v *= 1.0 - lr * weight_decay);
                } else {
                    add_scaled(&mut g, p, weight_decay);
                }
            }
            let mut m = state.read("exp_avg", n);
            let mut v = state.read("exp_avg_sq", n);
            m.iter_mut().zip(&g).for_each(|(m, g)| *m = beta1 * *m + (1.0 - beta1) * g);
            v.iter_mut().zip(&g).for_each(|(v, g)| *v = beta2 * *v + (1.0 - beta2) * g * g);
            let bc1 = 1.0 - beta1.powi(t);
            let bc2 = 1.0 - beta2.powi(t);
            for i in 0..n {
                p[i] -= lr * (m[i] / bc1) / ((v[i] / bc2).sqrt() + eps);
            }
            state.write("exp_avg", m, shape)?;
            state.write("exp_avg_sq", v, shape)?;
        }
        OptimizerKind::Adagrad { lr_decay, eps } => {
            let clr = lr / (1.0 + (t - 1) as f32 * lr_decay);
            if weight_decay != 0.0 {
                add_scaled(&mut g, p, weight_decay);
            }
            let mut sum = state.read("sum", n);
            sum.iter_mut().zip(&g).for_each(|(s, g)| *s += g * g);
            for i in 0..n {
                p[i] -= clr * g[i] / (sum[i].sqrt() + eps);
            }
            state.write("sum", sum, shape)?;
        }
        OptimizerKind::Lamb { beta1, beta2, eps } => {
            let mut m = state.read("exp_avg", n);
            let mut v = state.read("exp_avg_sq", n);
            m.iter_mut().zip(&g).for_each(|(m, g)| *m = beta1 * *m + (1.0 - beta1) * g);
            v.iter_mut().zip(&g).for_each(|(v, g)| *v = beta2 * *v + (1.0 - beta2) * g * g);
            let bc1 = 1.0 - beta1.powi(t);
            let bc2 = 1.0 - beta2.powi(t);
            let mut update: Vec<f32> = (0..n)
                .map(|i| (m[i] / bc1) / ((v[i] / bc2).sqrt() + eps))
                .collect();
            if weight_decay != 0.0 {
                add_scaled(&mut update, p, weight_decay);
            }
            let (pn, un) = (norm(p), norm(&update));
            let trust = if pn > 0.0 && un > 0.0 { pn / un } else { 1.0 };
            add_scaled(p, &update, -lr * trust);
            state.write("exp_avg", m, shape)?;
            state.write("exp_avg_sq", v, shape)?;
        }
        OptimizerKind::RmsProp { alpha, eps, momentum } => {
            if weight_decay != 0.0 {
                add_scaled(&mut g, p, weight_decay);
            }
            let mut sq = state.read("square_avg", n);
            sq.iter_mut().zip(&g).for_each(|(s, g)| *s = alpha * *s + (1.0 - alpha) * g * g);
            let scaled: Vec<f32> = (0..n).map(|i| g[i] / (sq[i].sqrt() + eps)).collect();
            if momentum > 0.0 {
                let mut buf = state.read("momentum_buffer", n);
                buf.iter_mut().zip(&scaled).for_each(|(b, s)| *b = momentum * *b + s);
                add_scaled(p, &buf, -lr);
                state.write("momentum_buffer", buf, shape)?;
            } else {
                add_scaled(p, &scaled, -lr);
            }
            state.write("square_avg", sq, shape)?;
        }
    }
    Ok(())
}
