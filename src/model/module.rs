//! Module tree
//!
//! A [`Module`] owns its named parameters and its children. Parameter order
//! is stable: a module's own parameters in insertion order, then each child
//! depth-first. Two structurally identical trees therefore enumerate
//! parameters in lockstep, which is what the cloner relies on.

use super::parameter::{ParamId, Parameter};
use crate::backend::DeviceClass;
use crate::error::{ForgeError, ForgeResult};

/// How a [`ModuleKind::Parallel`] block merges branch outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combine {
    /// Elementwise sum (branches must agree on shape)
    Sum,
    /// Concatenate along the last dimension
    Concat,
}

/// Layer type and its static configuration
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleKind {
    /// Children run in order
    Sequential,
    /// Every child sees the same input
    Parallel { combine: Combine },
    /// `weight [out, in]`, optional `bias [out]`
    Linear {
        in_features: usize,
        out_features: usize,
    },
    /// Sibling linears merged into one `weight [sum(splits), in]`
    ConcatLinear {
        in_features: usize,
        splits: Vec<usize>,
        combine: Combine,
    },
    /// Affine `weight`/`bias` over dim 1 with running statistics
    BatchNorm {
        num_features: usize,
        eps: f32,
        running_mean: Vec<f32>,
        running_var: Vec<f32>,
    },
    /// Stride 1, no padding. Weight is `[out, in, k..]`, or `[in, out, k..]` when transposed.
    Conv {
        dims: usize,
        transposed: bool,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
    },
    Dropout { p: f32, seed: u64 },
    Identity,
    ReLU,
    /// Single-layer LSTM over `[T, N, input]`
    Lstm {
        input_size: usize,
        hidden_size: usize,
    },
    /// Same parameters as `Lstm`; input projection computed for all steps at once
    FusedLstm {
        input_size: usize,
        hidden_size: usize,
    },
    Embedding { num_embeddings: usize, dim: usize },
    /// Runs child 0 when the input mean exceeds `threshold`, child 1 otherwise
    Conditional { threshold: f32 },
    /// Runs children in order, but graph tracers cannot look inside
    Opaque { type_name: String },
}

impl ModuleKind {
    pub fn type_name(&self) -> &str {
        match self {
            ModuleKind::Sequential => "Sequential",
            ModuleKind::Parallel { .. } => "Parallel",
            ModuleKind::Linear { .. } => "Linear",
            ModuleKind::ConcatLinear { .. } => "ConcatLinear",
            ModuleKind::BatchNorm { .. } => "BatchNorm",
            ModuleKind::Conv { transposed: false, .. } => "Conv",
            ModuleKind::Conv { transposed: true, .. } => "ConvTranspose",
            ModuleKind::Dropout { .. } => "Dropout",
            ModuleKind::Identity => "Identity",
            ModuleKind::ReLU => "ReLU",
            ModuleKind::Lstm { .. } => "Lstm",
            ModuleKind::FusedLstm { .. } => "FusedLstm",
            ModuleKind::Embedding { .. } => "Embedding",
            ModuleKind::Conditional { .. } => "Conditional",
            ModuleKind::Opaque { type_name } => type_name,
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(
            self,
            ModuleKind::Sequential
                | ModuleKind::Parallel { .. }
                | ModuleKind::Conditional { .. }
                | ModuleKind::Opaque { .. }
        )
    }
}

/// Pipeline markers attached to a module after optimization.
///
/// Not part of the module's structure: [`Module::deep_copy`] resets them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModuleFlags {
    /// Parameters are trained through split master weights
    pub master_weight_split: bool,
    /// Weights were packed into a blocked layout
    pub weights_prepacked: bool,
}

#[derive(Debug)]
pub struct Module {
    pub name: String,
    pub kind: ModuleKind,
    params: Vec<(String, Parameter)>,
    children: Vec<Module>,
    training: bool,
    scripted: bool,
    flags: ModuleFlags,
}

impl Module {
    pub fn new(name: impl Into<String>, kind: ModuleKind) -> Self {
        Self {
            name: name.into(),
            kind,
            params: Vec::new(),
            children: Vec::new(),
            training: false,
            scripted: false,
            flags: ModuleFlags::default(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, param: Parameter) -> Self {
        self.params.push((name.into(), param));
        self
    }

    pub fn with_child(mut self, child: Module) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: Vec<Module>) -> Self {
        self.children.extend(children);
        self
    }

    // ========== Parameters ==========

    pub fn param(&self, name: &str) -> Option<&Parameter> {
        self.params.iter().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    pub fn param_mut(&mut self, name: &str) -> Option<&mut Parameter> {
        self.params.iter_mut().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    /// Set or replace a named parameter, returning the previous one
    pub fn set_param(&mut self, name: &str, param: Parameter) -> Option<Parameter> {
        match self.params.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, param)),
            None => {
                self.params.push((name.to_string(), param));
                None
            }
        }
    }

    /// This module's own parameters (not its children's)
    pub fn local_params(&self) -> impl Iterator<Item = (&str, &Parameter)> {
        self.params.iter().map(|(n, p)| (n.as_str(), p))
    }

    pub fn local_params_mut(&mut self) -> impl Iterator<Item = (&str, &mut Parameter)> {
        self.params.iter_mut().map(|(n, p)| (n.as_str(), p))
    }

    /// All parameters in canonical (lockstep) order
    pub fn parameters(&self) -> Vec<&Parameter> {
        let mut out = Vec::new();
        self.collect_params(&mut out);
        out
    }

    pub fn parameters_mut(&mut self) -> Vec<&mut Parameter> {
        let mut out = Vec::new();
        self.collect_params_mut(&mut out);
        out
    }

    fn collect_params<'a>(&'a self, out: &mut Vec<&'a Parameter>) {
        out.extend(self.params.iter().map(|(_, p)| p));
        for child in &self.children {
            child.collect_params(out);
        }
    }

    fn collect_params_mut<'a>(&'a mut self, out: &mut Vec<&'a mut Parameter>) {
        out.extend(self.params.iter_mut().map(|(_, p)| p));
        for child in &mut self.children {
            child.collect_params_mut(out);
        }
    }

    pub fn parameter_ids(&self) -> Vec<ParamId> {
        self.parameters().iter().map(|p| p.id()).collect()
    }

    pub fn find_parameter(&self, id: ParamId) -> Option<&Parameter> {
        self.parameters().into_iter().find(|p| p.id() == id)
    }

    pub fn find_parameter_mut(&mut self, id: ParamId) -> Option<&mut Parameter> {
        self.parameters_mut().into_iter().find(|p| p.id() == id)
    }

    /// Swap the parameter with `id` for `replacement`, returning the old one
    pub fn replace_parameter(&mut self, id: ParamId, replacement: Parameter) -> ForgeResult<Parameter> {
        if let Some((_, slot)) = self.params.iter_mut().find(|(_, p)| p.id() == id) {
            return Ok(std::mem::replace(slot, replacement));
        }
        let mut replacement = Some(replacement);
        for child in &mut self.children {
            if child.find_parameter(id).is_some() {
                let r = replacement
                    .take()
                    .ok_or_else(|| ForgeError::InternalError("replacement consumed twice".into()))?;
                return child.replace_parameter(id, r);
            }
        }
        Err(ForgeError::ParameterNotFound(id.raw()))
    }

    // ========== Children ==========

    pub fn children(&self) -> &[Module] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut Vec<Module> {
        &mut self.children
    }

    /// Depth-first pre-order visit of this module and every descendant
    pub fn visit(&self, f: &mut dyn FnMut(&Module)) {
        f(self);
        for child in &self.children {
            child.visit(f);
        }
    }

    /// Mutable pre-order visit; stops at the first error
    pub fn try_visit_mut(&mut self, f: &mut dyn FnMut(&mut Module) -> ForgeResult<()>) -> ForgeResult<()> {
        f(self)?;
        for child in &mut self.children {
            child.try_visit_mut(f)?;
        }
        Ok(())
    }

    pub fn count_kind(&self, pred: impl Fn(&ModuleKind) -> bool) -> usize {
        let mut count = 0;
        self.visit(&mut |m| {
            if pred(&m.kind) {
                count += 1;
            }
        });
        count
    }

    // ========== Mode and markers ==========

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Set training mode recursively
    pub fn train(&mut self, training: bool) {
        self.training = training;
        for child in &mut self.children {
            child.train(training);
        }
    }

    pub fn eval(&mut self) {
        self.train(false);
    }

    /// Whether the module is already a captured/scripted artifact
    pub fn is_scripted(&self) -> bool {
        self.scripted
    }

    pub fn mark_scripted(&mut self) {
        self.scripted = true;
    }

    pub fn flags(&self) -> ModuleFlags {
        self.flags
    }

    pub fn flags_mut(&mut self) -> &mut ModuleFlags {
        &mut self.flags
    }

    // ========== Device ==========

    /// Device class shared by every parameter; `None` for parameter-free trees
    pub fn device(&self) -> ForgeResult<Option<DeviceClass>> {
        let mut found: Option<DeviceClass> = None;
        for p in self.parameters() {
            match found {
                None => found = Some(p.device()),
                Some(d) if d != p.device() => {
                    return Err(ForgeError::MixedDevice(format!(
                        "parameters on both {} and {}",
                        d,
                        p.device()
                    )))
                }
                Some(_) => {}
            }
        }
        Ok(found)
    }

    /// Retag every parameter with `device`
    pub fn to_device(mut self, device: DeviceClass) -> Self {
        for p in self.parameters_mut() {
            p.data = p.data.clone().on_device(device);
        }
        self
    }

    /// Structural copy with freshly identified parameters.
    ///
    /// Training mode and the scripted marker are copied; [`ModuleFlags`] are not.
    pub fn deep_copy(&self) -> Self {
        Self {
            name: self.name.clone(),
            kind: self.kind.clone(),
            params: self
                .params
                .iter()
                .map(|(n, p)| (n.clone(), p.deep_copy()))
                .collect(),
            children: self.children.iter().map(Module::deep_copy).collect(),
            training: self.training,
            scripted: self.scripted,
            flags: ModuleFlags::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    fn leaf(name: &str, n: usize) -> Module {
        Module::new(name, ModuleKind::Identity).with_param("w", Parameter::new(Tensor::zeros(vec![n])))
    }

    #[test]
    fn test_parameter_order_is_depth_first() {
        let tree = Module::new("root", ModuleKind::Sequential)
            .with_param("scale", Parameter::new(Tensor::zeros(vec![1])))
            .with_child(leaf("a", 2).with_child(leaf("a.inner", 3)))
            .with_child(leaf("b", 4));

        let sizes: Vec<usize> = tree.parameters().iter().map(|p| p.data.numel()).collect();
        assert_eq!(sizes, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_deep_copy_is_lockstep_and_fresh() {
        let mut tree = Module::new("root", ModuleKind::Sequential)
            .with_child(leaf("a", 2))
            .with_child(leaf("b", 3));
        tree.train(true);
        tree.flags_mut().master_weight_split = true;

        let copy = tree.deep_copy();
        assert!(copy.is_training());
        assert!(!copy.flags().master_weight_split);

        for (old, new) in tree.parameters().iter().zip(copy.parameters()) {
            assert_ne!(old.id(), new.id());
            assert_eq!(old.shape(), new.shape());
        }
    }

    #[test]
    fn test_replace_parameter_in_child() {
        let mut tree = Module::new("root", ModuleKind::Sequential).with_child(leaf("a", 2));
        let id = tree.parameter_ids()[0];

        let old = tree
            .replace_parameter(id, Parameter::new(Tensor::filled(vec![2], 1.0)))
            .unwrap();
        assert_eq!(old.id(), id);
        assert!(tree.find_parameter(id).is_none());
        assert_eq!(tree.parameters()[0].data.to_f32_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_replace_missing_parameter() {
        let mut tree = leaf("a", 1);
        let stray = Parameter::new(Tensor::zeros(vec![1]));
        let err = tree
            .replace_parameter(stray.id(), Parameter::new(Tensor::zeros(vec![1])))
            .unwrap_err();
        assert!(matches!(err, ForgeError::ParameterNotFound(_)));
    }

    #[test]
    fn test_mixed_device_detected() {
        let tree = Module::new("root", ModuleKind::Sequential)
            .with_child(leaf("a", 1))
            .with_child(leaf("b", 1).to_device(DeviceClass::Accelerator));
        assert!(matches!(tree.device(), Err(ForgeError::MixedDevice(_))));

        let host = leaf("c", 1);
        assert_eq!(host.device().unwrap(), Some(DeviceClass::Host));
        assert_eq!(Module::new("empty", ModuleKind::ReLU).device().unwrap(), None);
    }
}
