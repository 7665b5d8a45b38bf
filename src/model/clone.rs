//! Joint deep copy of a model and its optimizer
//!
//! Copying a model assigns fresh parameter ids, which silently detaches any
//! optimizer built against the old ids. [`clone_model_and_optimizer`] copies
//! both and rebinds every id-keyed structure of the optimizer (groups, state,
//! attribute registry) to the copy.

use super::module::Module;
use super::parameter::ParamId;
use crate::optim::{Optimizer, ParamAttrRegistry, ParamState};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Old-to-new parameter id mapping produced by a clone
#[derive(Debug, Default, Clone)]
pub struct ParamRemap {
    map: HashMap<ParamId, ParamId>,
}

impl ParamRemap {
    pub fn get(&self, old: ParamId) -> Option<ParamId> {
        self.map.get(&old).copied()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn insert(&mut self, old: ParamId, new: ParamId) {
        self.map.insert(old, new);
    }
}

/// Result of [`clone_model_and_optimizer`]
#[derive(Debug)]
pub struct ClonedPair {
    pub model: Module,
    pub optimizer: Option<Optimizer>,
    /// Model parameters, plus master parameters when any exist
    pub remap: ParamRemap,
}

/// Deep-copy `model` and `optimizer` so the copy's optimizer refers only to
/// the copy's parameters.
///
/// When the optimizer's attribute registry holds master parameters, the
/// masters are copied too and their old ids map to the new masters' ids;
/// this takes precedence over the model mapping for the same key.
pub fn clone_model_and_optimizer(model: &Module, optimizer: Option<&Optimizer>) -> ClonedPair {
    let mut new_model = model.deep_copy();
    propagate_flags(model, &mut new_model);

    debug_assert_eq!(model.parameters().len(), new_model.parameters().len());
    let mut remap = ParamRemap::default();
    for (old, new) in model.parameters().iter().zip(new_model.parameters()) {
        remap.insert(old.id(), new.id());
    }

    let Some(optimizer) = optimizer else {
        return ClonedPair {
            model: new_model,
            optimizer: None,
            remap,
        };
    };

    let model_remap = remap.clone();
    let mut attrs = ParamAttrRegistry::new();
    let mut moves = Vec::new();
    for (&key, attr) in optimizer.param_attrs().iter() {
        let mut copy = attr.deep_copy();
        copy.parameter = model_remap.get(attr.parameter).unwrap_or(attr.parameter);

        let new_key = match (attr.master_id(), copy.master_id()) {
            (Some(old_master), Some(new_master)) => {
                remap.insert(old_master, new_master);
                new_master
            }
            _ => model_remap.get(key).unwrap_or(key),
        };
        copy.original.id = remap.get(attr.original.id).unwrap_or(attr.original.id);

        // Keys are unique in the source registry
        if let Err(e) = attrs.record(key, copy) {
            warn!("dropping attribute record for {}: {}", key, e);
            continue;
        }
        moves.push((key, new_key));
    }
    // New ids are fresh, so moving one entry never lands on a pending old key
    for (old, new) in moves {
        if let Err(e) = attrs.rekey(old, new) {
            warn!("dropping attribute record for {}: {}", old, e);
            attrs.remove(old);
        }
    }

    let mut groups = optimizer.groups().to_vec();
    let mut state: HashMap<ParamId, ParamState> = HashMap::new();
    for group in &mut groups {
        for id in &mut group.params {
            let old = *id;
            match remap.get(old) {
                Some(new) => {
                    if let Some(s) = optimizer.state().get(&old) {
                        state.insert(new, s.clone());
                    }
                    *id = new;
                }
                None => warn!("optimizer parameter {} is not part of the model", old),
            }
        }
    }

    debug!(
        params = remap.len(),
        attrs = attrs.len(),
        state = state.len(),
        "cloned model and optimizer"
    );

    ClonedPair {
        model: new_model,
        optimizer: Some(Optimizer::from_parts(
            optimizer.kind(),
            groups,
            state,
            attrs,
            optimizer.step_mode(),
        )),
        remap,
    }
}

/// Copy [`super::ModuleFlags`] from `src` onto `dst`, walking both trees in lockstep
pub fn propagate_flags(src: &Module, dst: &mut Module) {
    *dst.flags_mut() = src.flags();
    for (s, d) in src.children().iter().zip(dst.children_mut().iter_mut()) {
        propagate_flags(s, d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::{OptimizerKind, OriginalParam, ParamAttr};
    use crate::tensor::{DType, Tensor};
    use crate::model::Parameter;

    fn model() -> Module {
        Module::sequential(
            "net",
            vec![
                Module::linear("fc1", 4, 3, 1).unwrap(),
                Module::relu("act"),
                Module::linear("fc2", 3, 2, 2).unwrap(),
            ],
        )
    }

    #[test]
    fn test_clone_without_optimizer() {
        let m = model();
        let pair = clone_model_and_optimizer(&m, None);
        assert!(pair.optimizer.is_none());
        assert_eq!(pair.remap.len(), 4);
        for old in m.parameter_ids() {
            assert!(pair.model.find_parameter(pair.remap.get(old).unwrap()).is_some());
        }
    }

    #[test]
    fn test_groups_and_state_follow_the_copy() {
        let mut m = model();
        let mut opt = Optimizer::for_model(OptimizerKind::sgd(0.9), &m, 0.1);
        for p in m.parameters_mut() {
            let n = p.data.numel();
            p.set_grad(Tensor::filled(p.shape().to_vec(), 1.0 / n as f32));
        }
        opt.step(&mut m).unwrap();

        let pair = clone_model_and_optimizer(&m, Some(&opt));
        let new_opt = pair.optimizer.unwrap();

        let new_ids = pair.model.parameter_ids();
        assert_eq!(new_opt.param_ids(), new_ids);
        for (old, new) in m.parameter_ids().into_iter().zip(new_ids) {
            assert_eq!(new_opt.state()[&new], opt.state()[&old]);
        }
    }

    #[test]
    fn test_masters_are_rekeyed() {
        let mut m = model();
        let mut opt = Optimizer::for_model(OptimizerKind::adam(), &m, 0.1);

        // Move one weight to a master copy, as reduced-precision training does
        let old_id = m.parameter_ids()[0];
        let reduced = Parameter::new(m.parameters()[0].data.to_dtype(DType::BF16));
        let reduced_id = reduced.id();
        let master = m.replace_parameter(old_id, reduced).unwrap();
        let attr = ParamAttr::new(reduced_id, OriginalParam::of(&master)).with_master(master);
        opt.param_attrs_mut().record(old_id, attr).unwrap();

        let pair = clone_model_and_optimizer(&m, Some(&opt));
        let new_opt = pair.optimizer.unwrap();

        let new_master = pair.remap.get(old_id).unwrap();
        assert_ne!(new_master, old_id);
        assert_eq!(new_opt.param_ids()[0], new_master);

        let attr = new_opt.param_attrs().get(new_master).unwrap();
        assert_eq!(attr.master_id(), Some(new_master));
        assert_eq!(Some(attr.parameter), pair.remap.get(reduced_id));
        assert!(pair.model.find_parameter(attr.parameter).is_some());
        assert_eq!(attr.original.id, new_master);
    }

    #[test]
    fn test_original_ids_follow_the_copy() {
        let m = model();
        let mut opt = Optimizer::for_model(OptimizerKind::sgd(0.0), &m, 0.1);
        let id = m.parameter_ids()[1];
        let attr = ParamAttr::new(id, OriginalParam::of(m.find_parameter(id).unwrap()));
        opt.param_attrs_mut().record(id, attr).unwrap();

        let pair = clone_model_and_optimizer(&m, Some(&opt));
        let new_id = pair.remap.get(id).unwrap();
        let new_opt = pair.optimizer.unwrap();
        let copied = new_opt.param_attrs().get(new_id).unwrap();
        assert_eq!(copied.original.id, new_id);
        assert_eq!(copied.parameter, new_id);
        assert!(pair.model.find_parameter(copied.original.id).is_some());
    }

    #[test]
    fn test_flags_propagate() {
        let mut m = model();
        m.children_mut()[0].flags_mut().master_weight_split = true;

        let pair = clone_model_and_optimizer(&m, None);
        assert!(pair.model.children()[0].flags().master_weight_split);
        assert!(!pair.model.children()[2].flags().master_weight_split);
    }
}
