//! Per-parameter transformation records
//!
//! Whenever a stage replaces or re-encodes a parameter it records a
//! [`ParamAttr`] here. Entries are keyed by the id the optimizer sees: the
//! master parameter's id when a full-precision master copy exists, otherwise
//! the model parameter's own id.

use crate::error::{ForgeError, ForgeResult};
use crate::model::{ParamId, Parameter};
use crate::tensor::{DType, Tensor};
use std::collections::HashMap;

/// Snapshot of a parameter before any stage touched it
#[derive(Debug, Clone, PartialEq)]
pub struct OriginalParam {
    pub id: ParamId,
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl OriginalParam {
    pub fn of(param: &Parameter) -> Self {
        Self {
            id: param.id(),
            dtype: param.dtype(),
            shape: param.shape().to_vec(),
        }
    }
}

/// Blocked-layout record left by weight prepacking
#[derive(Debug, Clone, PartialEq)]
pub struct PackedWeight {
    pub block: usize,
    pub logical_shape: Vec<usize>,
    /// Input shape the block size was chosen for, if one was provided
    pub sample_input_shape: Option<Vec<usize>>,
}

#[derive(Debug)]
pub struct ParamAttr {
    /// Parameter currently installed in the model
    pub parameter: ParamId,
    pub original: OriginalParam,
    /// Full-precision copy the optimizer updates (non-split reduced training)
    pub master: Option<Parameter>,
    /// Full-precision shadow values kept alongside a reduced parameter (split mode)
    pub split: Option<Tensor>,
    pub packed: Option<PackedWeight>,
}

impl ParamAttr {
    pub fn new(parameter: ParamId, original: OriginalParam) -> Self {
        Self {
            parameter,
            original,
            master: None,
            split: None,
            packed: None,
        }
    }

    pub fn with_master(mut self, master: Parameter) -> Self {
        self.master = Some(master);
        self
    }

    pub fn with_split(mut self, shadow: Tensor) -> Self {
        self.split = Some(shadow);
        self
    }

    pub fn master_id(&self) -> Option<ParamId> {
        self.master.as_ref().map(Parameter::id)
    }

    /// Copy with the master re-created under a fresh id
    pub fn deep_copy(&self) -> Self {
        Self {
            parameter: self.parameter,
            original: self.original.clone(),
            master: self.master.as_ref().map(Parameter::deep_copy),
            split: self.split.clone(),
            packed: self.packed.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ParamAttrRegistry {
    entries: HashMap<ParamId, ParamAttr>,
}

impl ParamAttrRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `attr` under `key`.
    ///
    /// Re-recording a key is allowed as long as the master linkage agrees.
    /// Relinking a key to another master, or dropping its master, is an
    /// internal error.
    pub fn record(&mut self, key: ParamId, attr: ParamAttr) -> ForgeResult<()> {
        if let Some(existing) = self.entries.get(&key) {
            match (existing.master_id(), attr.master_id()) {
                (Some(old), Some(new)) if old != new => {
                    return Err(ForgeError::InternalError(format!(
                        "{} already linked to master {}, refusing {}",
                        key, old, new
                    )));
                }
                (Some(old), None) => {
                    return Err(ForgeError::InternalError(format!(
                        "{} is linked to master {}, refusing a record without it",
                        key, old
                    )));
                }
                _ => {}
            }
        }
        self.entries.insert(key, attr);
        Ok(())
    }

    /// Move the entry under `from` to `to`
    pub fn rekey(&mut self, from: ParamId, to: ParamId) -> ForgeResult<()> {
        if from == to {
            return Ok(());
        }
        if self.entries.contains_key(&to) {
            return Err(ForgeError::InternalError(format!(
                "cannot move {} to {}: key already recorded",
                from, to
            )));
        }
        let attr = self
            .entries
            .remove(&from)
            .ok_or(ForgeError::ParameterNotFound(from.raw()))?;
        self.entries.insert(to, attr);
        Ok(())
    }

    pub fn get(&self, key: ParamId) -> Option<&ParamAttr> {
        self.entries.get(&key)
    }

    pub fn get_mut(&mut self, key: ParamId) -> Option<&mut ParamAttr> {
        self.entries.get_mut(&key)
    }

    pub fn remove(&mut self, key: ParamId) -> Option<ParamAttr> {
        self.entries.remove(&key)
    }

    pub fn contains(&self, key: ParamId) -> bool {
        self.entries.contains_key(&key)
    }

    /// Key of the entry whose installed model parameter is `parameter`
    pub fn key_for_parameter(&self, parameter: ParamId) -> Option<ParamId> {
        self.entries
            .iter()
            .find(|(_, attr)| attr.parameter == parameter)
            .map(|(key, _)| *key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ParamId, &ParamAttr)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn has_masters(&self) -> bool {
        self.entries.values().any(|a| a.master.is_some())
    }
}
