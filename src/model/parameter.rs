//! Trainable parameters with stable identity
//!
//! A [`ParamId`] is the identity optimizers, attribute registries and the
//! cloner key on. Ids come from a process-wide counter and are never reused,
//! so a deep copy always yields parameters no existing map refers to.

use crate::backend::DeviceClass;
use crate::tensor::{DType, Tensor};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_PARAM_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ParamId(u64);

impl ParamId {
    fn fresh() -> Self {
        ParamId(NEXT_PARAM_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ParamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// A named tensor with identity and an optional gradient.
///
/// Deliberately not `Clone`: copying a parameter must go through
/// [`Parameter::deep_copy`], which assigns a new id.
#[derive(Debug)]
pub struct Parameter {
    id: ParamId,
    pub data: Tensor,
    pub grad: Option<Tensor>,
    pub requires_grad: bool,
}

impl Parameter {
    pub fn new(data: Tensor) -> Self {
        Self {
            id: ParamId::fresh(),
            data,
            grad: None,
            requires_grad: true,
        }
    }

    pub fn frozen(data: Tensor) -> Self {
        Self {
            requires_grad: false,
            ..Self::new(data)
        }
    }

    pub fn id(&self) -> ParamId {
        self.id
    }

    /// Copy data and gradient into a parameter with a fresh id
    pub fn deep_copy(&self) -> Self {
        Self {
            id: ParamId::fresh(),
            data: self.data.clone(),
            grad: self.grad.clone(),
            requires_grad: self.requires_grad,
        }
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn device(&self) -> DeviceClass {
        self.data.device()
    }

    pub fn set_grad(&mut self, grad: Tensor) {
        self.grad = Some(grad);
    }

    pub fn zero_grad(&mut self) {
        self.grad = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = Parameter::new(Tensor::zeros(vec![2]));
        let b = Parameter::new(Tensor::zeros(vec![2]));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_deep_copy_gets_fresh_id_and_own_storage() {
        let mut a = Parameter::new(Tensor::from_vec(vec![1.0, 2.0], vec![2]).unwrap());
        a.set_grad(Tensor::filled(vec![2], 0.5));

        let mut b = a.deep_copy();
        assert_ne!(a.id(), b.id());
        assert_eq!(b.grad, a.grad);

        b.data.assign_f32(&[9.0, 9.0]).unwrap();
        assert_eq!(a.data.to_f32_vec(), vec![1.0, 2.0]);
    }

    #[test]
    fn test_display() {
        let p = Parameter::new(Tensor::zeros(vec![1]));
        assert_eq!(p.id().to_string(), format!("p{}", p.id().raw()));
    }
}
