//! Single-pass fused update kernels and per-device allow-lists

use super::optimizer::{OptimizerFamily, OptimizerKind, ParamState};
use crate::backend::DeviceClass;
use crate::error::{ForgeError, ForgeResult};

const HOST_FUSED: &[OptimizerFamily] = &[
    OptimizerFamily::Sgd,
    OptimizerFamily::Adagrad,
    OptimizerFamily::Adam,
    OptimizerFamily::AdamW,
    OptimizerFamily::Lamb,
];

const ACCELERATOR_FUSED: &[OptimizerFamily] = &[
    OptimizerFamily::Sgd,
    OptimizerFamily::Adam,
    OptimizerFamily::AdamW,
];

/// Optimizer families with a fused update on `device`
pub fn fused_allow_list(device: DeviceClass) -> &'static [OptimizerFamily] {
    match device {
        DeviceClass::Host => HOST_FUSED,
        DeviceClass::Accelerator => ACCELERATOR_FUSED,
    }
}

pub fn supports_fused(device: DeviceClass, family: OptimizerFamily) -> bool {
    fused_allow_list(device).contains(&family)
}

/// One pass over the elements: decay, moments and parameter update together
pub(crate) fn fused_update(
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

    match kind {
        OptimizerKind::Sgd {
            momentum,
            dampening,
            nesterov,
        } => {
            if momentum == 0.0 {
                for i in 0..n {
                    p[i] -= lr * (grad[i] + weight_decay * p[i]);
                }
                return Ok(());
            }
            let first = !state.has("momentum_buffer");
            let mut buf = state.read("momentum_buffer", n);
            for i in 0..n {
                let g = grad[i] + weight_decay * p[i];
                buf[i] = if first {
                    g
                } else {
                    momentum * buf[i] + (1.0 - dampening) * g
                };
                let step = if nesterov { g + momentum * buf[i] } else { buf[i] };
                p[i] -= lr * step;
            }
            state.write("momentum_buffer", buf, shape)
        }
        OptimizerKind::Adam { beta1, beta2, eps } | OptimizerKind::AdamW { beta1, beta2, eps } => {
            let decoupled = matches!(kind, OptimizerKind::AdamW { .. });
            let bc1 = 1.0 - beta1.powi(t);
            let bc2 = 1.0 - beta2.powi(t);
            let mut m = state.read("exp_avg", n);
            let mut v = state.read("exp_avg_sq", n);
            for i in 0..n {
                let g = if decoupled {
                    p[i] *= 1.0 - lr * weight_decay;
                    grad[i]
                } else {
                    grad[i] + weight_decay * p[i]
                };
                m[i] = beta1 * m[i] + (1.0 - beta1) * g;
                v[i] = beta2 * v[i] + (1.0 - beta2) * g * g;
                p[i] -= lr * (m[i] / bc1) / ((v[i] / bc2).sqrt() + eps);
            }
            state.write("exp_avg", m, shape)?;
            state.write("exp_avg_sq", v, shape)
        }
        OptimizerKind::Adagrad { lr_decay, eps } => {
            let clr = lr / (1.0 + (t - 1) as f32 * lr_decay);
            let mut sum = state.read("sum", n);
            for i in 0..n {
                let g = grad[i] + weight_decay * p[i];
                sum[i] += g * g;
                p[i] -= clr * g / (sum[i].sqrt() + eps);
            }
            state.write("sum", sum, shape)
        }
        OptimizerKind::Lamb { beta1, beta2, eps } => {
            // Trust ratio needs both norms before any element moves
            let bc1 = 1.0 - beta1.powi(t);
            let bc2 = 1.0 - beta2.powi(t);
            let mut m = state.read("exp_avg", n);
            let mut v = state.read("exp_avg_sq", n);
            let mut update = vec![0.0f32; n];
            let (mut p_sq, mut u_sq) = (0.0f32, 0.0f32);
            for i in 0..n {
                m[i] = beta1 * m[i] + (1.0 - beta1) * grad[i];
                v[i] = beta2 * v[i] + (1.0 - beta2) * grad[i] * grad[i];
                update[i] = (m[i] / bc1) / ((v[i] / bc2).sqrt() + eps) + weight_decay * p[i];
                p_sq += p[i] * p[i];
                u_sq += update[i] * update[i];
            }
            let (pn, un) = (p_sq.sqrt(), u_sq.sqrt());
            let trust = if pn > 0.0 && un > 0.0 { pn / un } else { 1.0 };
            for i in 0..n {
                p[i] -= lr * trust * update[i];
            }
            state.write("exp_avg", m, shape)?;
            state.write("exp_avg_sq", v, shape)
        }
        OptimizerKind::RmsProp { .. } => Err(ForgeError::InternalError(
            "RMSprop has no fused update kernel".to_string(),
        )),
    }
}
