//! Fold inference batch norm into the preceding convolution or linear layer
//!
//! `bn(layer(x))` with running statistics is an affine map per output channel,
//! so it can be absorbed into the layer's weight rows and bias:
//! `s = gamma / sqrt(var + eps)`, `W' = W * s`, `b' = (b - mean) * s + beta`.

use super::{Transform, TransformContext};
use crate::error::{transform_failed, ForgeResult};
use crate::model::{Module, ModuleKind, Parameter};
use crate::tensor::Tensor;
use tracing::debug;

/// Folds `Conv -> BatchNorm` pairs inside sequential containers
pub struct ConvBnFolding;

/// Folds `Linear -> BatchNorm` pairs inside sequential containers
pub struct LinearBnFolding;

impl Transform for ConvBnFolding {
    fn name(&self) -> &str {
        "conv_bn_folding"
    }

    fn apply(&self, ctx: &mut TransformContext<'_>) -> ForgeResult<usize> {
        fold_pairs(ctx.model, self.name(), &|kind| {
            matches!(kind, ModuleKind::Conv { transposed: false, .. })
        })
    }
}

impl Transform for LinearBnFolding {
    fn name(&self) -> &str {
        "linear_bn_folding"
    }

    fn apply(&self, ctx: &mut TransformContext<'_>) -> ForgeResult<usize> {
        fold_pairs(ctx.model, self.name(), &|kind| matches!(kind, ModuleKind::Linear { .. }))
    }
}

fn fold_pairs(model: &mut Module, stage: &str, is_target: &dyn Fn(&ModuleKind) -> bool) -> ForgeResult<usize> {
    let mut folded = 0;
    model.try_visit_mut(&mut |module| {
        if module.kind != ModuleKind::Sequential {
            return Ok(());
        }
        let mut i = 0;
        while i + 1 < module.children().len() {
            let children = module.children_mut();
            let pair_matches =
                is_target(&children[i].kind) && matches!(children[i + 1].kind, ModuleKind::BatchNorm { .. });
            if pair_matches {
                let bn = children.remove(i + 1);
                if let Err(e) = fold_into(&mut children[i], &bn, stage) {
                    // Put the norm back so the model stays intact
                    children.insert(i + 1, bn);
                    return Err(e);
                }
                debug!(stage, layer = %children[i].name, norm = %bn.name, "folded batch norm");
                folded += 1;
            }
            i += 1;
        }
        Ok(())
    })?;
    Ok(folded)
}

fn fold_into(layer: &mut Module, bn: &Module, stage: &str) -> ForgeResult<()> {
    let ModuleKind::BatchNorm {
        num_features,
        eps,
        running_mean,
        running_var,
    } = &bn.kind
    else {
        return Err(transform_failed(stage, format!("{} is not a batch norm", bn.name)));
    };

    let out_channels = match layer.kind {
        ModuleKind::Linear { out_features, .. } => out_features,
        ModuleKind::Conv { out_channels, .. } => out_channels,
        _ => return Err(transform_failed(stage, format!("{} cannot absorb a norm", layer.name))),
    };
    if out_channels != *num_features {
        return Err(transform_failed(
            stage,
            format!(
                "{} produces {} channels but {} normalizes {}",
                layer.name, out_channels, bn.name, num_features
            ),
        ));
    }

    let gamma = bn
        .param("weight")
        .map(|p| p.data.to_f32_vec())
        .unwrap_or_else(|| vec![1.0; out_channels]);
    let beta = bn
        .param("bias")
        .map(|p| p.data.to_f32_vec())
        .unwrap_or_else(|| vec![0.0; out_channels]);
    let stats_ok = [gamma.len(), beta.len(), running_mean.len(), running_var.len()]
        .iter()
        .all(|&n| n == out_channels);
    if !stats_ok {
        return Err(transform_failed(
            stage,
            format!("{} statistics do not cover {} channels", bn.name, out_channels),
        ));
    }

    let name = layer.name.clone();
    let weight = layer
        .param("weight")
        .ok_or_else(|| transform_failed(stage, format!("{} has no weight", name)))?;
    let mut w = weight.data.to_f32_vec();
    let row = w.len() / out_channels.max(1);
    if out_channels == 0 || row == 0 || row * out_channels != w.len() {
        return Err(transform_failed(
            stage,
            format!("{} weight has {} values for {} channels", name, w.len(), out_channels),
        ));
    }
    let bias = match layer.param("bias") {
        Some(b) => b.data.to_f32_vec(),
        None => vec![0.0; out_channels],
    };
    if bias.len() != out_channels {
        return Err(transform_failed(
            stage,
            format!("{} bias has {} values for {} channels", name, bias.len(), out_channels),
        ));
    }

    let scale: Vec<f32> = (0..out_channels)
        .map(|c| gamma[c] / (running_var[c] + eps).sqrt())
        .collect();
    for (c, chunk) in w.chunks_mut(row).enumerate() {
        chunk.iter_mut().for_each(|v| *v *= scale[c]);
    }
    let folded: Vec<f32> = (0..out_channels)
        .map(|c| (bias[c] - running_mean[c]) * scale[c] + beta[c])
        .collect();

    // Both tensors are built before either is installed
    let mut new_weight = weight.data.clone();
    new_weight.assign_f32(&w)?;
    let new_bias = match layer.param("bias") {
        Some(b) => {
            let mut t = b.data.clone();
            t.assign_f32(&folded)?;
            t
        }
        None => Tensor::from_vec(folded, vec![out_channels])?.on_device(weight.device()),
    };

    if let Some(weight) = layer.param_mut("weight") {
        weight.data = new_weight;
    }
    match layer.param_mut("bias") {
        Some(b) => b.data = new_bias,
        None => {
            layer.set_param("bias", Parameter::new(new_bias));
        }
    }
    Ok(())
}
