//! Merge sibling linear layers that share an input into one wider linear

use super::{Transform, TransformContext};
use crate::error::{transform_failed, ForgeResult};
use crate::model::{Combine, Module, ModuleKind, Parameter};
use crate::tensor::{DType, MemoryFormat, Tensor};
use tracing::debug;

pub struct ConcatLinear;

impl Transform for ConcatLinear {
    fn name(&self) -> &str {
        "concat_linear"
    }

    fn apply(&self, ctx: &mut TransformContext<'_>) -> ForgeResult<usize> {
        let stage = self.name().to_string();
        let mut merged = 0;
        ctx.model.try_visit_mut(&mut |module| {
            if let ModuleKind::Parallel { combine } = module.kind {
                if mergeable(module) {
                    merge(module, combine, &stage)?;
                    merged += 1;
                }
            }
            Ok(())
        })?;
        Ok(merged)
    }
}

/// Two or more plain f32 linear branches reading the same width
fn mergeable(module: &Module) -> bool {
    let children = module.children();
    if children.len() < 2 {
        return false;
    }
    let Some(first_in) = in_features(&children[0]) else {
        return false;
    };
    let has_bias = children[0].param("bias").is_some();
    children.iter().all(|c| {
        in_features(c) == Some(first_in)
            && c.param("bias").is_some() == has_bias
            && c.local_params().all(|(_, p)| {
                p.dtype() == DType::F32 && p.data.format() == MemoryFormat::Contiguous
            })
    })
}

fn in_features(module: &Module) -> Option<usize> {
    match module.kind {
        ModuleKind::Linear { in_features, .. } => Some(in_features),
        _ => None,
    }
}

fn merge(module: &mut Module, combine: Combine, stage: &str) -> ForgeResult<()> {
    let mut splits = Vec::new();
    let mut weight = Vec::new();
    let mut bias = Vec::new();
    let mut in_dim = 0;
    let mut device = None;

    for child in module.children() {
        let ModuleKind::Linear {
            in_features,
            out_features,
        } = child.kind
        else {
            return Err(transform_failed(stage, format!("{} is not linear", child.name)));
        };
        in_dim = in_features;
        splits.push(out_features);
        let w = child
            .param("weight")
            .ok_or_else(|| transform_failed(stage, format!("{} has no weight", child.name)))?;
        device = Some(w.device());
        weight.extend(w.data.to_f32_vec());
        if let Some(b) = child.param("bias") {
            bias.extend(b.data.to_f32_vec());
        }
    }

    if combine == Combine::Sum && splits.windows(2).any(|w| w[0] != w[1]) {
        return Err(transform_failed(
            stage,
            format!("{} sums branches of different widths {:?}", module.name, splits),
        ));
    }

    let total: usize = splits.iter().sum();
    let device = device.unwrap_or(crate::backend::DeviceClass::Host);
    let weight = Parameter::new(Tensor::from_vec(weight, vec![total, in_dim])?.on_device(device));
    let bias = if bias.is_empty() {
        None
    } else {
        Some(Parameter::new(Tensor::from_vec(bias, vec![total])?.on_device(device)))
    };

    debug!(stage, module = %module.name, ?splits, "merged sibling linears");
    module.kind = ModuleKind::ConcatLinear {
        in_features: in_dim,
        splits,
        combine,
    };
    module.children_mut().clear();
    module.set_param("weight", weight);
    if let Some(b) = bias {
        module.set_param("bias", b);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostProbe;
    use crate::optim::ParamAttrRegistry;

    fn run(model: &mut Module) -> ForgeResult<usize> {
        let probe = HostProbe::detect();
        let mut attrs = ParamAttrRegistry::new();
        let mut ctx = TransformContext {
            model,
            optimizer: None,
            attrs: &mut attrs,
            probe: &probe,
            dtype: DType::F32,
            split_master_weight: false,
            sample_input: None,
        };
        ConcatLinear.apply(&mut ctx)
    }

    fn qkv(combine: Combine, widths: [usize; 3]) -> Module {
        Module::parallel(
            "qkv",
            combine,
            vec![
                Module::linear("q", 6, widths[0], 1).unwrap(),
                Module::linear("k", 6, widths[1], 2).unwrap(),
                Module::linear("v", 6, widths[2], 3).unwrap(),
            ],
        )
    }

    #[test]
    fn test_concat_branches_merged() {
        let mut model = qkv(Combine::Concat, [4, 4, 2]);
        let x = Tensor::filled(vec![2, 6], 0.3);
        let before = model.forward(&x).unwrap();

        assert_eq!(run(&mut model).unwrap(), 1);
        assert!(model.children().is_empty());
        assert!(matches!(model.kind, ModuleKind::ConcatLinear { .. }));
        assert_eq!(model.param("weight").unwrap().shape(), &[10, 6]);
        assert!(before.max_abs_diff(&model.forward(&x).unwrap()).unwrap() < 1e-6);
    }

    #[test]
    fn test_sum_branches_merged() {
        let mut model = qkv(Combine::Sum, [3, 3, 3]);
        let x = Tensor::filled(vec![1, 6], -0.7);
        let before = model.forward(&x).unwrap();

        assert_eq!(run(&mut model).unwrap(), 1);
        assert!(before.max_abs_diff(&model.forward(&x).unwrap()).unwrap() < 1e-5);
    }

    #[test]
    fn test_sum_of_unequal_widths_fails() {
        let mut model = qkv(Combine::Sum, [3, 2, 3]);
        assert!(run(&mut model).unwrap_err().is_recoverable());
        assert_eq!(model.children().len(), 3);
    }

    #[test]
    fn test_mixed_branches_left_alone() {
        let mut model = Module::parallel(
            "mix",
            Combine::Concat,
            vec![Module::linear("a", 4, 2, 1).unwrap(), Module::relu("b")],
        );
        assert_eq!(run(&mut model).unwrap(), 0);
    }
}
