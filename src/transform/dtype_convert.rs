//! Narrow eligible parameters to the requested reduced-precision dtype
//!
//! Inference: each eligible parameter is replaced by a reduced copy.
//!
//! Training without split: the reduced copy is installed in the model and the
//! original f32 parameter becomes its master. The master keeps the original
//! id, so optimizer groups and state need no rebinding.
//!
//! Training with split: the parameter is narrowed in place and its f32 values
//! are kept as a shadow for the fused update.

use super::{is_weight_layer, Transform, TransformContext};
use crate::error::ForgeResult;
use crate::model::{Module, ModuleKind, Parameter};
use crate::optim::{OriginalParam, ParamAttr, ParamAttrRegistry};
use crate::tensor::DType;
use tracing::debug;

pub struct DtypeConversion;

#[derive(Clone, Copy)]
enum Mode {
    Inference,
    Master,
    Split,
}

impl Transform for DtypeConversion {
    fn name(&self) -> &str {
        "dtype_conversion"
    }

    fn apply(&self, ctx: &mut TransformContext<'_>) -> ForgeResult<usize> {
        let dtype = ctx.dtype;
        if dtype == DType::F32 {
            return Ok(0);
        }
        let mode = match (ctx.is_training(), ctx.split_master_weight) {
            (false, _) => Mode::Inference,
            (true, false) => Mode::Master,
            (true, true) => Mode::Split,
        };

        let attrs = &mut *ctx.attrs;
        let mut converted = 0;
        ctx.model.try_visit_mut(&mut |module| {
            if eligible(&module.kind, !matches!(mode, Mode::Inference)) {
                converted += convert_module(module, dtype, mode, attrs)?;
            }
            Ok(())
        })?;
        debug!(%dtype, converted, "narrowed parameters");
        Ok(converted)
    }
}

fn eligible(kind: &ModuleKind, training: bool) -> bool {
    if is_weight_layer(kind) {
        return true;
    }
    // Lookup tables and recurrent layers are narrowed for inference only
    !training
        && matches!(
            kind,
            ModuleKind::Embedding { .. } | ModuleKind::Lstm { .. } | ModuleKind::FusedLstm { .. }
        )
}

fn convert_module(module: &mut Module, dtype: DType, mode: Mode, attrs: &mut ParamAttrRegistry) -> ForgeResult<usize> {
    let names: Vec<String> = module
        .local_params()
        .filter(|(_, p)| p.dtype() == DType::F32)
        .map(|(n, _)| n.to_string())
        .collect();

    for name in &names {
        let Some(param) = module.param_mut(name) else {
            continue;
        };
        let trainable = param.requires_grad;

        match mode {
            Mode::Split if trainable => {
                let original = OriginalParam::of(param);
                let shadow = param.data.clone();
                param.data = param.data.to_dtype(dtype);
                param.grad = param.grad.as_ref().map(|g| g.to_dtype(dtype));
                let id = param.id();
                attrs.record(id, ParamAttr::new(id, original).with_split(shadow))?;
                module.flags_mut().master_weight_split = true;
            }
            Mode::Master if trainable => {
                let reduced = narrowed(param, dtype);
                let reduced_id = reduced.id();
                if let Some(master) = module.set_param(name, reduced) {
                    let original = OriginalParam::of(&master);
                    attrs.record(master.id(), ParamAttr::new(reduced_id, original).with_master(master))?;
                }
            }
            _ => {
                let reduced = narrowed(param, dtype);
                let reduced_id = reduced.id();
                if let Some(old) = module.set_param(name, reduced) {
                    attrs.record(reduced_id, ParamAttr::new(reduced_id, OriginalParam::of(&old)))?;
                }
            }
        }
    }
    Ok(names.len())
}

fn narrowed(param: &Parameter, dtype: DType) -> Parameter {
    let mut reduced = Parameter::new(param.data.to_dtype(dtype));
    reduced.requires_grad = param.requires_grad;
    reduced.grad = param.grad.as_ref().map(|g| g.to_dtype(dtype));
    reduced
}
