//! Repack linear and convolution weights into a blocked layout
//!
//! The block is the probe's preferred width, narrowed for single-sample
//! inputs and never wider than needed to cover the output channels.
//! Parameter ids are preserved.
//!
//! Full-precision linear weights are only packed when automatic kernel
//! selection is on; otherwise they stay contiguous for the plain GEMM path.

use super::{is_weight_layer, Transform, TransformContext};
use crate::error::{transform_failed, ForgeResult};
use crate::model::ModuleKind;
use crate::optim::{OriginalParam, PackedWeight, ParamAttr};
use crate::tensor::{DType, MemoryFormat, Tensor};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct WeightPrepack {
    auto_kernel_selection: bool,
}

impl WeightPrepack {
    pub fn new(auto_kernel_selection: bool) -> Self {
        Self { auto_kernel_selection }
    }
}

impl Transform for WeightPrepack {
    fn name(&self) -> &str {
        "weights_prepack"
    }

    fn apply(&self, ctx: &mut TransformContext<'_>) -> ForgeResult<usize> {
        let preferred = ctx.probe.preferred_block();
        let sample_shape = ctx.sample_input.map(|t| t.shape().to_vec());
        let stage = self.name().to_string();
        let attrs = &mut *ctx.attrs;
        let sample = ctx.sample_input;
        let pack_f32_linear = self.auto_kernel_selection;

        let mut packed = 0;
        ctx.model.try_visit_mut(&mut |module| {
            if !is_weight_layer(&module.kind) {
                return Ok(());
            }
            let is_linear = matches!(module.kind, ModuleKind::Linear { .. } | ModuleKind::ConcatLinear { .. });
            let name = module.name.clone();
            let Some(weight) = module.param_mut("weight") else {
                return Ok(());
            };
            if matches!(weight.data.format(), MemoryFormat::Blocked { .. }) {
                return Ok(());
            }
            if is_linear && weight.dtype() == DType::F32 && !pack_f32_linear {
                return Ok(());
            }

            let rows = weight.shape().first().copied().unwrap_or(1);
            let block = choose_block(preferred, rows, sample);
            weight.data = weight
                .data
                .to_format(MemoryFormat::Blocked { block })
                .map_err(|e| transform_failed(&stage, format!("{}: {}", name, e)))?;

            let record = PackedWeight {
                block,
                logical_shape: weight.shape().to_vec(),
                sample_input_shape: sample_shape.clone(),
            };
            let id = weight.id();
            match attrs.key_for_parameter(id).and_then(|key| attrs.get_mut(key)) {
                Some(attr) => attr.packed = Some(record),
                None => {
                    let mut attr = ParamAttr::new(id, OriginalParam::of(weight));
                    attr.packed = Some(record);
                    attrs.record(id, attr)?;
                }
            }
            module.flags_mut().weights_prepacked = true;
            debug!(module = %name, block, "prepacked weight");
            packed += 1;
            Ok(())
        })?;
        Ok(packed)
    }
}

/// Block width for a weight with `rows` output channels
pub fn choose_block(preferred: usize, rows: usize, sample: Option<&Tensor>) -> usize {
    let mut block = preferred.max(1);
    let batch = sample.and_then(|t| t.shape().first().copied());
    if batch.is_some_and(|b| b <= 1) {
        block = block.min(8);
    }
    while block > 1 && block / 2 >= rows {
        block /= 2;
    }
    block
}
