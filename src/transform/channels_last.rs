//! Store convolution weights channels-last
//!
//! Runs ahead of the staged pipeline. Logical values and parameter ids are
//! unchanged; only the physical order of each conv weight moves.

use super::{Transform, TransformContext};
use crate::error::{transform_failed, ForgeResult};
use crate::model::ModuleKind;
use crate::tensor::MemoryFormat;

pub struct ChannelsLastConversion;

impl Transform for ChannelsLastConversion {
    fn name(&self) -> &str {
        "channels_last"
    }

    fn apply(&self, ctx: &mut TransformContext<'_>) -> ForgeResult<usize> {
        let stage = self.name().to_string();
        let mut converted = 0;
        ctx.model.try_visit_mut(&mut |module| {
            if !matches!(module.kind, ModuleKind::Conv { dims: 1..=3, .. }) {
                return Ok(());
            }
            let name = module.name.clone();
            if let Some(weight) = module.param_mut("weight") {
                if weight.data.format() == MemoryFormat::Contiguous {
                    weight.data = weight
                        .data
                        .to_format(MemoryFormat::ChannelsLast)
                        .map_err(|e| transform_failed(&stage, format!("{}: {}", name, e)))?;
                    converted += 1;
                }
            }
            Ok(())
        })?;
        Ok(converted)
    }
}
