//! Swap recurrent layers for the fused-projection variant
//!
//! Parameters are kept as they are, so optimizer groups and attribute
//! records stay valid without any rebinding.

use super::{Transform, TransformContext};
use crate::error::ForgeResult;
use crate::model::ModuleKind;

pub struct OptimizeLstm;

impl Transform for OptimizeLstm {
    fn name(&self) -> &str {
        "optimize_lstm"
    }

    fn apply(&self, ctx: &mut TransformContext<'_>) -> ForgeResult<usize> {
        let mut replaced = 0;
        ctx.model.try_visit_mut(&mut |module| {
            if let ModuleKind::Lstm {
                input_size,
                hidden_size,
            } = module.kind
            {
                module.kind = ModuleKind::FusedLstm {
                    input_size,
                    hidden_size,
                };
                replaced += 1;
            }
            Ok(())
        })?;
        Ok(replaced)
    }
}
