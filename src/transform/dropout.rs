//! Replace dropout with identity for inference

use super::{Transform, TransformContext};
use crate::error::ForgeResult;
use crate::model::ModuleKind;

pub struct ReplaceDropout;

impl Transform for ReplaceDropout {
    fn name(&self) -> &str {
        "replace_dropout_with_identity"
    }

    fn apply(&self, ctx: &mut TransformContext<'_>) -> ForgeResult<usize> {
        let mut replaced = 0;
        ctx.model.try_visit_mut(&mut |module| {
            if let ModuleKind::Dropout { .. } = module.kind {
                module.kind = ModuleKind::Identity;
                replaced += 1;
            }
            Ok(())
        })?;
        Ok(replaced)
    }
}
