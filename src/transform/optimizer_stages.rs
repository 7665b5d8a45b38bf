//! Training-only stages that act on the optimizer

use super::{Transform, TransformContext};
use crate::error::{ForgeError, ForgeResult};
use crate::optim::StepMode;

/// Keep optimizer state buffers at full precision after parameters narrow
pub struct OptimizerStateConversion;

impl Transform for OptimizerStateConversion {
    fn name(&self) -> &str {
        "optimizer_state_conversion"
    }

    fn apply(&self, ctx: &mut TransformContext<'_>) -> ForgeResult<usize> {
        Ok(ctx
            .optimizer
            .as_deref_mut()
            .map(|opt| opt.promote_state_to_f32())
            .unwrap_or(0))
    }
}

/// Switch the optimizer to the fused single-pass update
pub struct FusedStepInstall;

impl Transform for FusedStepInstall {
    fn name(&self) -> &str {
        "fused_update_step"
    }

    fn apply(&self, ctx: &mut TransformContext<'_>) -> ForgeResult<usize> {
        let device = ctx.probe.device_class();
        let split = ctx.split_master_weight;
        let optimizer = ctx
            .optimizer
            .as_deref_mut()
            .ok_or_else(|| ForgeError::InternalError("fused update requested without an optimizer".into()))?;
        optimizer.set_step_mode(
            StepMode::Fused {
                split_master_weight: split,
            },
            device,
        )?;
        Ok(1)
    }
}
