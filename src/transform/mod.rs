//! Model rewrite stages
//!
//! Each stage implements [`Transform`] and mutates the model (and, for
//! training, the optimizer) through a [`TransformContext`]. Stages return the
//! number of rewrites they made; the pipeline driver decides whether an error
//! aborts the run or is downgraded to a warning.

pub mod channels_last;
pub mod concat_linear;
pub mod dropout;
pub mod dtype_convert;
pub mod folding;
pub mod lstm;
pub mod optimizer_stages;
pub mod prepack;

pub use channels_last::ChannelsLastConversion;
pub use concat_linear::ConcatLinear;
pub use dropout::ReplaceDropout;
pub use dtype_convert::DtypeConversion;
pub use folding::{ConvBnFolding, LinearBnFolding};
pub use lstm::OptimizeLstm;
pub use optimizer_stages::{FusedStepInstall, OptimizerStateConversion};
pub use prepack::WeightPrepack;

use crate::backend::CapabilityProbe;
use crate::error::ForgeResult;
use crate::model::{Module, ModuleKind};
use crate::optim::{Optimizer, ParamAttrRegistry};
use crate::tensor::{DType, Tensor};

/// Everything a stage may read or rewrite
pub struct TransformContext<'a> {
    pub model: &'a mut Module,
    pub optimizer: Option<&'a mut Optimizer>,
    pub attrs: &'a mut ParamAttrRegistry,
    pub probe: &'a dyn CapabilityProbe,
    pub dtype: DType,
    pub split_master_weight: bool,
    pub sample_input: Option<&'a Tensor>,
}

impl TransformContext<'_> {
    pub fn is_training(&self) -> bool {
        self.optimizer.is_some()
    }
}

/// One rewrite stage
pub trait Transform: Send + Sync {
    /// Stage name used in logs and reports
    fn name(&self) -> &str;

    /// Apply the rewrite, returning how many sites changed
    fn apply(&self, ctx: &mut TransformContext<'_>) -> ForgeResult<usize>;
}

/// Modules whose weights take part in dtype conversion and prepacking
pub(crate) fn is_weight_layer(kind: &ModuleKind) -> bool {
    matches!(
        kind,
        ModuleKind::Linear { .. } | ModuleKind::Conv { .. } | ModuleKind::ConcatLinear { .. }
    )
}
