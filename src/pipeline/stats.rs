//! Per-run pipeline report
//!
//! - [`StageOutcome`] - what happened to one stage
//! - [`PipelineStats`] - ordered outcomes for a whole `optimize` call

use crate::config::PolicyOverride;
use serde::Serialize;
use std::fmt;

/// Result of one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum StageOutcome {
    /// Ran and changed this many sites
    Applied(usize),
    /// Gated off by configuration, mode or dtype
    Skipped,
    /// Failed recoverably; the model is as the previous stage left it
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageReport {
    pub stage: String,
    #[serde(flatten)]
    pub outcome: StageOutcome,
}

/// Statistics for one optimization run
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    /// Stage outcomes in execution order
    pub stages: Vec<StageReport>,

    /// Features the device policy switched off
    pub policy_overrides: Vec<PolicyOverride>,

    /// The run was skipped because the model was already captured
    pub passthrough: bool,
}

impl PipelineStats {
    pub(crate) fn record(&mut self, stage: &str, outcome: StageOutcome) {
        self.stages.push(StageReport {
            stage: stage.to_string(),
            outcome,
        });
    }

    pub fn outcome(&self, stage: &str) -> Option<&StageOutcome> {
        self.stages.iter().find(|r| r.stage == stage).map(|r| &r.outcome)
    }

    /// Sites changed by `stage`, if it ran
    pub fn applied(&self, stage: &str) -> Option<usize> {
        match self.outcome(stage) {
            Some(StageOutcome::Applied(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &StageReport> {
        self.stages
            .iter()
            .filter(|r| matches!(r.outcome, StageOutcome::Failed(_)))
    }

    pub fn total_rewrites(&self) -> usize {
        self.stages
            .iter()
            .map(|r| match r.outcome {
                StageOutcome::Applied(n) => n,
                _ => 0,
            })
            .sum()
    }
}

impl fmt::Display for PipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passthrough {
            return write!(f, "passthrough (already captured)");
        }
        let mut first = true;
        for report in &self.stages {
            if !first {
                write!(f, ", ")?;
            }
            first = false;
            match &report.outcome {
                StageOutcome::Applied(n) => write!(f, "{}={}", report.stage, n)?,
                StageOutcome::Skipped => write!(f, "{}=skip", report.stage)?,
                StageOutcome::Failed(_) => write!(f, "{}=failed", report.stage)?,
            }
        }
        if !self.policy_overrides.is_empty() {
            write!(f, " ({} policy overrides)", self.policy_overrides.len())?;
        }
        Ok(())
    }
}
