//! Runs validated plans. Reachable only through the mode controller.

use crate::core::error::NixgateError;
use crate::core::process::{ProcessRunner, RawOutcome};
use crate::engine::snapshot::Snapshot;
use crate::engine::validator::ExecutionPlan;

#[derive(Debug, Clone)]
pub struct StagedExecutor {
    runner: ProcessRunner,
}

impl StagedExecutor {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }

    /// One subprocess, no retries. A mutating plan without a snapshot
    /// taken before this call is refused without spawning.
    pub(crate) fn run(
        &self,
        plan: &ExecutionPlan,
        snapshot: Option<&Snapshot>,
    ) -> Result<RawOutcome, NixgateError> {
        if plan.risk_class().mutates() {
            let Some(snapshot) = snapshot else {
                return Err(NixgateError::SnapshotError {
                    command: plan.rendered_command().to_string(),
                    reason: format!("{} plan reached the executor without a snapshot", plan.risk_class().as_str()),
                });
            };
            tracing::debug!(plan = %plan.id(), snapshot = %snapshot.id(), "executing guarded plan");
        }
        tracing::info!(plan = %plan.id(), command = %plan.rendered_command(), timeout_secs = plan.timeout().as_secs(), "executing");
        Ok(self.runner.run(plan.command(), plan.timeout()))
    }
}
