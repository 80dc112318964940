//! Restores a snapshot after a guarded command failed.

use crate::core::process::ProcessRunner;
use crate::engine::snapshot::Snapshot;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackOutcome {
    pub snapshot_id: String,
    pub restore_command: String,
    pub stdout: String,
    pub stderr: String,
}

/// The system may now be inconsistent; an operator has to step in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RollbackFailure {
    pub snapshot_id: String,
    pub restore_command: String,
    pub failed_step: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stderr: String,
}

#[derive(Debug, Clone)]
pub struct RollbackCoordinator {
    runner: ProcessRunner,
    timeout: Duration,
}

impl RollbackCoordinator {
    pub fn new(runner: ProcessRunner, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Run the restore steps in order, stopping at the first failure.
    /// Called at most once per failed plan.
    pub(crate) fn rollback(&self, snapshot: &Snapshot) -> Result<RollbackOutcome, RollbackFailure> {
        let mut stdout = String::new();
        let mut stderr = String::new();
        for step in snapshot.restore_steps() {
            tracing::warn!(snapshot = %snapshot.id(), step = %step, "rolling back");
            let outcome = self.runner.run(step, self.timeout);
            stdout.push_str(&outcome.stdout);
            stderr.push_str(&outcome.stderr);
            if !outcome.success() {
                return Err(RollbackFailure {
                    snapshot_id: snapshot.id().to_string(),
                    restore_command: snapshot.restore_command().to_string(),
                    failed_step: step.to_string(),
                    exit_code: outcome.exit_code,
                    timed_out: outcome.timed_out,
                    stderr,
                });
            }
        }
        Ok(RollbackOutcome {
            snapshot_id: snapshot.id().to_string(),
            restore_command: snapshot.restore_command().to_string(),
            stdout,
            stderr,
        })
    }
}
