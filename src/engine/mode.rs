//! Dry-run/execute policy and the guarded execution sequence.
//!
//! Dry-run is the default and never spawns anything. Execute runs
//! read-only plans directly; mutating and destructive plans run under the
//! mutation lock as snapshot → execute → (on failure) one rollback.

use crate::core::error::{ErrorKind, NixgateError, exit};
use crate::core::journal::{ExecutionEvent, Journal};
use crate::core::lock::MutationLock;
use crate::core::probe::DialectSource;
use crate::core::process::RawOutcome;
use crate::core::time;
use crate::engine::executor::StagedExecutor;
use crate::engine::intent::Mode;
use crate::engine::registry::{RiskClass, SnapshotScope};
use crate::engine::rollback::{RollbackCoordinator, RollbackFailure, RollbackOutcome};
use crate::engine::snapshot::{Snapshot, SnapshotManager};
use crate::engine::validator::ExecutionPlan;
use serde::Serialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Failed,
    RolledBack,
    RollbackFailed,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Success => "success",
            Status::Failed => "failed",
            Status::RolledBack => "rolled_back",
            Status::RollbackFailed => "rollback_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RollbackReport {
    Restored(RollbackOutcome),
    Failed(RollbackFailure),
}

/// Terminal value for one intent.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub plan: ExecutionPlan,
    pub mode: Mode,
    pub status: Status,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub error: Option<ErrorKind>,
    pub snapshot: Option<Snapshot>,
    pub rollback: Option<RollbackReport>,
    pub started_at_us: Option<u64>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn exit_code(&self) -> i32 {
        match self.status {
            Status::Success => exit::SUCCESS,
            Status::Failed => exit::EXECUTION_FAILED,
            Status::RolledBack => exit::ROLLED_BACK,
            Status::RollbackFailed => exit::ROLLBACK_FAILED,
        }
    }

    fn from_outcome(plan: ExecutionPlan, outcome: RawOutcome, started_at_us: u64) -> Self {
        let (status, error) = if outcome.success() {
            (Status::Success, None)
        } else if outcome.timed_out {
            (Status::Failed, Some(ErrorKind::ExecutionTimeout))
        } else {
            (Status::Failed, Some(ErrorKind::ExecutionFailed))
        };
        Self {
            plan,
            mode: Mode::Execute,
            status,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
            exit_code: outcome.exit_code,
            timed_out: outcome.timed_out,
            error,
            snapshot: None,
            rollback: None,
            started_at_us: Some(started_at_us),
            duration_ms: outcome.duration_ms,
        }
    }
}

/// Human-readable dry-run report for a plan.
pub fn render_dry_run(plan: &ExecutionPlan) -> String {
    let mut out = format!("[dry-run] would run: {}\n", plan.rendered_command());
    match plan.risk_class() {
        RiskClass::ReadOnly => out.push_str("risk: read_only (no snapshot needed)\n"),
        RiskClass::Mutating => out.push_str(
            "risk: mutating (a snapshot is captured first and restored if the command fails)\n",
        ),
        RiskClass::Destructive => out.push_str(
            "risk: destructive (a snapshot is captured first; --confirm is required)\n",
        ),
    }
    match plan.dialect() {
        (dialect, DialectSource::Assumed) => out.push_str(&format!(
            "dialect: {} (assumed; run 'nixgate probe' to detect)\n",
            dialect.as_str()
        )),
        (dialect, source) => {
            out.push_str(&format!("dialect: {} ({})\n", dialect.as_str(), source.as_str()))
        }
    }
    let flags = if plan.risk_class() == RiskClass::Destructive {
        "--execute --confirm"
    } else {
        "--execute"
    };
    out.push_str(&format!("re-run with {} to apply", flags));
    out
}

#[derive(Debug, Clone)]
pub struct ModeController {
    state_dir: PathBuf,
    system_lock: PathBuf,
    executor: StagedExecutor,
    snapshots: SnapshotManager,
    rollback: RollbackCoordinator,
    journal: Journal,
}

impl ModeController {
    pub fn new(
        state_dir: &Path,
        system_lock: &Path,
        executor: StagedExecutor,
        snapshots: SnapshotManager,
        rollback: RollbackCoordinator,
        journal: Journal,
    ) -> Self {
        Self {
            state_dir: state_dir.to_path_buf(),
            system_lock: system_lock.to_path_buf(),
            executor,
            snapshots,
            rollback,
            journal,
        }
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        &self.snapshots
    }

    /// The system profile is shared by every user, so its lock lives
    /// outside any one state directory.
    pub fn lock_path(&self, plan: &ExecutionPlan) -> PathBuf {
        match plan.snapshot_scope() {
            Some(SnapshotScope::System) => self.system_lock.clone(),
            _ => MutationLock::lock_path(&self.state_dir),
        }
    }

    /// Dispatch on the mode sealed into the plan at validation.
    pub fn dispatch(&self, plan: ExecutionPlan) -> Result<ExecutionResult, NixgateError> {
        match plan.mode() {
            Mode::DryRun => Ok(self.dry_run(plan)),
            Mode::Execute if plan.risk_class().mutates() => self.execute_guarded(plan),
            Mode::Execute => self.execute_read_only(plan),
        }
    }

    fn dry_run(&self, plan: ExecutionPlan) -> ExecutionResult {
        self.journal.record(self.event("dispatch.dry_run", &plan, "reported"));
        ExecutionResult {
            stdout: render_dry_run(&plan),
            plan,
            mode: Mode::DryRun,
            status: Status::Success,
            stderr: String::new(),
            exit_code: None,
            timed_out: false,
            error: None,
            snapshot: None,
            rollback: None,
            started_at_us: None,
            duration_ms: 0,
        }
    }

    fn execute_read_only(&self, plan: ExecutionPlan) -> Result<ExecutionResult, NixgateError> {
        let started = time::now_epoch_us();
        let outcome = self.executor.run(&plan, None)?;
        self.record_exec(&plan, &outcome, None);
        Ok(ExecutionResult::from_outcome(plan, outcome, started))
    }

    fn execute_guarded(&self, plan: ExecutionPlan) -> Result<ExecutionResult, NixgateError> {
        let _lease = MutationLock::try_acquire_at(&self.lock_path(&plan))
            .map_err(|e| e.into_error(plan.rendered_command()))?;

        let snapshot = match self.snapshots.capture(&plan) {
            Ok(s) => s,
            Err(e) => {
                self.journal
                    .record(self.event("snapshot.failed", &plan, "aborted").detail(&e.to_string()));
                return Err(e);
            }
        };
        self.journal
            .record(self.event("snapshot.captured", &plan, "captured").snapshot(snapshot.id()));

        let started = time::now_epoch_us();
        let outcome = self.executor.run(&plan, Some(&snapshot))?;
        self.record_exec(&plan, &outcome, Some(&snapshot));

        if outcome.success() {
            self.snapshots.discard(&snapshot);
            let mut result = ExecutionResult::from_outcome(plan, outcome, started);
            result.snapshot = Some(snapshot);
            return Ok(result);
        }

        let mut result = ExecutionResult::from_outcome(plan, outcome, started);
        match self.rollback.rollback(&snapshot) {
            Ok(restored) => {
                self.snapshots.mark_restored(&snapshot);
                self.journal.record(
                    self.event("rollback.finished", &result.plan, "restored")
                        .snapshot(snapshot.id()),
                );
                result.status = Status::RolledBack;
                result.rollback = Some(RollbackReport::Restored(restored));
            }
            Err(failure) => {
                self.snapshots.mark_rollback_failed(&snapshot);
                tracing::error!(snapshot = %snapshot.id(), step = %failure.failed_step, "rollback failed; manual intervention required");
                self.journal.record(
                    self.event("rollback.finished", &result.plan, "rollback_failed")
                        .snapshot(snapshot.id())
                        .exit_code(failure.exit_code)
                        .detail(&failure.stderr),
                );
                result.status = Status::RollbackFailed;
                result.error = Some(ErrorKind::RollbackFailed);
                result.rollback = Some(RollbackReport::Failed(failure));
            }
        }
        result.snapshot = Some(snapshot);
        Ok(result)
    }

    fn event(&self, op: &str, plan: &ExecutionPlan, status: &str) -> ExecutionEvent {
        ExecutionEvent::new(
            op,
            plan.kind().verb(),
            plan.mode().as_str(),
            plan.rendered_command(),
            status,
        )
        .plan(plan.id())
    }

    fn record_exec(&self, plan: &ExecutionPlan, outcome: &RawOutcome, snapshot: Option<&Snapshot>) {
        let status = if outcome.success() {
            "success"
        } else if outcome.timed_out {
            "timed_out"
        } else {
            "failed"
        };
        let mut event = self
            .event("exec.finished", plan, status)
            .exit_code(outcome.exit_code);
        if let Some(s) = snapshot {
            event = event.snapshot(s.id());
        }
        if !outcome.success() {
            event = event.detail(&outcome.stderr);
        }
        self.journal.record(event);
    }
}
