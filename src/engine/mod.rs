//! The guarded path from intent to host command.
//!
//! `Engine::handle` is the only entry point: the validator seals an
//! [`validator::ExecutionPlan`], the mode controller dispatches it, and
//! every stage leaves a line in the execution journal.

pub mod executor;
pub mod intent;
pub mod mode;
pub mod registry;
pub mod rollback;
pub mod snapshot;
pub mod validator;

use crate::core::config::Config;
use crate::core::error::NixgateError;
use crate::core::journal::{ExecutionEvent, Journal};
use crate::core::probe::ManagerBinding;
use crate::core::process::ProcessRunner;
use executor::StagedExecutor;
use intent::Intent;
use mode::{ExecutionResult, ModeController};
use registry::Registry;
use rollback::RollbackCoordinator;
use snapshot::SnapshotManager;
use std::path::Path;
use validator::{ExecutionPlan, Validator};

#[derive(Debug, Clone)]
pub struct Engine {
    validator: Validator,
    controller: ModeController,
    journal: Journal,
}

impl Engine {
    pub fn new(config: &Config, binding: ManagerBinding, state_dir: &Path) -> Self {
        Self::with_registry(config, binding, state_dir, Registry::builtin())
    }

    pub fn with_registry(
        config: &Config,
        binding: ManagerBinding,
        state_dir: &Path,
        registry: Registry,
    ) -> Self {
        let runner = ProcessRunner::new(&config.manager.path, config.output.max_bytes);
        let journal = Journal::new(state_dir);
        let snapshots = SnapshotManager::new(
            runner.clone(),
            binding.clone(),
            journal.clone(),
            config.timeouts.snapshot(),
        );
        let controller = ModeController::new(
            state_dir,
            &config.manager.system_lock,
            StagedExecutor::new(runner.clone()),
            snapshots,
            RollbackCoordinator::new(runner, config.timeouts.restore()),
            journal.clone(),
        );
        Self {
            validator: Validator::new(registry, binding, config.timeouts.clone()),
            controller,
            journal,
        }
    }

    pub fn validator(&self) -> &Validator {
        &self.validator
    }

    pub fn snapshots(&self) -> &SnapshotManager {
        self.controller.snapshots()
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Validate without dispatching.
    pub fn plan(&self, intent: &Intent) -> Result<ExecutionPlan, NixgateError> {
        match self.validator.validate(intent) {
            Ok(plan) => {
                self.journal.record(
                    ExecutionEvent::new(
                        "plan.validated",
                        plan.kind().verb(),
                        plan.mode().as_str(),
                        plan.rendered_command(),
                        plan.risk_class().as_str(),
                    )
                    .plan(plan.id()),
                );
                Ok(plan)
            }
            Err(err) => {
                let status = err.kind().map(|k| k.as_str()).unwrap_or("error");
                self.journal.record(
                    ExecutionEvent::new(
                        "plan.rejected",
                        intent.kind.verb(),
                        intent.requested_mode.as_str(),
                        err.command().unwrap_or(""),
                        status,
                    )
                    .detail(&err.to_string()),
                );
                Err(err)
            }
        }
    }

    /// Validate, then dispatch under the plan's mode.
    pub fn handle(&self, intent: &Intent) -> Result<ExecutionResult, NixgateError> {
        let plan = self.plan(intent)?;
        let plan_id = plan.id().to_string();
        let verb = plan.kind().verb();
        let mode = plan.mode().as_str();
        let command = plan.rendered_command().to_string();

        match self.controller.dispatch(plan) {
            Ok(result) => {
                let mut event = ExecutionEvent::new(
                    "result",
                    verb,
                    mode,
                    &command,
                    result.status.as_str(),
                )
                .plan(&plan_id)
                .exit_code(result.exit_code);
                if let Some(s) = &result.snapshot {
                    event = event.snapshot(s.id());
                }
                if let Some(kind) = result.error {
                    event = event.detail(kind.as_str());
                }
                self.journal.record(event);
                Ok(result)
            }
            Err(err) => {
                let status = err.kind().map(|k| k.as_str()).unwrap_or("error");
                self.journal.record(
                    ExecutionEvent::new("result", verb, mode, &command, status)
                        .plan(&plan_id)
                        .detail(&err.to_string()),
                );
                Err(err)
            }
        }
    }
}
