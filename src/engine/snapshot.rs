//! Restore points captured before any mutating command runs.
//!
//! A snapshot pins the generation that is current right now, in the
//! profile the plan is about to change, and records the commands that
//! switch back to it. Generations are never deleted here; pruning belongs
//! to the system manager. The snapshot ledger tracks each restore point
//! from capture until it is discarded, restored or abandoned.

use crate::core::error::NixgateError;
use crate::core::journal::{Journal, SnapshotEvent};
use crate::core::probe::{Dialect, ManagerBinding};
use crate::core::process::{CommandLine, ProcessRunner};
use crate::core::time;
use crate::engine::registry::SnapshotScope;
use crate::engine::validator::ExecutionPlan;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

pub mod status {
    pub const CAPTURED: &str = "captured";
    pub const DISCARDED: &str = "discarded";
    pub const RESTORED: &str = "restored";
    pub const ROLLBACK_FAILED: &str = "rollback_failed";
    pub const ABANDONED: &str = "abandoned";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    id: String,
    created_at_us: u64,
    scope: SnapshotScope,
    generation: u64,
    restore_steps: Vec<CommandLine>,
    restore_command: String,
}

impl Snapshot {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at_us(&self) -> u64 {
        self.created_at_us
    }

    pub fn scope(&self) -> SnapshotScope {
        self.scope
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn restore_steps(&self) -> &[CommandLine] {
        &self.restore_steps
    }

    /// Human-readable restore, steps joined with `&&`.
    pub fn restore_command(&self) -> &str {
        &self.restore_command
    }
}

/// Latest ledger state of one snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRecord {
    pub snapshot_id: String,
    pub status: String,
    pub scope: String,
    pub generation: u64,
    pub created_at_us: u64,
    pub restore_command: String,
    pub last_ts: String,
}

#[derive(Debug, Clone)]
pub struct SnapshotManager {
    runner: ProcessRunner,
    binding: ManagerBinding,
    journal: Journal,
    timeout: Duration,
}

impl SnapshotManager {
    pub fn new(
        runner: ProcessRunner,
        binding: ManagerBinding,
        journal: Journal,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            binding,
            journal,
            timeout,
        }
    }

    /// Pin the current generation for `plan`'s scope. Any failure here is
    /// a `SnapshotError` and the plan must not run.
    pub fn capture(&self, plan: &ExecutionPlan) -> Result<Snapshot, NixgateError> {
        let fail = |reason: String| NixgateError::SnapshotError {
            command: plan.rendered_command().to_string(),
            reason,
        };
        let scope = plan
            .snapshot_scope()
            .ok_or_else(|| fail(format!("'{}' has no snapshot scope", plan.kind())))?;

        let list = self.list_generations_command(scope);
        let outcome = self.runner.run(&list, self.timeout);
        if !outcome.success() {
            return Err(fail(format!(
                "'{}' failed (exit {:?}{}): {}",
                list,
                outcome.exit_code,
                if outcome.timed_out { ", timed out" } else { "" },
                outcome.stderr.trim()
            )));
        }
        let generation = parse_current_generation(&outcome.stdout)
            .ok_or_else(|| fail(format!("'{}' reported no current generation", list)))?;

        let restore_steps = self.restore_steps(scope, generation);
        let restore_command = restore_steps
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(" && ");
        let snapshot = Snapshot {
            id: time::new_event_id(),
            created_at_us: time::now_epoch_us(),
            scope,
            generation,
            restore_steps,
            restore_command,
        };
        self.journal
            .append_snapshot(&self.event(&snapshot, status::CAPTURED))
            .map_err(|e| fail(format!("cannot record snapshot durably: {}", e)))?;
        tracing::info!(snapshot = %snapshot.id, generation, scope = scope.as_str(), "snapshot captured");
        Ok(snapshot)
    }

    /// The guarded operation succeeded; the restore point is no longer needed.
    pub fn discard(&self, snapshot: &Snapshot) {
        self.mark(snapshot, status::DISCARDED);
    }

    pub fn mark_restored(&self, snapshot: &Snapshot) {
        self.mark(snapshot, status::RESTORED);
    }

    pub fn mark_rollback_failed(&self, snapshot: &Snapshot) {
        self.mark(snapshot, status::ROLLBACK_FAILED);
    }

    /// Snapshots still awaiting a restore or an explicit abandon.
    pub fn retained(&self) -> Result<Vec<SnapshotRecord>, NixgateError> {
        retained_in(&self.journal)
    }

    /// Operator gives up on a retained snapshot.
    pub fn abandon(&self, snapshot_id: &str) -> Result<SnapshotRecord, NixgateError> {
        abandon_in(&self.journal, snapshot_id)
    }

    fn mark(&self, snapshot: &Snapshot, state: &str) {
        if let Err(e) = self.journal.append_snapshot(&self.event(snapshot, state)) {
            tracing::warn!(snapshot = %snapshot.id, state, error = %e, "failed to record snapshot state");
        }
    }

    fn event(&self, snapshot: &Snapshot, state: &str) -> SnapshotEvent {
        SnapshotEvent {
            ts: time::now_epoch_z(),
            event_id: time::new_event_id(),
            snapshot_id: snapshot.id.clone(),
            status: state.to_string(),
            scope: snapshot.scope.as_str().to_string(),
            generation: snapshot.generation,
            created_at_us: snapshot.created_at_us,
            restore_command: snapshot.restore_command.clone(),
        }
    }

    fn profile_args(&self, scope: SnapshotScope) -> Vec<String> {
        let profile = match scope {
            SnapshotScope::UserProfile => self.binding.user_profile.as_deref(),
            SnapshotScope::System => Some(self.binding.system_profile.as_path()),
        };
        profile
            .map(|p| vec!["--profile".to_string(), p.to_string_lossy().into_owned()])
            .unwrap_or_default()
    }

    fn list_generations_command(&self, scope: SnapshotScope) -> CommandLine {
        let mut args = self.profile_args(scope);
        args.push("--list-generations".to_string());
        CommandLine::new(&self.binding.nix_env, args)
    }

    fn elevated(&self, program: &str, args: Vec<String>) -> CommandLine {
        match self.binding.elevate.split_first() {
            Some((wrapper, wrapper_args)) => {
                let mut full = wrapper_args.to_vec();
                full.push(program.to_string());
                full.extend(args);
                CommandLine::new(wrapper, full)
            }
            None => CommandLine::new(program, args),
        }
    }

    fn restore_steps(&self, scope: SnapshotScope, generation: u64) -> Vec<CommandLine> {
        let b = &self.binding;
        match scope {
            SnapshotScope::UserProfile => {
                let mut args = self.profile_args(scope);
                match b.dialect {
                    Dialect::Modern => {
                        let mut modern =
                            vec!["profile".into(), "rollback".into(), "--to".into(), generation.to_string()];
                        modern.extend(args);
                        vec![CommandLine::new(&b.nix, modern)]
                    }
                    Dialect::Legacy => {
                        args.push("--switch-generation".into());
                        args.push(generation.to_string());
                        vec![CommandLine::new(&b.nix_env, args)]
                    }
                }
            }
            SnapshotScope::System => {
                let mut switch = self.profile_args(scope);
                switch.push("--switch-generation".into());
                switch.push(generation.to_string());
                let activate = Path::new(&b.system_profile)
                    .join("bin")
                    .join("switch-to-configuration");
                vec![
                    self.elevated(&b.nix_env, switch),
                    self.elevated(&activate.to_string_lossy(), vec!["switch".into()]),
                ]
            }
        }
    }
}

pub(crate) fn retained_in(journal: &Journal) -> Result<Vec<SnapshotRecord>, NixgateError> {
    let mut latest: BTreeMap<String, SnapshotRecord> = BTreeMap::new();
    for ev in journal.read_snapshots()? {
        latest.insert(
            ev.snapshot_id.clone(),
            SnapshotRecord {
                snapshot_id: ev.snapshot_id,
                status: ev.status,
                scope: ev.scope,
                generation: ev.generation,
                created_at_us: ev.created_at_us,
                restore_command: ev.restore_command,
                last_ts: ev.ts,
            },
        );
    }
    let mut retained: Vec<SnapshotRecord> = latest
        .into_values()
        .filter(|r| r.status == status::CAPTURED || r.status == status::ROLLBACK_FAILED)
        .collect();
    retained.sort_by_key(|r| r.created_at_us);
    Ok(retained)
}

pub(crate) fn abandon_in(journal: &Journal, snapshot_id: &str) -> Result<SnapshotRecord, NixgateError> {
    let record = retained_in(journal)?
        .into_iter()
        .find(|r| r.snapshot_id == snapshot_id)
        .ok_or_else(|| NixgateError::NotFound(format!("no retained snapshot '{}'", snapshot_id)))?;
    journal.append_snapshot(&SnapshotEvent {
        ts: time::now_epoch_z(),
        event_id: time::new_event_id(),
        snapshot_id: record.snapshot_id.clone(),
        status: status::ABANDONED.to_string(),
        scope: record.scope.clone(),
        generation: record.generation,
        created_at_us: record.created_at_us,
        restore_command: record.restore_command.clone(),
    })?;
    Ok(SnapshotRecord {
        status: status::ABANDONED.to_string(),
        ..record
    })
}

/// Parse `nix-env --list-generations` output for the `(current)` row.
pub fn parse_current_generation(listing: &str) -> Option<u64> {
    listing
        .lines()
        .find(|line| line.contains("(current)"))
        .and_then(|line| line.split_whitespace().next())
        .and_then(|n| n.parse().ok())
}
