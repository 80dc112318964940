//! The immutable command table.
//!
//! Each intent maps to exactly one template per dialect. Templates are
//! whitespace-separated argv tokens; `{name}` placeholders are bound by the
//! validator from the probed manager binding and the checked argument.
//! There is no path from an intent to a free-form shell string.

use crate::core::error::NixgateError;
use crate::core::probe::Dialect;
use crate::engine::intent::IntentKind;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    ReadOnly,
    Mutating,
    Destructive,
}

impl RiskClass {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskClass::ReadOnly => "read_only",
            RiskClass::Mutating => "mutating",
            RiskClass::Destructive => "destructive",
        }
    }

    /// Mutating and destructive plans need a snapshot and the lock.
    pub fn mutates(self) -> bool {
        self != RiskClass::ReadOnly
    }
}

/// What the `{arg}` placeholder accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentRule {
    None,
    Package,
    Query,
}

impl ArgumentRule {
    /// Placeholder shown when no argument could be bound.
    pub fn placeholder(self) -> &'static str {
        match self {
            ArgumentRule::None => "",
            ArgumentRule::Package => "<package>",
            ArgumentRule::Query => "<query>",
        }
    }
}

/// Which generation history a snapshot pins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotScope {
    UserProfile,
    System,
}

impl SnapshotScope {
    pub fn as_str(self) -> &'static str {
        match self {
            SnapshotScope::UserProfile => "user_profile",
            SnapshotScope::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandTemplate {
    pub kind: IntentKind,
    /// `nix profile`/flake-era dialect.
    pub pattern: &'static str,
    /// `nix-env` dialect.
    pub legacy_pattern: &'static str,
    pub risk_class: RiskClass,
    pub requires_confirmation: bool,
    pub argument: ArgumentRule,
    pub snapshot_scope: Option<SnapshotScope>,
}

impl CommandTemplate {
    pub fn pattern_for(&self, dialect: Dialect) -> &'static str {
        match dialect {
            Dialect::Modern => self.pattern,
            Dialect::Legacy => self.legacy_pattern,
        }
    }
}

static BUILTIN_TEMPLATES: [CommandTemplate; 7] = [
    CommandTemplate {
        kind: IntentKind::Install,
        pattern: "{nix} profile install {pkgset}#{arg}",
        legacy_pattern: "{nix-env} -iA {pkgset}.{arg}",
        risk_class: RiskClass::Mutating,
        requires_confirmation: false,
        argument: ArgumentRule::Package,
        snapshot_scope: Some(SnapshotScope::UserProfile),
    },
    CommandTemplate {
        kind: IntentKind::Remove,
        pattern: "{nix} profile remove {arg}",
        legacy_pattern: "{nix-env} -e {arg}",
        risk_class: RiskClass::Mutating,
        requires_confirmation: false,
        argument: ArgumentRule::Package,
        snapshot_scope: Some(SnapshotScope::UserProfile),
    },
    CommandTemplate {
        kind: IntentKind::Search,
        pattern: "{nix} search {pkgset} {arg}",
        legacy_pattern: "{nix-env} -qaP {arg}",
        risk_class: RiskClass::ReadOnly,
        requires_confirmation: false,
        argument: ArgumentRule::Query,
        snapshot_scope: None,
    },
    CommandTemplate {
        kind: IntentKind::List,
        pattern: "{nix} profile list",
        legacy_pattern: "{nix-env} -q",
        risk_class: RiskClass::ReadOnly,
        requires_confirmation: false,
        argument: ArgumentRule::None,
        snapshot_scope: None,
    },
    CommandTemplate {
        kind: IntentKind::Update,
        pattern: "{sudo} {rebuild} switch",
        legacy_pattern: "{sudo} {rebuild} switch",
        risk_class: RiskClass::Mutating,
        requires_confirmation: false,
        argument: ArgumentRule::None,
        snapshot_scope: Some(SnapshotScope::System),
    },
    CommandTemplate {
        kind: IntentKind::Rollback,
        pattern: "{sudo} {rebuild} switch --rollback",
        legacy_pattern: "{sudo} {rebuild} switch --rollback",
        risk_class: RiskClass::Destructive,
        requires_confirmation: true,
        argument: ArgumentRule::None,
        snapshot_scope: Some(SnapshotScope::System),
    },
    // Unelevated `-d` deletes the caller's old generations and leaves each
    // current one in place, so the restore point is the user's current
    // generation.
    CommandTemplate {
        kind: IntentKind::GarbageCollect,
        pattern: "{gc} -d",
        legacy_pattern: "{gc} -d",
        risk_class: RiskClass::Destructive,
        requires_confirmation: true,
        argument: ArgumentRule::None,
        snapshot_scope: Some(SnapshotScope::UserProfile),
    },
];

/// Lookup table from intent to template. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct Registry {
    templates: Vec<CommandTemplate>,
}

impl Registry {
    pub fn builtin() -> Self {
        Self {
            templates: BUILTIN_TEMPLATES.to_vec(),
        }
    }

    /// A registry over an explicit table. Rejects tables that break the
    /// risk invariants: every mutating entry pins a snapshot scope and every
    /// destructive entry requires confirmation.
    pub fn new(templates: Vec<CommandTemplate>) -> Result<Self, NixgateError> {
        for t in &templates {
            if t.risk_class.mutates() != t.snapshot_scope.is_some() {
                return Err(NixgateError::ConfigError(format!(
                    "template for '{}' has risk {} but snapshot scope {:?}",
                    t.kind,
                    t.risk_class.as_str(),
                    t.snapshot_scope
                )));
            }
            if t.risk_class == RiskClass::Destructive && !t.requires_confirmation {
                return Err(NixgateError::ConfigError(format!(
                    "destructive template for '{}' must require confirmation",
                    t.kind
                )));
            }
            if templates.iter().filter(|o| o.kind == t.kind).count() > 1 {
                return Err(NixgateError::ConfigError(format!(
                    "duplicate template for '{}'",
                    t.kind
                )));
            }
        }
        Ok(Self { templates })
    }

    pub fn resolve(&self, kind: IntentKind) -> Result<&CommandTemplate, NixgateError> {
        self.templates
            .iter()
            .find(|t| t.kind == kind)
            .ok_or_else(|| NixgateError::UnknownIntent {
                verb: kind.verb().to_string(),
            })
    }

    pub fn templates(&self) -> &[CommandTemplate] {
        &self.templates
    }
}
