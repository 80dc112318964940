//! Typed requests handed to the engine by an external resolver or the CLI.

use crate::core::error::NixgateError;
use serde::Serialize;
use std::str::FromStr;

/// The closed set of system-management operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Install,
    Remove,
    Search,
    List,
    Update,
    Rollback,
    GarbageCollect,
}

impl IntentKind {
    pub const ALL: [IntentKind; 7] = [
        IntentKind::Install,
        IntentKind::Remove,
        IntentKind::Search,
        IntentKind::List,
        IntentKind::Update,
        IntentKind::Rollback,
        IntentKind::GarbageCollect,
    ];

    /// CLI verb.
    pub fn verb(self) -> &'static str {
        match self {
            IntentKind::Install => "install",
            IntentKind::Remove => "remove",
            IntentKind::Search => "search",
            IntentKind::List => "list",
            IntentKind::Update => "update",
            IntentKind::Rollback => "rollback",
            IntentKind::GarbageCollect => "gc",
        }
    }
}

impl std::fmt::Display for IntentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.verb())
    }
}

impl FromStr for IntentKind {
    type Err = NixgateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IntentKind::ALL
            .into_iter()
            .find(|k| k.verb() == s)
            .ok_or_else(|| NixgateError::UnknownIntent {
                verb: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    #[default]
    DryRun,
    Execute,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::DryRun => "dry_run",
            Mode::Execute => "execute",
        }
    }
}

/// One resolved request. Built once per invocation, consumed by validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Intent {
    pub kind: IntentKind,
    pub argument: Option<String>,
    pub requested_mode: Mode,
    /// Explicit operator confirmation (`--confirm`) for destructive verbs.
    pub confirmed: bool,
}

impl Intent {
    /// A dry-run intent with no argument.
    pub fn new(kind: IntentKind) -> Self {
        Self {
            kind,
            argument: None,
            requested_mode: Mode::DryRun,
            confirmed: false,
        }
    }

    pub fn with_argument(mut self, argument: impl Into<String>) -> Self {
        self.argument = Some(argument.into());
        self
    }

    pub fn execute(mut self) -> Self {
        self.requested_mode = Mode::Execute;
        self
    }

    pub fn confirm(mut self) -> Self {
        self.confirmed = true;
        self
    }
}
