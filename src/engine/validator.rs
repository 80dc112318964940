//! The single choke point from `Intent` to runnable command.
//!
//! `ExecutionPlan` has private fields and is only constructed here, so
//! every command that reaches the executor went through template lookup,
//! the argument allowlist and the confirmation gate.

use crate::core::config::TimeoutConfig;
use crate::core::error::NixgateError;
use crate::core::probe::{Dialect, DialectSource, ManagerBinding};
use crate::core::process::CommandLine;
use crate::core::time;
use crate::engine::intent::{Intent, IntentKind, Mode};
use crate::engine::registry::{ArgumentRule, CommandTemplate, Registry, RiskClass, SnapshotScope};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use std::time::Duration;

pub const MAX_PACKAGE_LEN: usize = 100;
pub const MAX_QUERY_LEN: usize = 200;

static PACKAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("static package regex"));
static QUERY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.+-]+$").expect("static query regex"));

/// The sealed unit of work.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    id: String,
    intent: Intent,
    command: CommandLine,
    rendered_command: String,
    risk_class: RiskClass,
    timeout_secs: u64,
    snapshot_scope: Option<SnapshotScope>,
    dialect: Dialect,
    dialect_source: DialectSource,
}

impl ExecutionPlan {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn intent(&self) -> &Intent {
        &self.intent
    }

    pub fn kind(&self) -> IntentKind {
        self.intent.kind
    }

    /// The mode requested when the plan was validated; dispatch honours it.
    pub fn mode(&self) -> Mode {
        self.intent.requested_mode
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    pub fn rendered_command(&self) -> &str {
        &self.rendered_command
    }

    pub fn risk_class(&self) -> RiskClass {
        self.risk_class
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn snapshot_scope(&self) -> Option<SnapshotScope> {
        self.snapshot_scope
    }

    /// CLI dialect the command was rendered for, and how it was chosen.
    pub fn dialect(&self) -> (Dialect, DialectSource) {
        (self.dialect, self.dialect_source)
    }
}

#[derive(Debug, Clone)]
pub struct Validator {
    registry: Registry,
    binding: ManagerBinding,
    timeouts: TimeoutConfig,
}

impl Validator {
    pub fn new(registry: Registry, binding: ManagerBinding, timeouts: TimeoutConfig) -> Self {
        Self {
            registry,
            binding,
            timeouts,
        }
    }

    pub fn binding(&self) -> &ManagerBinding {
        &self.binding
    }

    pub fn validate(&self, intent: &Intent) -> Result<ExecutionPlan, NixgateError> {
        let template = self.registry.resolve(intent.kind)?;
        let verb = intent.kind.verb();

        let argument = check_argument(template.argument, intent.argument.as_deref()).map_err(
            |reason| NixgateError::InvalidArgument {
                verb: verb.to_string(),
                command: self.preview(template),
                reason,
            },
        )?;

        let tokens = self.bind(template, argument.unwrap_or(""));
        let command = CommandLine::from_tokens(tokens).ok_or_else(|| {
            NixgateError::ConfigError(format!("template for '{}' rendered no program", verb))
        })?;
        let rendered_command = command.to_string();

        if template.requires_confirmation && intent.requested_mode == Mode::Execute && !intent.confirmed {
            return Err(NixgateError::DisallowedOperation {
                verb: verb.to_string(),
                command: rendered_command,
                reason: format!(
                    "'{}' is {}; pass --confirm together with --execute",
                    verb,
                    template.risk_class.as_str()
                ),
            });
        }

        Ok(ExecutionPlan {
            id: time::new_event_id(),
            intent: intent.clone(),
            command,
            rendered_command,
            risk_class: template.risk_class,
            timeout_secs: self.timeouts.for_kind(intent.kind).as_secs(),
            snapshot_scope: template.snapshot_scope,
            dialect: self.binding.dialect,
            dialect_source: self.binding.source,
        })
    }

    /// Template rendered with the argument slot left as `<package>`/`<query>`.
    pub fn preview(&self, template: &CommandTemplate) -> String {
        self.bind(template, template.argument.placeholder()).join(" ")
    }

    fn bind(&self, template: &CommandTemplate, argument: &str) -> Vec<String> {
        let b = &self.binding;
        let bindings: [(&str, &str); 6] = [
            ("{nix-env}", &b.nix_env),
            ("{nix}", &b.nix),
            ("{rebuild}", &b.rebuild),
            ("{gc}", &b.collect_garbage),
            ("{pkgset}", &b.package_set),
            ("{arg}", argument),
        ];
        template
            .pattern_for(b.dialect)
            .split_whitespace()
            .flat_map(|token| {
                if token == "{sudo}" {
                    return b.elevate.clone();
                }
                let mut bound = token.to_string();
                for (placeholder, value) in bindings {
                    bound = bound.replace(placeholder, value);
                }
                vec![bound]
            })
            .collect()
    }
}

/// Check the argument against its rule. Nothing is ever sanitised: a value
/// that does not match is rejected as-is.
fn check_argument(rule: ArgumentRule, argument: Option<&str>) -> Result<Option<&str>, String> {
    match (rule, argument) {
        (ArgumentRule::None, None) => Ok(None),
        (ArgumentRule::None, Some(arg)) => Err(format!("takes no argument, got '{}'", arg)),
        (ArgumentRule::Package, None) => Err("a package name is required".to_string()),
        (ArgumentRule::Query, None) => Err("a search query is required".to_string()),
        (ArgumentRule::Package, Some(arg)) => {
            if arg.len() > MAX_PACKAGE_LEN {
                return Err(format!("package name longer than {} characters", MAX_PACKAGE_LEN));
            }
            if !PACKAGE_RE.is_match(arg) {
                return Err(format!("package name '{}' must match [A-Za-z0-9_.-]+", arg.escape_debug()));
            }
            if arg.starts_with('.') || arg.starts_with('-') {
                return Err(format!("package name '{}' must not start with '.' or '-'", arg));
            }
            Ok(Some(arg))
        }
        (ArgumentRule::Query, Some(arg)) => {
            if arg.len() > MAX_QUERY_LEN {
                return Err(format!("search query longer than {} characters", MAX_QUERY_LEN));
            }
            if !QUERY_RE.is_match(arg) {
                return Err(format!("search query '{}' must match [A-Za-z0-9_.+-]+", arg.escape_debug()));
            }
            if arg.starts_with('-') {
                return Err(format!("search query '{}' must not start with '-'", arg));
            }
            Ok(Some(arg))
        }
    }
}
