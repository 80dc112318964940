//! Configuration for nixgate.
//!
//! Loaded once at startup from `<state-dir>/config.toml` (or `--config`).
//! Every field has a default, so a missing file is the common case. The
//! command templates are not configurable; this file only binds the
//! binaries those templates name and bounds how long they may run.

use crate::core::error::NixgateError;
use crate::engine::intent::IntentKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE: &str = "config.toml";
pub const HOME_ENV: &str = "NIXGATE_HOME";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DialectSetting {
    #[default]
    Auto,
    Modern,
    Legacy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub manager: ManagerConfig,
    pub timeouts: TimeoutConfig,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub dialect: DialectSetting,
    pub nix: String,
    pub nix_env: String,
    pub rebuild: String,
    pub collect_garbage: String,
    /// Elevation wrapper argv, e.g. `["sudo", "-n"]`; empty disables it.
    /// Children have no terminal, so the wrapper must never prompt.
    pub elevate: Vec<String>,
    pub package_set: String,
    pub user_profile: Option<PathBuf>,
    pub system_profile: PathBuf,
    /// `PATH` handed to child processes.
    pub path: String,
    /// Lock shared by every user that mutates the system profile.
    pub system_lock: PathBuf,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            dialect: DialectSetting::Auto,
            nix: "nix".to_string(),
            nix_env: "nix-env".to_string(),
            rebuild: "nixos-rebuild".to_string(),
            collect_garbage: "nix-collect-garbage".to_string(),
            elevate: vec!["sudo".to_string(), "-n".to_string()],
            package_set: "nixpkgs".to_string(),
            user_profile: None,
            system_profile: PathBuf::from("/nix/var/nix/profiles/system"),
            path: [
                "/run/wrappers/bin",
                "/run/current-system/sw/bin",
                "/nix/var/nix/profiles/default/bin",
                "/usr/bin",
                "/bin",
            ]
            .join(":"),
            system_lock: PathBuf::from("/run/lock/nixgate-system.lock"),
        }
    }
}

/// Per-verb subprocess budgets, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub search: u64,
    pub list: u64,
    pub install: u64,
    pub remove: u64,
    pub update: u64,
    pub rollback: u64,
    pub gc: u64,
    pub probe: u64,
    pub snapshot: u64,
    pub restore: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            search: 30,
            list: 30,
            install: 600,
            remove: 300,
            update: 3600,
            rollback: 600,
            gc: 1800,
            probe: 5,
            snapshot: 30,
            restore: 600,
        }
    }
}

impl TimeoutConfig {
    pub fn for_kind(&self, kind: IntentKind) -> Duration {
        let secs = match kind {
            IntentKind::Search => self.search,
            IntentKind::List => self.list,
            IntentKind::Install => self.install,
            IntentKind::Remove => self.remove,
            IntentKind::Update => self.update,
            IntentKind::Rollback => self.rollback,
            IntentKind::GarbageCollect => self.gc,
        };
        Duration::from_secs(secs.max(1))
    }

    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe.max(1))
    }

    pub fn snapshot(&self) -> Duration {
        Duration::from_secs(self.snapshot.max(1))
    }

    pub fn restore(&self) -> Duration {
        Duration::from_secs(self.restore.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Upper bound on each captured stream.
    pub max_bytes: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_bytes: 64 * 1024,
        }
    }
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Self, NixgateError> {
        toml::from_str(content).map_err(|e| NixgateError::ConfigError(e.to_string()))
    }

    /// Load `path` if given, else `<state_dir>/config.toml` if present,
    /// else defaults. An explicitly named file must exist.
    pub fn load(state_dir: &Path, path: Option<&Path>) -> Result<Self, NixgateError> {
        let candidate = match path {
            Some(p) => {
                if !p.exists() {
                    return Err(NixgateError::ConfigError(format!(
                        "config file {} does not exist",
                        p.display()
                    )));
                }
                p.to_path_buf()
            }
            None => state_dir.join(CONFIG_FILE),
        };
        if !candidate.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(&candidate)?;
        Self::from_toml_str(&content).map_err(|e| match e {
            NixgateError::ConfigError(msg) => {
                NixgateError::ConfigError(format!("{}: {}", candidate.display(), msg))
            }
            other => other,
        })
    }
}

/// `--state-dir`, else `$NIXGATE_HOME`, else `~/.nixgate`.
pub fn resolve_state_dir(explicit: Option<&Path>) -> Result<PathBuf, NixgateError> {
    if let Some(dir) = explicit {
        return Ok(dir.to_path_buf());
    }
    if let Ok(dir) = std::env::var(HOME_ENV) {
        if !dir.trim().is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let home = std::env::var("HOME").map_err(|_| {
        NixgateError::ConfigError(format!(
            "cannot resolve state directory: neither --state-dir, {} nor HOME is set",
            HOME_ENV
        ))
    })?;
    Ok(PathBuf::from(home).join(".nixgate"))
}
