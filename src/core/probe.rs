//! One-time host probe producing the manager binding every template uses.
//!
//! The result is cached in the state directory so later invocations, and
//! dry-runs in particular, can bind templates without spawning anything.

use crate::core::config::{Config, DialectSetting, ManagerConfig};
use crate::core::error::NixgateError;
use crate::core::process::{CommandLine, ProcessRunner};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub const PROBE_CACHE: &str = "probe.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// `nix profile ...` (nix-command).
    Modern,
    /// `nix-env ...`.
    Legacy,
}

impl Dialect {
    pub fn as_str(self) -> &'static str {
        match self {
            Dialect::Modern => "modern",
            Dialect::Legacy => "legacy",
        }
    }
}

/// Where the binding's dialect came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialectSource {
    Configured,
    Probed,
    Cached,
    Assumed,
}

impl DialectSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DialectSource::Configured => "configured",
            DialectSource::Probed => "probed",
            DialectSource::Cached => "cached",
            DialectSource::Assumed => "assumed",
        }
    }
}

/// Immutable binding of template placeholders to host binaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerBinding {
    pub dialect: Dialect,
    pub source: DialectSource,
    pub nix: String,
    pub nix_env: String,
    pub rebuild: String,
    pub collect_garbage: String,
    /// Elevation wrapper argv; empty when running unelevated.
    pub elevate: Vec<String>,
    pub package_set: String,
    pub user_profile: Option<PathBuf>,
    pub system_profile: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProbeCache {
    ts: String,
    dialect: Dialect,
    nix: String,
    nix_env: String,
}

static TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_./+-]+$").expect("static token regex"));
static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("static name regex"));

fn check_token(field: &str, value: &str) -> Result<(), NixgateError> {
    if value.starts_with('-') || !TOKEN_RE.is_match(value) {
        return Err(NixgateError::ConfigError(format!(
            "manager.{} = '{}' is not a plain binary name or path",
            field, value
        )));
    }
    Ok(())
}

fn check_path(field: &str, value: &Path) -> Result<(), NixgateError> {
    check_token(field, &value.to_string_lossy())
}

impl ManagerBinding {
    /// Bind with a known dialect. Every config value that becomes an argv
    /// token is checked here, once.
    pub fn from_config(
        cfg: &ManagerConfig,
        dialect: Dialect,
        source: DialectSource,
    ) -> Result<Self, NixgateError> {
        check_token("nix", &cfg.nix)?;
        check_token("nix_env", &cfg.nix_env)?;
        check_token("rebuild", &cfg.rebuild)?;
        check_token("collect_garbage", &cfg.collect_garbage)?;
        if let Some((program, args)) = cfg.elevate.split_first() {
            check_token("elevate", program)?;
            for arg in args {
                if !TOKEN_RE.is_match(arg) {
                    return Err(NixgateError::ConfigError(format!(
                        "manager.elevate argument '{}' is not a plain token",
                        arg
                    )));
                }
            }
        }
        if !NAME_RE.is_match(&cfg.package_set) || cfg.package_set.starts_with('-') {
            return Err(NixgateError::ConfigError(format!(
                "manager.package_set = '{}' is not a plain name",
                cfg.package_set
            )));
        }
        if let Some(p) = &cfg.user_profile {
            check_path("user_profile", p)?;
        }
        check_path("system_profile", &cfg.system_profile)?;

        Ok(Self {
            dialect,
            source,
            nix: cfg.nix.clone(),
            nix_env: cfg.nix_env.clone(),
            rebuild: cfg.rebuild.clone(),
            collect_garbage: cfg.collect_garbage.clone(),
            elevate: cfg.elevate.clone(),
            package_set: cfg.package_set.clone(),
            user_profile: cfg.user_profile.clone(),
            system_profile: cfg.system_profile.clone(),
        })
    }

    /// Run the feature probe against the host.
    pub fn probe(config: &Config) -> Result<Self, NixgateError> {
        let cfg = &config.manager;
        // Validate before spawning anything named by the config.
        Self::from_config(cfg, Dialect::Modern, DialectSource::Probed)?;
        let runner = ProcessRunner::new(&cfg.path, 4096);
        let timeout = config.timeouts.probe();

        let modern = CommandLine::new(&cfg.nix, vec!["profile".into(), "list".into()]);
        if runner.run(&modern, timeout).success() {
            tracing::info!(dialect = "modern", "nix profile available");
            return Self::from_config(cfg, Dialect::Modern, DialectSource::Probed);
        }
        let legacy = CommandLine::new(&cfg.nix_env, vec!["--version".into()]);
        if runner.run(&legacy, timeout).success() {
            tracing::info!(dialect = "legacy", "falling back to nix-env");
            return Self::from_config(cfg, Dialect::Legacy, DialectSource::Probed);
        }
        Err(NixgateError::ProbeError(format!(
            "neither '{} profile list' nor '{} --version' succeeded; is Nix installed and on manager.path?",
            cfg.nix, cfg.nix_env
        )))
    }

    /// Resolve the binding for one invocation.
    ///
    /// A configured dialect is used as-is. For `auto`, a matching cache
    /// entry wins; otherwise `allow_probe` decides between probing (and
    /// caching) and assuming the modern dialect without spawning.
    pub fn resolve(
        config: &Config,
        state_dir: &Path,
        allow_probe: bool,
    ) -> Result<Self, NixgateError> {
        let cfg = &config.manager;
        match cfg.dialect {
            DialectSetting::Modern => {
                return Self::from_config(cfg, Dialect::Modern, DialectSource::Configured);
            }
            DialectSetting::Legacy => {
                return Self::from_config(cfg, Dialect::Legacy, DialectSource::Configured);
            }
            DialectSetting::Auto => {}
        }
        if let Some(cache) = read_cache(state_dir) {
            if cache.nix == cfg.nix && cache.nix_env == cfg.nix_env {
                return Self::from_config(cfg, cache.dialect, DialectSource::Cached);
            }
        }
        if !allow_probe {
            return Self::from_config(cfg, Dialect::Modern, DialectSource::Assumed);
        }
        let binding = Self::probe(config)?;
        binding.write_cache(state_dir)?;
        Ok(binding)
    }

    pub fn write_cache(&self, state_dir: &Path) -> Result<(), NixgateError> {
        std::fs::create_dir_all(state_dir)?;
        let cache = ProbeCache {
            ts: crate::core::time::now_epoch_z(),
            dialect: self.dialect,
            nix: self.nix.clone(),
            nix_env: self.nix_env.clone(),
        };
        std::fs::write(
            state_dir.join(PROBE_CACHE),
            serde_json::to_string_pretty(&cache)?,
        )?;
        Ok(())
    }
}

fn read_cache(state_dir: &Path) -> Option<ProbeCache> {
    let content = std::fs::read_to_string(state_dir.join(PROBE_CACHE)).ok()?;
    serde_json::from_str(&content).ok()
}
