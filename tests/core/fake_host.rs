//! Scripted stand-ins for the Nix binaries.
//!
//! Each fake appends `<name> <args>` to a shared log before doing anything
//! else, so tests can assert exactly which subprocesses ran and in what
//! order. Children get a cleared environment, so every path is absolute.

#![allow(dead_code)]

use nixgate::core::config::{Config, DialectSetting};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const GENERATIONS: &str = "  41   2024-01-01 10:00:00   \n  42   2024-02-01 10:00:00   (current)\n";

pub struct FakeHost {
    _dir: TempDir,
    pub state: PathBuf,
    pub bin: PathBuf,
    pub system_profile: PathBuf,
    pub system_lock: PathBuf,
    pub log: PathBuf,
}

impl FakeHost {
    /// All fakes succeed; `nix-env --list-generations` reports generation 42.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let state = dir.path().join("state");
        let bin = dir.path().join("bin");
        fs::create_dir_all(&state).expect("state dir");
        fs::create_dir_all(&bin).expect("bin dir");
        let system_profile = dir.path().join("profiles").join("system");
        fs::create_dir_all(system_profile.join("bin")).expect("system profile");
        let host = Self {
            log: dir.path().join("invocations.log"),
            system_lock: dir.path().join("lock").join("nixgate-system.lock"),
            _dir: dir,
            state,
            bin,
            system_profile,
        };
        host.script("nix", "exit 0");
        host.script(
            "nix-env",
            &format!(
                "case \"$*\" in *--list-generations*) printf '{}' ;; esac\nexit 0",
                GENERATIONS.replace('\n', "\\n")
            ),
        );
        host.script("nixos-rebuild", "exit 0");
        host.script("nix-collect-garbage", "exit 0");
        host.script("sudo", "[ \"$1\" = \"-n\" ] && shift\nexec \"$@\"");
        host.activation("exit 0");
        host
    }

    /// Rewrite `<system profile>/bin/switch-to-configuration`.
    pub fn activation(&self, body: &str) -> PathBuf {
        let path = self.system_profile.join("bin").join("switch-to-configuration");
        let content = format!(
            "#!/bin/sh\necho \"switch-to-configuration $*\" >> '{}'\n{}\n",
            self.log.display(),
            body
        );
        fs::write(&path, content).expect("write activation");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod activation");
        path
    }

    /// (Re)write one fake. `body` runs after the invocation is logged.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.bin.join(name);
        let content = format!(
            "#!/bin/sh\necho \"{} $*\" >> '{}'\n{}\n",
            name,
            self.log.display(),
            body
        );
        fs::write(&path, content).expect("write fake");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod fake");
        path
    }

    pub fn remove(&self, name: &str) {
        fs::remove_file(self.bin.join(name)).expect("remove fake");
    }

    fn bin_path(&self, name: &str) -> String {
        self.bin.join(name).to_string_lossy().into_owned()
    }

    pub fn config(&self) -> Config {
        let mut config = Config::default();
        let m = &mut config.manager;
        m.dialect = DialectSetting::Modern;
        m.nix = self.bin_path("nix");
        m.nix_env = self.bin_path("nix-env");
        m.rebuild = self.bin_path("nixos-rebuild");
        m.collect_garbage = self.bin_path("nix-collect-garbage");
        m.elevate = vec![self.bin_path("sudo"), "-n".to_string()];
        m.system_profile = self.system_profile.clone();
        m.system_lock = self.system_lock.clone();
        m.path = "/usr/bin:/bin".to_string();
        config.timeouts.snapshot = 5;
        config.timeouts.restore = 5;
        config
    }

    /// The same binding as `config()`, as a file the CLI can load.
    pub fn write_config_toml(&self, extra: &str) -> PathBuf {
        let content = format!(
            "[manager]\ndialect = \"modern\"\nnix = \"{}\"\nnix_env = \"{}\"\nrebuild = \"{}\"\ncollect_garbage = \"{}\"\nelevate = [\"{}\", \"-n\"]\nsystem_profile = \"{}\"\nsystem_lock = \"{}\"\npath = \"/usr/bin:/bin\"\n\n[timeouts]\nsnapshot = 5\nrestore = 5\n{}",
            self.bin_path("nix"),
            self.bin_path("nix-env"),
            self.bin_path("nixos-rebuild"),
            self.bin_path("nix-collect-garbage"),
            self.bin_path("sudo"),
            self.system_profile.display(),
            self.system_lock.display(),
            extra
        );
        let path = self.state.join("config.toml");
        fs::write(&path, content).expect("write config");
        path
    }

    pub fn invocations(&self) -> Vec<String> {
        match fs::read_to_string(&self.log) {
            Ok(text) => text.lines().map(|l| l.to_string()).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state
    }
}
