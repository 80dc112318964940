mod fake_host;

use fake_host::FakeHost;
use nixgate::core::config::{Config, DialectSetting};
use nixgate::core::error::{ErrorKind, NixgateError, exit};
use nixgate::core::journal::Journal;
use nixgate::core::lock::MutationLock;
use nixgate::core::probe::{Dialect, DialectSource, ManagerBinding};
use nixgate::engine::Engine;
use nixgate::engine::intent::{Intent, IntentKind, Mode};
use nixgate::engine::mode::{RollbackReport, Status};
use nixgate::engine::snapshot::status;
use std::sync::Barrier;
use std::thread;
use std::time::{Duration, Instant};

fn engine(host: &FakeHost, config: &Config) -> Engine {
    let binding = ManagerBinding::resolve(config, host.state_dir(), true).expect("binding");
    Engine::new(config, binding, host.state_dir())
}

fn install(pkg: &str) -> Intent {
    Intent::new(IntentKind::Install).with_argument(pkg)
}

fn nix(host: &FakeHost) -> String {
    host.bin.join("nix").display().to_string()
}

#[test]
fn dry_run_install_reports_and_spawns_nothing() {
    let host = FakeHost::new();
    let config = host.config();
    let engine = engine(&host, &config);

    let result = engine.handle(&install("hello")).unwrap();

    assert_eq!(result.mode, Mode::DryRun);
    assert_eq!(result.status, Status::Success);
    assert_eq!(result.exit_code(), exit::SUCCESS);
    assert!(
        result
            .stdout
            .contains(&format!("would run: {} profile install nixpkgs#hello", nix(&host)))
    );
    assert!(host.invocations().is_empty());
    assert!(engine.snapshots().retained().unwrap().is_empty());
    assert!(!MutationLock::lock_path(host.state_dir()).exists());
}

#[test]
fn execute_install_snapshots_before_running() {
    let host = FakeHost::new();
    let config = host.config();
    let engine = engine(&host, &config);

    let result = engine.handle(&install("hello").execute()).unwrap();

    assert_eq!(result.status, Status::Success);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(
        host.invocations(),
        [
            "nix-env --list-generations",
            "nix profile install nixpkgs#hello"
        ]
    );
    let snapshot = result.snapshot.as_ref().expect("snapshot");
    assert_eq!(snapshot.generation(), 42);
    assert!(snapshot.created_at_us() <= result.started_at_us.expect("started"));
    // Discarded after success.
    assert!(engine.snapshots().retained().unwrap().is_empty());
    assert!(MutationLock::try_acquire(host.state_dir()).is_ok());

    let ops: Vec<String> = engine
        .journal()
        .read_executions()
        .unwrap()
        .into_iter()
        .map(|e| e.op)
        .collect();
    assert_eq!(
        ops,
        ["plan.validated", "snapshot.captured", "exec.finished", "result"]
    );
}

#[test]
fn failed_install_rolls_back_exactly_once() {
    let host = FakeHost::new();
    host.script(
        "nix",
        "case \"$*\" in \"profile install\"*) echo 'error: build failed' >&2; exit 1 ;; esac\nexit 0",
    );
    let config = host.config();
    let engine = engine(&host, &config);

    let result = engine.handle(&install("hello").execute()).unwrap();

    assert_eq!(result.status, Status::RolledBack);
    assert_eq!(result.exit_code(), exit::ROLLED_BACK);
    assert_eq!(result.error, Some(ErrorKind::ExecutionFailed));
    assert!(result.stderr.contains("build failed"));
    assert_eq!(
        host.invocations(),
        [
            "nix-env --list-generations",
            "nix profile install nixpkgs#hello",
            "nix profile rollback --to 42",
        ]
    );
    match result.rollback {
        Some(RollbackReport::Restored(ref outcome)) => {
            assert_eq!(
                outcome.restore_command,
                format!("{} profile rollback --to 42", nix(&host))
            );
        }
        ref other => panic!("expected a restore, got {:?}", other),
    }
    assert!(engine.snapshots().retained().unwrap().is_empty());
}

#[test]
fn shell_metacharacters_never_reach_the_host() {
    let host = FakeHost::new();
    let config = host.config();
    let engine = engine(&host, &config);

    let long = "a".repeat(101);
    for bad in [
        "hello; rm -rf /",
        "$(reboot)",
        "hello && sudo reboot",
        "`id`",
        "-e",
        ".hidden",
        "pkg|tee",
        "",
        long.as_str(),
    ] {
        let err = engine.handle(&install(bad).execute()).unwrap_err();
        assert!(
            matches!(err, NixgateError::InvalidArgument { .. }),
            "{:?} was not rejected as an invalid argument: {:?}",
            bad,
            err
        );
        assert_eq!(err.exit_code(), exit::VALIDATION);
    }
    assert!(host.invocations().is_empty());
}

#[test]
fn destructive_verbs_need_confirmation() {
    let host = FakeHost::new();
    let config = host.config();
    let engine = engine(&host, &config);

    let err = engine
        .handle(&Intent::new(IntentKind::GarbageCollect).execute())
        .unwrap_err();
    assert!(matches!(err, NixgateError::DisallowedOperation { .. }));
    assert_eq!(err.exit_code(), exit::VALIDATION);
    assert!(err.command().unwrap().ends_with("nix-collect-garbage -d"));
    assert!(host.invocations().is_empty());

    let result = engine
        .handle(&Intent::new(IntentKind::GarbageCollect).execute().confirm())
        .unwrap();
    assert_eq!(result.status, Status::Success);
    assert_eq!(
        host.invocations(),
        ["nix-env --list-generations", "nix-collect-garbage -d"]
    );
}

#[test]
fn failed_rollback_is_loud_and_retained() {
    let host = FakeHost::new();
    host.script(
        "nix",
        "case \"$*\" in \"profile install\"*) exit 1 ;; \"profile rollback\"*) echo 'error: profile locked' >&2; exit 7 ;; esac\nexit 0",
    );
    let config = host.config();
    let engine = engine(&host, &config);

    let result = engine.handle(&install("hello").execute()).unwrap();

    assert_eq!(result.status, Status::RollbackFailed);
    assert_eq!(result.exit_code(), exit::ROLLBACK_FAILED);
    assert_eq!(result.error, Some(ErrorKind::RollbackFailed));
    let snapshot_id = result.snapshot.as_ref().unwrap().id().to_string();
    match &result.rollback {
        Some(RollbackReport::Failed(failure)) => {
            assert_eq!(failure.snapshot_id, snapshot_id);
            assert_eq!(failure.exit_code, Some(7));
            assert!(failure.stderr.contains("profile locked"));
            assert_eq!(
                failure.restore_command,
                format!("{} profile rollback --to 42", nix(&host))
            );
        }
        other => panic!("expected a failed rollback, got {:?}", other),
    }
    let rollbacks = host
        .invocations()
        .iter()
        .filter(|l| l.starts_with("nix profile rollback"))
        .count();
    assert_eq!(rollbacks, 1);

    let retained = engine.snapshots().retained().unwrap();
    assert_eq!(retained.len(), 1);
    assert_eq!(retained[0].snapshot_id, snapshot_id);
    assert_eq!(retained[0].status, status::ROLLBACK_FAILED);

    engine.snapshots().abandon(&snapshot_id).unwrap();
    assert!(engine.snapshots().retained().unwrap().is_empty());
}

#[test]
fn missing_snapshot_tool_blocks_the_mutation() {
    let host = FakeHost::new();
    host.remove("nix-env");
    let config = host.config();
    let engine = engine(&host, &config);

    let err = engine.handle(&install("hello").execute()).unwrap_err();
    assert!(matches!(err, NixgateError::SnapshotError { .. }));
    assert_eq!(err.exit_code(), exit::EXECUTION_FAILED);
    assert!(host.invocations().is_empty());

    let ops: Vec<String> = engine
        .journal()
        .read_executions()
        .unwrap()
        .into_iter()
        .map(|e| e.op)
        .collect();
    assert!(ops.contains(&"snapshot.failed".to_string()));
    assert!(!ops.contains(&"exec.finished".to_string()));
}

#[test]
fn listing_without_current_generation_is_a_snapshot_error() {
    let host = FakeHost::new();
    host.script("nix-env", "echo '   1   2024-01-01 10:00:00'\nexit 0");
    let config = host.config();
    let engine = engine(&host, &config);

    let err = engine.handle(&install("hello").execute()).unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::SnapshotError));
    assert_eq!(host.invocations(), ["nix-env --list-generations"]);
}

#[test]
fn timeout_kills_the_command_and_rolls_back() {
    let host = FakeHost::new();
    host.script(
        "nix",
        "case \"$*\" in \"profile install\"*) sleep 30 ;; esac\nexit 0",
    );
    let mut config = host.config();
    config.timeouts.install = 1;
    let engine = engine(&host, &config);

    let started = Instant::now();
    let result = engine.handle(&install("hello").execute()).unwrap();

    assert!(started.elapsed() < Duration::from_secs(15));
    assert!(result.timed_out);
    assert_eq!(result.error, Some(ErrorKind::ExecutionTimeout));
    assert_eq!(result.status, Status::RolledBack);
    assert_eq!(
        host.invocations().last().map(String::as_str),
        Some("nix profile rollback --to 42")
    );
}

#[test]
fn held_lock_refuses_mutations_but_not_reads() {
    let host = FakeHost::new();
    let config = host.config();
    let engine = engine(&host, &config);

    let _lease = MutationLock::try_acquire(host.state_dir()).expect("lock");

    let err = engine.handle(&install("hello").execute()).unwrap_err();
    assert!(matches!(err, NixgateError::OperationInProgress { .. }));
    assert_eq!(err.exit_code(), exit::CONFLICT);
    assert!(host.invocations().is_empty());

    let search = Intent::new(IntentKind::Search)
        .with_argument("hello")
        .execute();
    let result = engine.handle(&search).unwrap();
    assert_eq!(result.status, Status::Success);
    assert!(result.snapshot.is_none());
    assert_eq!(host.invocations(), ["nix search nixpkgs hello"]);
}

#[test]
fn failed_read_only_command_exits_two_without_snapshot() {
    let host = FakeHost::new();
    host.script("nix", "echo 'error: no such flake' >&2\nexit 1");
    let config = host.config();
    let engine = engine(&host, &config);

    let search = Intent::new(IntentKind::Search)
        .with_argument("hello")
        .execute();
    let result = engine.handle(&search).unwrap();

    assert_eq!(result.status, Status::Failed);
    assert_eq!(result.error, Some(ErrorKind::ExecutionFailed));
    assert_eq!(result.exit_code(), exit::EXECUTION_FAILED);
    assert_eq!(result.exit_code, Some(1));
    assert!(result.stderr.contains("no such flake"));
    assert!(result.snapshot.is_none());
    assert!(result.rollback.is_none());
    assert_eq!(host.invocations(), ["nix search nixpkgs hello"]);
    assert!(engine.snapshots().retained().unwrap().is_empty());
    assert!(MutationLock::try_acquire(host.state_dir()).is_ok());
}

#[test]
fn concurrent_installs_admit_exactly_one() {
    let host = FakeHost::new();
    host.script(
        "nix",
        "case \"$*\" in \"profile install\"*) sleep 1 ;; esac\nexit 0",
    );
    let config = host.config();
    let engine = engine(&host, &config);
    let barrier = Barrier::new(2);

    let results: Vec<_> = thread::scope(|scope| {
        let handles: Vec<_> = ["hello", "cowsay"]
            .into_iter()
            .map(|pkg| {
                let (engine, barrier) = (&engine, &barrier);
                scope.spawn(move || {
                    barrier.wait();
                    engine.handle(&install(pkg).execute())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let succeeded = results
        .iter()
        .filter(|r| matches!(r, Ok(result) if result.status == Status::Success))
        .count();
    let refused = results
        .iter()
        .filter(|r| matches!(r, Err(NixgateError::OperationInProgress { .. })))
        .count();
    assert_eq!((succeeded, refused), (1, 1), "{:?}", results);

    let invocations = host.invocations();
    let installs = invocations
        .iter()
        .filter(|l| l.starts_with("nix profile install"))
        .count();
    let snapshots = invocations
        .iter()
        .filter(|l| l.ends_with("--list-generations"))
        .count();
    assert_eq!((installs, snapshots), (1, 1));
}

#[test]
fn system_lock_is_shared_across_state_dirs() {
    let other_user = FakeHost::new();
    let host = FakeHost::new();
    let mut config = host.config();
    config.manager.system_lock = other_user.system_lock.clone();
    let engine = engine(&host, &config);

    let lease = MutationLock::try_acquire_at(&other_user.system_lock).expect("lock");

    let err = engine
        .handle(&Intent::new(IntentKind::Update).execute())
        .unwrap_err();
    assert!(matches!(err, NixgateError::OperationInProgress { .. }));
    assert!(host.invocations().is_empty());

    // The user profile has its own lock.
    let result = engine.handle(&install("hello").execute()).unwrap();
    assert_eq!(result.status, Status::Success);

    drop(lease);
    let result = engine
        .handle(&Intent::new(IntentKind::Update).execute())
        .unwrap();
    assert_eq!(result.status, Status::Success);
}

#[test]
fn failed_update_restores_the_system_generation_elevated() {
    let host = FakeHost::new();
    host.script("nixos-rebuild", "echo 'error: evaluation failed' >&2\nexit 1");
    let config = host.config();
    let engine = engine(&host, &config);

    let result = engine
        .handle(&Intent::new(IntentKind::Update).execute())
        .unwrap();

    assert_eq!(result.status, Status::RolledBack);
    let sys = host.system_profile.display().to_string();
    let nix_env = host.bin.join("nix-env").display().to_string();
    let rebuild = host.bin.join("nixos-rebuild").display().to_string();
    assert_eq!(
        host.invocations(),
        [
            format!("nix-env --profile {} --list-generations", sys),
            format!("sudo -n {} switch", rebuild),
            "nixos-rebuild switch".to_string(),
            format!("sudo -n {} --profile {} --switch-generation 42", nix_env, sys),
            format!("nix-env --profile {} --switch-generation 42", sys),
            format!("sudo -n {}/bin/switch-to-configuration switch", sys),
            "switch-to-configuration switch".to_string(),
        ]
    );
}

#[test]
fn legacy_dialect_uses_nix_env_forms() {
    let host = FakeHost::new();
    host.script(
        "nix-env",
        &format!(
            "case \"$*\" in *--list-generations*) printf '{}' ;; -iA*) exit 1 ;; esac\nexit 0",
            fake_host::GENERATIONS.replace('\n', "\\n")
        ),
    );
    let mut config = host.config();
    config.manager.dialect = DialectSetting::Legacy;
    let engine = engine(&host, &config);

    let result = engine.handle(&install("hello").execute()).unwrap();

    assert_eq!(result.status, Status::RolledBack);
    assert_eq!(
        host.invocations(),
        [
            "nix-env --list-generations",
            "nix-env -iA nixpkgs.hello",
            "nix-env --switch-generation 42",
        ]
    );
}

#[test]
fn dry_runs_never_probe_but_executes_do() {
    let host = FakeHost::new();
    let mut config = host.config();
    config.manager.dialect = DialectSetting::Auto;

    let assumed = ManagerBinding::resolve(&config, host.state_dir(), false).unwrap();
    assert_eq!(assumed.source, DialectSource::Assumed);
    assert!(host.invocations().is_empty());

    let probed = ManagerBinding::resolve(&config, host.state_dir(), true).unwrap();
    assert_eq!(probed.source, DialectSource::Probed);
    assert_eq!(probed.dialect, Dialect::Modern);
    assert_eq!(host.invocations(), ["nix profile list"]);

    let cached = ManagerBinding::resolve(&config, host.state_dir(), false).unwrap();
    assert_eq!(cached.source, DialectSource::Cached);
    assert_eq!(host.invocations().len(), 1);
}

#[test]
fn probe_falls_back_to_legacy() {
    let host = FakeHost::new();
    host.script("nix", "exit 1");
    let mut config = host.config();
    config.manager.dialect = DialectSetting::Auto;

    let binding = ManagerBinding::resolve(&config, host.state_dir(), true).unwrap();
    assert_eq!(binding.dialect, Dialect::Legacy);
    assert_eq!(host.invocations(), ["nix profile list", "nix-env --version"]);
}

#[test]
fn large_output_is_truncated() {
    let host = FakeHost::new();
    host.script("nix", "yes nixpkgs.hello | head -c 200000\nexit 0");
    let mut config = host.config();
    config.output.max_bytes = 1024;
    let engine = engine(&host, &config);

    let result = engine
        .handle(&Intent::new(IntentKind::List).execute())
        .unwrap();
    assert_eq!(result.status, Status::Success);
    assert!(result.stdout.len() < 2048);
    assert!(result.stdout.contains("truncated"));
}

#[test]
fn rejections_are_journaled() {
    let host = FakeHost::new();
    let config = host.config();
    let engine = engine(&host, &config);

    let _ = engine.handle(&Intent::new(IntentKind::Remove));
    let events = Journal::new(host.state_dir()).read_executions().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].op, "plan.rejected");
    assert_eq!(events[0].status, "invalid_argument");
    assert!(events[0].command.ends_with("profile remove <package>"));
}
