//! nixgate: a safety-gated executor for Nix system management.
//!
//! **Nothing touches the system unless you ask twice.** Every request is
//! a dry run until `--execute` is given, destructive verbs additionally
//! need `--confirm`, and every mutating command runs behind a snapshot of
//! the generation it is about to replace.
//!
//! # Guarantees
//!
//! - **Closed command set**: only registry templates can run; arguments
//!   are allowlisted and passed as argv, never through a shell
//! - **Dry-run by default**: a dry run spawns no subprocess at all
//! - **Snapshot before mutate**: no snapshot, no execution
//! - **Rollback once**: a failed or timed-out mutation is restored exactly
//!   once; a failed restore is reported loudly with its restore command
//! - **Single writer**: one mutating operation at a time per state dir
//!
//! # Examples
//!
//! ```bash
//! # See what would run
//! nixgate install firefox
//!
//! # Run it
//! nixgate install firefox --execute
//!
//! # Destructive verbs need both flags
//! nixgate gc --execute --confirm
//!
//! # Audit trail and retained restore points
//! nixgate history --limit 20
//! nixgate snapshots
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: errors, config, journal, lock, probe and the subprocess runner
//! - [`engine`]: registry, validator, mode controller, snapshots, executor, rollback

pub mod core;
pub mod engine;

use crate::core::config::{self, Config};
use crate::core::error::{NixgateError, exit};
use crate::core::journal::Journal;
use crate::core::output;
use crate::core::probe::ManagerBinding;
use crate::engine::Engine;
use crate::engine::intent::{Intent, IntentKind, Mode};
use crate::engine::mode::{ExecutionResult, RollbackReport, Status};
use crate::engine::snapshot;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::ffi::OsString;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

pub const LOG_ENV: &str = "NIXGATE_LOG";

#[derive(Parser, Debug)]
#[clap(
    name = "nixgate",
    version = env!("CARGO_PKG_VERSION"),
    about = "Safety-gated Nix system management: dry-run by default, snapshot before mutate"
)]
struct Cli {
    #[clap(subcommand)]
    command: Command,
    /// Actually run the command instead of reporting what would run.
    #[clap(long, global = true)]
    execute: bool,
    /// Confirm a destructive operation (required with --execute for rollback and gc).
    #[clap(long, global = true)]
    confirm: bool,
    /// Output format.
    #[clap(long, global = true, value_enum, default_value = "text")]
    format: OutputFormat,
    /// State directory (defaults to $NIXGATE_HOME, then ~/.nixgate).
    #[clap(long, global = true)]
    state_dir: Option<PathBuf>,
    /// Config file (defaults to <state-dir>/config.toml when present).
    #[clap(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(clap::Args, Debug)]
struct VerbArgs {
    /// Package attribute (install, remove) or search query.
    #[clap(value_name = "ARG")]
    argument: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install a package into the user profile.
    Install(VerbArgs),
    /// Remove a package from the user profile.
    Remove(VerbArgs),
    /// Search the package set.
    Search(VerbArgs),
    /// List installed packages.
    List(VerbArgs),
    /// Rebuild and switch the system configuration.
    Update(VerbArgs),
    /// Switch the system back to its previous generation.
    Rollback(VerbArgs),
    /// Delete old generations and collect garbage.
    Gc(VerbArgs),
    /// Show the execution journal.
    History {
        /// Show only the last N events.
        #[clap(long, default_value = "20")]
        limit: usize,
    },
    /// List snapshots still awaiting restore, or abandon one.
    Snapshots {
        #[clap(subcommand)]
        command: Option<SnapshotsCommand>,
    },
    /// Detect the Nix dialect on this host and cache the result.
    Probe,
}

#[derive(Subcommand, Debug)]
enum SnapshotsCommand {
    /// Stop tracking a retained snapshot; the generation itself is kept.
    Abandon { id: String },
}

impl Command {
    fn intent(&self) -> Option<(IntentKind, &VerbArgs)> {
        match self {
            Command::Install(a) => Some((IntentKind::Install, a)),
            Command::Remove(a) => Some((IntentKind::Remove, a)),
            Command::Search(a) => Some((IntentKind::Search, a)),
            Command::List(a) => Some((IntentKind::List, a)),
            Command::Update(a) => Some((IntentKind::Update, a)),
            Command::Rollback(a) => Some((IntentKind::Rollback, a)),
            Command::Gc(a) => Some((IntentKind::GarbageCollect, a)),
            _ => None,
        }
    }
}

/// Parse the process arguments, run, and return the exit code.
pub fn run() -> i32 {
    run_from(std::env::args_os())
}

pub fn run_from<I, T>(args: I) -> i32
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    init_tracing();
    if !std::io::stdout().is_terminal() {
        colored::control::set_override(false);
    }

    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(err) => return report_parse_error(err),
    };
    let format = cli.format;
    let mode = if cli.execute { Mode::Execute } else { Mode::DryRun };
    match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            report_error(&err, mode, format);
            err.exit_code()
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("warn"))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn report_parse_error(err: clap::Error) -> i32 {
    use clap::error::{ContextKind, ContextValue, ErrorKind};
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
            let _ = err.print();
            exit::SUCCESS
        }
        ErrorKind::InvalidSubcommand => {
            let verb = match err.get(ContextKind::InvalidSubcommand) {
                Some(ContextValue::String(s)) => s.clone(),
                _ => String::from("?"),
            };
            let rejection = NixgateError::UnknownIntent { verb };
            eprintln!(
                "{} {}",
                "error[unknown_intent]:".bright_red().bold(),
                rejection
            );
            eprintln!(
                "known verbs: {}",
                IntentKind::ALL.map(|k| k.verb()).join(", ")
            );
            rejection.exit_code()
        }
        _ => {
            let _ = err.print();
            exit::VALIDATION
        }
    }
}

fn dispatch(cli: Cli) -> Result<i32, NixgateError> {
    let state_dir = config::resolve_state_dir(cli.state_dir.as_deref())?;
    let config = Config::load(&state_dir, cli.config.as_deref())?;

    if let Some((kind, args)) = cli.command.intent() {
        let mut intent = Intent::new(kind);
        if let Some(arg) = &args.argument {
            intent = intent.with_argument(arg.clone());
        }
        if cli.execute {
            intent = intent.execute();
        }
        if cli.confirm {
            intent = intent.confirm();
        }
        // Dry runs never probe; they use the cache or assume the modern CLI.
        let binding =
            ManagerBinding::resolve(&config, &state_dir, intent.requested_mode == Mode::Execute)?;
        let engine = Engine::new(&config, binding, &state_dir);
        let result = engine.handle(&intent)?;
        print_result(&result, cli.format)?;
        return Ok(result.exit_code());
    }

    match cli.command {
        Command::History { limit } => history(&state_dir, limit, cli.format),
        Command::Snapshots { command } => snapshots(&state_dir, command, cli.format),
        Command::Probe => probe(&config, &state_dir, cli.format),
        _ => Ok(exit::SUCCESS),
    }
}

fn print_result(result: &ExecutionResult, format: OutputFormat) -> Result<(), NixgateError> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(result)?);
        return Ok(());
    }

    let status = match result.status {
        Status::Success => result.status.as_str().bright_green().bold(),
        Status::Failed | Status::RolledBack => result.status.as_str().bright_yellow().bold(),
        Status::RollbackFailed => result.status.as_str().bright_red().bold(),
    };
    println!("{} {}", "mode:   ".bold(), result.mode.as_str());
    println!("{} {}", "command:".bold(), result.plan.rendered_command());
    println!("{} {}", "status: ".bold(), status);
    if let Some(kind) = result.error {
        println!("{} {}", "error:  ".bold(), kind.as_str().bright_red());
    }
    if let Some(code) = result.exit_code {
        println!("{} {}", "exit:   ".bold(), code);
    }

    if result.mode == Mode::DryRun {
        println!();
        println!("{}", result.stdout);
        return Ok(());
    }

    if !result.stdout.trim().is_empty() {
        println!();
        println!("{}", result.stdout.trim_end());
    }
    if !result.stderr.trim().is_empty() {
        eprintln!("{}", result.stderr.trim_end());
    }

    match &result.rollback {
        Some(RollbackReport::Restored(outcome)) => {
            let generation = result.snapshot.as_ref().map(|s| s.generation()).unwrap_or(0);
            println!();
            println!(
                "{} restored generation {} (snapshot {})",
                "rolled back:".bright_yellow().bold(),
                generation,
                outcome.snapshot_id
            );
            println!("  {}", outcome.restore_command);
        }
        Some(RollbackReport::Failed(failure)) => {
            eprintln!();
            eprintln!(
                "{}",
                "!!! ROLLBACK FAILED: the system may be inconsistent !!!"
                    .bright_red()
                    .bold()
            );
            eprintln!("  snapshot:    {}", failure.snapshot_id.bright_white().bold());
            eprintln!("  failed step: {}", failure.failed_step);
            eprintln!("  restore manually with:");
            eprintln!("    {}", failure.restore_command.bright_cyan().bold());
            if !failure.stderr.trim().is_empty() {
                eprintln!("{}", output::indent_block(failure.stderr.trim_end(), "  | "));
            }
            eprintln!(
                "  then run: nixgate snapshots abandon {}",
                failure.snapshot_id
            );
        }
        None => {}
    }
    Ok(())
}

fn report_error(err: &NixgateError, mode: Mode, format: OutputFormat) {
    let kind = err.kind().map(|k| k.as_str()).unwrap_or("error");
    if format == OutputFormat::Json {
        let doc = serde_json::json!({
            "status": "rejected",
            "mode": mode.as_str(),
            "error": kind,
            "command": err.command(),
            "message": err.to_string(),
            "exit_code": err.exit_code(),
        });
        println!("{}", doc);
        return;
    }
    eprintln!(
        "{} {}",
        format!("error[{}]:", kind).bright_red().bold(),
        err
    );
    if let Some(command) = err.command() {
        eprintln!("{} {}", "mode:   ".bold(), mode.as_str());
        eprintln!("{} {}", "command:".bold(), command);
    }
}

fn history(state_dir: &Path, limit: usize, format: OutputFormat) -> Result<i32, NixgateError> {
    let events = Journal::new(state_dir).read_executions()?;
    let skip = events.len().saturating_sub(limit);
    let tail = &events[skip..];
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(tail)?);
        return Ok(exit::SUCCESS);
    }
    if tail.is_empty() {
        println!("no recorded executions");
        return Ok(exit::SUCCESS);
    }
    for ev in tail {
        let mut line = format!(
            "{}  {:<18} {:<8} {:<7} {:<16} {}",
            ev.ts, ev.op, ev.verb, ev.mode, ev.status, ev.command
        );
        if let Some(id) = &ev.snapshot_id {
            line.push_str(&format!("  [snapshot {}]", id));
        }
        println!("{}", line);
        if let Some(detail) = &ev.detail {
            println!("    {}", output::compact_line(detail, 160).dimmed());
        }
    }
    Ok(exit::SUCCESS)
}

fn snapshots(
    state_dir: &Path,
    command: Option<SnapshotsCommand>,
    format: OutputFormat,
) -> Result<i32, NixgateError> {
    let journal = Journal::new(state_dir);
    if let Some(SnapshotsCommand::Abandon { id }) = command {
        let record = snapshot::abandon_in(&journal, &id)?;
        if format == OutputFormat::Json {
            println!("{}", serde_json::to_string_pretty(&record)?);
        } else {
            println!(
                "abandoned snapshot {} (generation {} is left in place)",
                record.snapshot_id, record.generation
            );
        }
        return Ok(exit::SUCCESS);
    }

    let retained = snapshot::retained_in(&journal)?;
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&retained)?);
        return Ok(exit::SUCCESS);
    }
    if retained.is_empty() {
        println!("no retained snapshots");
        return Ok(exit::SUCCESS);
    }
    for r in &retained {
        let status = if r.status == snapshot::status::ROLLBACK_FAILED {
            r.status.bright_red().bold()
        } else {
            r.status.bright_yellow()
        };
        println!(
            "{}  {:<12} generation {:<6} {}",
            r.snapshot_id, r.scope, r.generation, status
        );
        println!("    restore: {}", r.restore_command);
    }
    Ok(exit::SUCCESS)
}

fn probe(config: &Config, state_dir: &Path, format: OutputFormat) -> Result<i32, NixgateError> {
    let binding = ManagerBinding::probe(config)?;
    binding.write_cache(state_dir)?;
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&binding)?);
    } else {
        println!(
            "dialect: {} (cached in {})",
            binding.dialect.as_str().bright_green().bold(),
            state_dir.join(crate::core::probe::PROBE_CACHE).display()
        );
    }
    Ok(exit::SUCCESS)
}
