//! Bounded subprocess execution.
//!
//! Commands are argv vectors, never shell strings. Children run with a
//! cleared environment, in their own process group, with stdout and stderr
//! drained on separate threads into capped buffers. A child that outlives
//! its budget is killed together with its whole process group.

use crate::core::output::truncate_output;
use serde::Serialize;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long to wait for pipe readers once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    pub(crate) fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Build from already-bound tokens; the first token is the program.
    pub(crate) fn from_tokens(mut tokens: Vec<String>) -> Option<Self> {
        if tokens.is_empty() {
            return None;
        }
        let program = tokens.remove(0);
        Some(Self::new(program, tokens))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// What one subprocess did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawOutcome {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub spawn_failed: bool,
    pub duration_ms: u64,
}

impl RawOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && !self.spawn_failed && self.exit_code == Some(0)
    }
}

/// Runs commands under one environment policy and output bound.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    path: String,
    max_output_bytes: usize,
}

impl ProcessRunner {
    pub fn new(path: &str, max_output_bytes: usize) -> Self {
        Self {
            path: path.to_string(),
            max_output_bytes: max_output_bytes.max(1),
        }
    }

    /// Run `cmd` once. Never retries; spawn failures come back as an
    /// unsuccessful outcome rather than an error.
    pub fn run(&self, cmd: &CommandLine, timeout: Duration) -> RawOutcome {
        let start = Instant::now();
        let mut command = Command::new(cmd.program());
        command
            .args(cmd.args())
            .env_clear()
            .env("PATH", &self.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for key in ["HOME", "USER", "NIX_PATH"] {
            if let Ok(value) = std::env::var(key) {
                command.env(key, value);
            }
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return RawOutcome {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("failed to spawn '{}': {}", cmd.program(), e),
                    timed_out: false,
                    spawn_failed: true,
                    duration_ms: start.elapsed().as_millis() as u64,
                };
            }
        };

        let max = self.max_output_bytes;
        let stdout_rx = child.stdout.take().map(|r| spawn_reader(r, max));
        let stderr_rx = child.stderr.take().map(|r| spawn_reader(r, max));

        let mut timed_out = false;
        let mut exit_code = None;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    exit_code = status.code();
                    break;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(program = %cmd.program(), error = %e, "try_wait failed; killing child");
                    kill_group(&mut child);
                    break;
                }
            }
            if start.elapsed() > timeout {
                timed_out = true;
                tracing::warn!(program = %cmd.program(), timeout_secs = timeout.as_secs(), "command timed out; killing process group");
                kill_group(&mut child);
                break;
            }
            std::thread::sleep(POLL_INTERVAL);
        }

        let stdout = collect(stdout_rx, max);
        let mut stderr = collect(stderr_rx, max);
        if timed_out {
            if !stderr.is_empty() && !stderr.ends_with('\n') {
                stderr.push('\n');
            }
            stderr.push_str(&format!(
                "nixgate: command timed out after {}s and was killed",
                timeout.as_secs()
            ));
        }

        RawOutcome {
            exit_code,
            stdout,
            stderr,
            timed_out,
            spawn_failed: false,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

type Drained = (Vec<u8>, usize);

fn spawn_reader<R: Read + Send + 'static>(reader: R, max: usize) -> mpsc::Receiver<Drained> {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(read_bounded(reader, max));
    });
    rx
}

/// Read to EOF, keeping at most `max` bytes and counting the rest.
fn read_bounded<R: Read>(mut reader: R, max: usize) -> Drained {
    let mut kept = Vec::new();
    let mut dropped = 0usize;
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                let room = max.saturating_sub(kept.len());
                let take = room.min(n);
                kept.extend_from_slice(&buf[..take]);
                dropped += n - take;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
    (kept, dropped)
}

fn collect(rx: Option<mpsc::Receiver<Drained>>, max: usize) -> String {
    let Some(rx) = rx else {
        return String::new();
    };
    match rx.recv_timeout(DRAIN_GRACE) {
        Ok((bytes, dropped)) => truncate_output(&bytes, max, dropped),
        // A descendant escaped the process group and still holds the pipe.
        Err(_) => "[... output unavailable: pipe still held open ...]".to_string(),
    }
}

fn kill_group(child: &mut std::process::Child) {
    #[cfg(unix)]
    {
        let pgid = child.id() as i32;
        let _ = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    }
    let _ = child.kill();
    let _ = child.wait();
}
