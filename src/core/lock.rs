//! Single-writer lock held across snapshot → execute → rollback.
//!
//! The lock is a kernel advisory lock (`flock`) on a file that is never
//! removed. The kernel drops it when the holding descriptor closes, so a
//! killed process cannot leave a stale lock behind. The holder writes its
//! pid into the file only so a refused caller can name it.

use crate::core::error::NixgateError;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = "mutation.lock";

#[derive(Debug)]
pub struct MutationLease {
    path: PathBuf,
    file: File,
}

impl MutationLease {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MutationLease {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Why the lock could not be taken.
#[derive(Debug)]
pub enum LockError {
    Held { path: PathBuf, holder: String },
    Io(io::Error),
}

pub struct MutationLock;

impl MutationLock {
    /// Per-user lock guarding the profile owned by this state directory.
    pub fn lock_path(state_dir: &Path) -> PathBuf {
        state_dir.join(LOCK_FILE)
    }

    pub fn try_acquire(state_dir: &Path) -> Result<MutationLease, LockError> {
        Self::try_acquire_at(&Self::lock_path(state_dir))
    }

    /// Take the lock at `path` or fail immediately; never blocks.
    pub fn try_acquire_at(path: &Path) -> Result<MutationLease, LockError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(LockError::Io)?;
        }
        let (mut file, writable) = open_lock_file(path).map_err(LockError::Io)?;
        match file.try_lock_exclusive() {
            Ok(()) => {}
            Err(err) if is_contended(&err) => {
                return Err(LockError::Held {
                    path: path.to_path_buf(),
                    holder: read_holder(&mut file),
                });
            }
            Err(err) => return Err(LockError::Io(err)),
        }
        if writable {
            if let Err(err) = record_holder(&mut file) {
                tracing::debug!(lock = %path.display(), error = %err, "could not record lock holder");
            }
        }
        Ok(MutationLease {
            path: path.to_path_buf(),
            file,
        })
    }
}

impl LockError {
    pub fn into_error(self, command: &str) -> NixgateError {
        match self {
            LockError::Held { path, holder } => NixgateError::OperationInProgress {
                command: command.to_string(),
                lock_path: path,
                holder,
            },
            LockError::Io(e) => NixgateError::IoError(e),
        }
    }
}

/// A shared lock file created by another user may not be writable; `flock`
/// works on a read-only descriptor, so fall back to one.
fn open_lock_file(path: &Path) -> io::Result<(File, bool)> {
    let opened = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path);
    match opened {
        Ok(file) => Ok((file, true)),
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
            Ok((OpenOptions::new().read(true).open(path)?, false))
        }
        Err(err) => Err(err),
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn record_holder(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    file.flush()
}

fn read_holder(file: &mut File) -> String {
    let mut content = String::new();
    let parsed = file
        .seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_string(&mut content))
        .ok()
        .and_then(|_| content.trim().parse::<u32>().ok());
    match parsed {
        Some(pid) => format!("pid {}", pid),
        None => "unknown".to_string(),
    }
}
