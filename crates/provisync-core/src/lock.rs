//! ---
//! ps_section: "01-core-functionality"
//! ps_subsection: "module"
//! ps_type: "source"
//! ps_scope: "code"
//! ps_description: "Process-wide single-instance lock."
//! ps_version: "v0.1.0"
//! ps_owner: "netops"
//! ---
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{ReconcileError, Result};

/// Exclusive `flock` held for the lifetime of the guard.
///
/// Dropping the guard closes the descriptor and releases the lock; the kernel
/// does the same when the process dies, so no exit path can leak it.
pub struct RunLock {
    _lock_file: File,
    path: PathBuf,
}

impl fmt::Debug for RunLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLock")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RunLock {
    /// Acquire without blocking; contention yields `AlreadyRunning`.
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        if !try_flock_exclusive(&file)? {
            return Err(ReconcileError::AlreadyRunning(path.to_path_buf()));
        }
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        debug!(lock = %path.display(), "run lock acquired");
        Ok(Self {
            _lock_file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        debug!(lock = %self.path.display(), "run lock released");
    }
}

/// `Ok(true)` when the lock was taken, `Ok(false)` when someone else holds it.
fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd is a valid descriptor owned by `file` for this call.
        #[allow(unsafe_code)]
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[cfg(unix)]
    #[test]
    fn second_acquire_fails_until_release() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("run/provisync.lock");
        let first = RunLock::acquire(&path).unwrap();

        let err = RunLock::acquire(&path).unwrap_err();
        assert_eq!(err.kind(), "already_running");

        drop(first);
        let again = RunLock::acquire(&path).unwrap();
        assert_eq!(again.path(), path.as_path());
    }

    #[test]
    fn lock_file_records_pid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("provisync.lock");
        let _guard = RunLock::acquire(&path).unwrap();
        let pid = fs::read_to_string(&path).unwrap();
        assert_eq!(pid.trim(), std::process::id().to_string());
    }
}
