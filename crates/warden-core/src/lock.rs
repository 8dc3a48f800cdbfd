//! Non-blocking advisory lock that serializes replication jobs on a host.
//!
//! The lock is an `flock(2)` on a file that is never unlinked, so the kernel
//! drops it when the holder exits and no stale file ever needs reclaiming.

use crate::error::{WardenError, WardenResult};
use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// Held lock. Dropping the guard closes the descriptor, which releases it.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // the owner pid is informational; the flock goes away with the fd
        if let Err(err) = self.file.set_len(0) {
            warn!("failed to clear lock {}: {err}", self.path.display());
        }
    }
}

/// Take the lock at `path` or fail with `Busy` right away.
///
/// The file is created on first use and keeps the pid of the current holder.
pub fn try_acquire(path: &Path) -> WardenResult<LockGuard> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;

    // SAFETY: the descriptor belongs to `file`, which outlives the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.kind() == ErrorKind::WouldBlock {
            return Err(WardenError::Busy {
                lock: path.to_path_buf(),
            });
        }
        return Err(err.into());
    }

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", std::process::id())?;
    debug!("acquired lock {}", path.display());

    Ok(LockGuard {
        file,
        path: path.to_path_buf(),
    })
}
