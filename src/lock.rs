//! Single-daemon guarantee for a base directory.
//!
//! The daemon takes a non-blocking flock() on `daemon.lock` before it touches
//! any other rendezvous file and keeps it until exit. The kernel releases it
//! when the process dies, so a crashed daemon never blocks its successor.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock {0} is held by another daemon")]
    Held(String),

    #[error("failed to take daemon lock: {0}")]
    Io(#[from] io::Error),
}

/// Exclusive daemon lock, released on drop.
pub struct DaemonLock {
    file: File,
}

impl DaemonLock {
    /// Take the lock without waiting and record our pid in it.
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if !flock_nonblocking(&file)? {
            return Err(LockError::Held(path.display().to_string()));
        }

        // Truncate only once we own it, the loser must not clobber the holder.
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;

        Ok(Self { file })
    }
}

/// Whether some process currently holds the lock at `path`.
///
/// Takes and immediately drops the lock when it is free, so a daemon
/// starting at that very moment may lose the race and exit.
pub fn is_held(path: &Path) -> io::Result<bool> {
    let file = match OpenOptions::new().read(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    // closing the file releases it
    Ok(!flock_nonblocking(&file)?)
}

/// Ok(false) when someone else holds the lock.
#[cfg(unix)]
fn flock_nonblocking(file: &File) -> io::Result<bool> {
    // SAFETY: the fd stays open for the duration of the call.
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(true);
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => Ok(false),
        _ => Err(err),
    }
}

#[cfg(not(unix))]
fn flock_nonblocking(_file: &File) -> io::Result<bool> {
    Ok(true)
}

#[cfg(unix)]
impl Drop for DaemonLock {
    fn drop(&mut self) {
        // SAFETY: as above; errors are irrelevant, close releases it anyway.
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
    }
}
