//! Client-side daemon lifecycle.
//!
//! Every short-lived caller runs [`DaemonSupervisor::ensure_running`] before
//! it queries. The supervisor checks the pid marker, reclaims files left by a
//! dead daemon, launches a detached replacement and waits for it to become
//! ready. It is best effort: concurrent callers may both launch, and the
//! daemon lock makes the loser exit.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::config::{Config, ContextPaths, BASE_PATH_ENV};
use crate::lock;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to launch daemon: {0}")]
    Launch(std::io::Error),

    #[error("failed to reclaim stale daemon files: {0}")]
    Reclaim(std::io::Error),

    #[error("daemon did not become ready within {0:?}")]
    StartupTimeout(Duration),

    #[error("daemon pid {pid} is running but its socket {socket} is gone")]
    Unreachable { pid: u32, socket: String },
}

/// Time source for the readiness poll.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Starts a daemon process in the background.
pub trait Launcher: Send + Sync {
    fn launch(&self) -> std::io::Result<()>;
}

/// Launches `<exe> daemon` detached from the caller, output discarded.
pub struct ExeLauncher {
    exe: PathBuf,
    base_dir: PathBuf,
}

impl ExeLauncher {
    pub fn new(exe: PathBuf, base_dir: PathBuf) -> Self {
        Self { exe, base_dir }
    }

    pub fn current(base_dir: &Path) -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?, base_dir.to_path_buf()))
    }
}

impl Launcher for ExeLauncher {
    fn launch(&self) -> std::io::Result<()> {
        let mut command = Command::new(&self.exe);
        command
            .arg("daemon")
            .env(BASE_PATH_ENV, OsString::from(self.base_dir.as_os_str()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            // Own process group, so the caller's terminal signals don't reach it.
            command.process_group(0);
        }

        let child = command.spawn()?;
        log::debug!("launched daemon pid {}", child.id());
        Ok(())
    }
}

/// Poll `check` every `interval` until it returns true or `deadline` passes.
pub fn await_ready<F>(deadline: Instant, interval: Duration, clock: &dyn Clock, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    loop {
        if check() {
            return true;
        }
        if clock.now() >= deadline {
            return false;
        }
        clock.sleep(interval);
    }
}

/// What the pid marker says about the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Stopped,
    /// Process alive, ready marker not written yet.
    Starting(u32),
    Running(u32),
}

#[derive(Debug, Clone)]
pub struct ReadinessSettings {
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub grace: Duration,
}

impl ReadinessSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            startup_timeout: config.startup_timeout(),
            poll_interval: config.poll_interval(),
            grace: config.ready_grace(),
        }
    }
}

pub struct DaemonSupervisor {
    paths: ContextPaths,
    settings: ReadinessSettings,
    launcher: Box<dyn Launcher>,
    clock: Box<dyn Clock>,
}

impl DaemonSupervisor {
    pub fn new(
        paths: ContextPaths,
        settings: ReadinessSettings,
        launcher: Box<dyn Launcher>,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            paths,
            settings,
            launcher,
            clock,
        }
    }

    pub fn paths(&self) -> &ContextPaths {
        &self.paths
    }

    pub fn status(&self) -> DaemonStatus {
        match read_pid(&self.paths.pid_file) {
            Some(pid) if process_alive(pid) => {
                if self.is_ready() {
                    DaemonStatus::Running(pid)
                } else if self.lock_held() {
                    DaemonStatus::Starting(pid)
                } else {
                    DaemonStatus::Stopped
                }
            }
            _ => DaemonStatus::Stopped,
        }
    }

    /// Make sure a daemon is reachable, launching one if needed.
    ///
    /// A live, ready daemon returns at once. Waiting only happens for a
    /// daemon that still holds the lock and has not announced readiness,
    /// or for one we just launched.
    pub fn ensure_running(&self) -> Result<(), SupervisorError> {
        match read_pid(&self.paths.pid_file) {
            Some(pid) if process_alive(pid) => {
                if self.is_ready() {
                    return Ok(());
                }
                if self.lock_held() {
                    if self.paths.ready_file.exists() {
                        return Err(SupervisorError::Unreachable {
                            pid,
                            socket: self.paths.socket.display().to_string(),
                        });
                    }
                    log::debug!("daemon pid {} is still loading", pid);
                    // Another caller may have launched it moments ago.
                    return self.wait_until_ready();
                }
                log::info!("pid {} is alive but holds no daemon lock, relaunching", pid);
            }
            Some(pid) => log::info!("reclaiming files of dead daemon pid {}", pid),
            None => {}
        }

        self.reclaim().map_err(SupervisorError::Reclaim)?;

        log::info!("Starting email context daemon, this may take a while on first run");
        self.launcher.launch().map_err(SupervisorError::Launch)?;

        self.wait_until_ready()
    }

    fn wait_until_ready(&self) -> Result<(), SupervisorError> {
        let deadline = self.clock.now() + self.settings.startup_timeout;
        if !await_ready(deadline, self.settings.poll_interval, self.clock.as_ref(), || {
            self.is_ready()
        }) {
            log::warn!("Daemon took too long to start");
            return Err(SupervisorError::StartupTimeout(self.settings.startup_timeout));
        }

        if !self.settings.grace.is_zero() {
            self.clock.sleep(self.settings.grace);
        }
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.paths.ready_file.exists() && self.paths.socket.exists()
    }

    fn lock_held(&self) -> bool {
        lock::is_held(&self.paths.lock_file).unwrap_or_else(|e| {
            log::warn!("cannot check {}: {}", self.paths.lock_file.display(), e);
            false
        })
    }

    /// Delete marker, endpoint and ready marker left by a dead daemon.
    fn reclaim(&self) -> std::io::Result<()> {
        for path in [
            &self.paths.pid_file,
            &self.paths.socket,
            &self.paths.ready_file,
        ] {
            match std::fs::remove_file(path) {
                Ok(()) => log::debug!("removed {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Parse the pid marker. Missing, garbage and pid 0 all read as `None`.
pub fn read_pid(path: &Path) -> Option<u32> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|pid| *pid != 0 && *pid <= i32::MAX as u32)
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 doesn't actually send a signal;
    // it only checks whether the process exists.
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

/// Ask the daemon to shut down cleanly.
#[cfg(unix)]
pub fn terminate(pid: u32) -> std::io::Result<()> {
    // SAFETY: plain signal delivery to a pid we read from our own marker.
    let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
