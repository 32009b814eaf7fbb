//! Long-running context daemon.
//!
//! Owns the embedding model and the vector store and answers similarity
//! queries over a Unix domain socket, one connection at a time.

pub mod protocol;
mod service;

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::Instrument;

use crate::config::{Config, ContextPaths};
use crate::lock::{DaemonLock, LockError};
use crate::supervisor::read_pid;
use protocol::{SearchResponse, REQUEST_BUFFER_SIZE};
pub use service::{ContextService, DaemonError};

/// Ownership of the daemon's rendezvous files.
///
/// Holds the daemon lock; on drop removes the pid marker if it still names
/// this process, then releases the lock.
pub struct DaemonGuard {
    paths: ContextPaths,
    _lock: DaemonLock,
}

impl DaemonGuard {
    /// Startup steps that precede loading: take the lock, write our pid,
    /// clear a stale endpoint and ready marker.
    pub fn acquire(paths: &ContextPaths) -> Result<Self, DaemonError> {
        std::fs::create_dir_all(&paths.base_dir)?;

        let lock = DaemonLock::acquire(&paths.lock_file).map_err(|e| match e {
            LockError::Held(path) => DaemonError::AlreadyRunning(path),
            LockError::Io(e) => DaemonError::Io(e),
        })?;

        std::fs::write(&paths.pid_file, std::process::id().to_string())?;
        remove_if_exists(&paths.socket)?;
        remove_if_exists(&paths.ready_file)?;

        Ok(Self {
            paths: paths.clone(),
            _lock: lock,
        })
    }
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        if read_pid(&self.paths.pid_file) == Some(std::process::id()) {
            let _ = std::fs::remove_file(&self.paths.pid_file);
        }
    }
}

/// Removes the endpoint and ready marker created by [`serve`].
struct EndpointGuard<'a> {
    paths: &'a ContextPaths,
}

impl Drop for EndpointGuard<'_> {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.paths.ready_file);
        let _ = std::fs::remove_file(&self.paths.socket);
    }
}

/// SIGINT/SIGTERM listener, registered before the socket is bound.
pub struct ShutdownSignal {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownSignal {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    pub async fn recv(mut self) {
        tokio::select! {
            _ = self.interrupt.recv() => {},
            _ = self.terminate.recv() => {},
        }
        log::info!("Received shutdown signal, cleaning up");
    }
}

/// Run the daemon until a termination signal arrives.
///
/// Any error returned here happened before the endpoint existed (or while
/// binding it) and should end the process with a nonzero status.
pub fn run(config: &Config, paths: &ContextPaths) -> Result<(), DaemonError> {
    let _guard = DaemonGuard::acquire(paths)?;
    log::info!("Starting context daemon (pid {})", std::process::id());

    let service = ContextService::load(config, paths)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let shutdown = ShutdownSignal::install()?;
        serve(paths, Arc::new(service), shutdown.recv()).await
    })
}

/// Bind the endpoint, announce readiness and answer connections until
/// `shutdown` completes.
pub async fn serve<F>(
    paths: &ContextPaths,
    service: Arc<ContextService>,
    shutdown: F,
) -> Result<(), DaemonError>
where
    F: Future<Output = ()>,
{
    let listener = UnixListener::bind(&paths.socket).map_err(|source| DaemonError::Bind {
        path: paths.socket.display().to_string(),
        source,
    })?;
    let _endpoint = EndpointGuard { paths };

    std::fs::write(&paths.ready_file, std::process::id().to_string())?;
    log::info!(
        "Daemon listening on {} ({} records)",
        paths.socket.display(),
        service.indexed_count()
    );

    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    handle_connection(stream, service.clone())
                        .instrument(tracing::info_span!("connection"))
                        .await
                }
                Err(e) => log::error!("Accept error: {}", e),
            },
            _ = &mut shutdown => break,
        }
    }

    Ok(())
}

async fn handle_connection(mut stream: UnixStream, service: Arc<ContextService>) {
    let mut buf = vec![0u8; REQUEST_BUFFER_SIZE];
    let read = match stream.read(&mut buf).await {
        Ok(0) => return,
        Ok(n) => n,
        Err(e) => {
            log::error!("Error reading request: {}", e);
            return;
        }
    };
    buf.truncate(read);

    // Embedding is CPU bound; keep it off the reactor threads.
    let response = match tokio::task::spawn_blocking(move || service.handle(&buf)).await {
        Ok(response) => response,
        Err(e) => {
            log::error!("Request handler failed: {}", e);
            SearchResponse::error(format!("request handler failed: {}", e))
        }
    };

    let payload = match serde_json::to_vec(&response) {
        Ok(payload) => payload,
        Err(e) => {
            log::error!("Error encoding response: {}", e);
            return;
        }
    };

    if let Err(e) = stream.write_all(&payload).await {
        log::error!("Error writing response: {}", e);
        return;
    }
    let _ = stream.shutdown().await;
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
