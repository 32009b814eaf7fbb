//! Test doubles shared across modules: a deterministic embedder, a manual
//! clock, launchers and an in-process daemon.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::config::ContextPaths;
use crate::daemon::{self, ContextService, DaemonError, DaemonGuard};
use crate::semantic::{EmailRecord, Embedder, EmbeddingError, VectorIndex};
use crate::supervisor::{Clock, DaemonSupervisor, Launcher, ReadinessSettings};

/// Bag-of-words embedder: every lowercase word bumps one hashed dimension.
pub struct HashEmbedder {
    dimensions: usize,
    fail: bool,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            fail: false,
        }
    }

    pub fn failing(dimensions: usize) -> Self {
        Self {
            dimensions,
            fail: true,
        }
    }
}

impl Embedder for HashEmbedder {
    fn name(&self) -> &str {
        "hash-embedder"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        if self.fail {
            return Err(EmbeddingError::EmbeddingFailed("model exploded".to_string()));
        }

        let mut vector = vec![0.0; self.dimensions];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let mut hasher = DefaultHasher::new();
            word.to_lowercase().hash(&mut hasher);
            vector[(hasher.finish() % self.dimensions as u64) as usize] += 1.0;
        }
        Ok(vector)
    }
}

pub fn sample_records() -> Vec<EmailRecord> {
    vec![
        EmailRecord {
            text: "the renewal terms for next year look fine".to_string(),
            subject: "Contract renewal".to_string(),
            sender: "Ana Lima <ana@example.com>".to_string(),
            date: "Mon, 3 Mar 2025 10:00:00 +0000".to_string(),
            path: "/mail/cur/1".to_string(),
        },
        EmailRecord {
            text: "can we move lunch to friday".to_string(),
            subject: "Lunch".to_string(),
            sender: "Bo Park <bo@example.com>".to_string(),
            date: "Tue, 4 Mar 2025 12:30:00 +0000".to_string(),
            path: "/mail/cur/2".to_string(),
        },
        EmailRecord {
            text: "attached is the quarterly board deck with the renewal numbers".to_string(),
            subject: "Board deck".to_string(),
            sender: "Cy Ortiz <cy@example.com>".to_string(),
            date: "Wed, 5 Mar 2025 09:15:00 +0000".to_string(),
            path: "/mail/cur/3".to_string(),
        },
        EmailRecord {
            text: "please sign the updated terms before the deadline".to_string(),
            subject: "Signature needed".to_string(),
            sender: "Dee Shah <dee@example.com>".to_string(),
            date: "Thu, 6 Mar 2025 16:45:00 +0000".to_string(),
            path: "/mail/cur/4".to_string(),
        },
    ]
}

pub fn sample_index(embedder: &dyn Embedder) -> VectorIndex {
    let mut index = VectorIndex::new(embedder.dimensions());
    for (id, record) in sample_records().into_iter().enumerate() {
        let embedding = embedder.embed(&record.text).unwrap();
        index.insert(id as u64, record, embedding).unwrap();
    }
    index
}

pub fn sample_service() -> ContextService {
    let embedder = HashEmbedder::new(256);
    let index = sample_index(&embedder);
    ContextService::new(Box::new(embedder), index, 1500)
}

/// Five records whose multi-byte bodies overflow the response window
/// when sent whole.
pub fn multibyte_service() -> ContextService {
    let embedder = HashEmbedder::new(256);
    let mut index = VectorIndex::new(embedder.dimensions());
    for n in 0..5u64 {
        let record = EmailRecord {
            text: format!("renewal terms {} {}", n, "é".repeat(1500)),
            subject: format!("Renovação {}", n),
            sender: "Zoë <zoe@example.com>".to_string(),
            date: "Mon, 3 Mar 2025 10:00:00 +0000".to_string(),
            path: format!("/mail/cur/{}", n),
        };
        let embedding = embedder.embed(&record.text).unwrap();
        index.insert(n, record, embedding).unwrap();
    }
    ContextService::new(Box::new(embedder), index, 1500)
}

pub fn test_paths(dir: &Path) -> ContextPaths {
    ContextPaths::new(dir, dir.join("ctx.sock"))
}

/// Clock that only moves when slept on.
pub struct FakeClock {
    start: Instant,
    elapsed: Mutex<Duration>,
    sleeps: AtomicUsize,
}

impl FakeClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
            sleeps: AtomicUsize::new(0),
        }
    }

    pub fn sleeps(&self) -> usize {
        self.sleeps.load(Ordering::SeqCst)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        self.start + *self.elapsed.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        *self.elapsed.lock().unwrap() += duration;
        self.sleeps.fetch_add(1, Ordering::SeqCst);
    }
}

impl Clock for Arc<FakeClock> {
    fn now(&self) -> Instant {
        self.as_ref().now()
    }

    fn sleep(&self, duration: Duration) {
        self.as_ref().sleep(duration)
    }
}

/// Launcher that runs a closure instead of a process and counts launches.
pub struct FakeLauncher {
    launches: Arc<AtomicUsize>,
    action: Box<dyn Fn() -> std::io::Result<()> + Send + Sync>,
}

impl FakeLauncher {
    pub fn new<F>(action: F) -> (Self, Arc<AtomicUsize>)
    where
        F: Fn() -> std::io::Result<()> + Send + Sync + 'static,
    {
        let launches = Arc::new(AtomicUsize::new(0));
        (
            Self {
                launches: launches.clone(),
                action: Box::new(action),
            },
            launches,
        )
    }

    /// A daemon that never shows up.
    pub fn inert() -> (Self, Arc<AtomicUsize>) {
        Self::new(|| Ok(()))
    }

    /// Pretends a daemon started by creating its rendezvous files.
    pub fn touching(paths: &ContextPaths) -> (Self, Arc<AtomicUsize>) {
        let paths = paths.clone();
        Self::new(move || {
            std::fs::write(&paths.pid_file, std::process::id().to_string())?;
            std::fs::write(&paths.socket, b"")?;
            std::fs::write(&paths.ready_file, std::process::id().to_string())
        })
    }
}

impl Launcher for FakeLauncher {
    fn launch(&self) -> std::io::Result<()> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        (self.action)()
    }
}

pub fn settings() -> ReadinessSettings {
    ReadinessSettings {
        startup_timeout: Duration::from_secs(60),
        poll_interval: Duration::from_secs(1),
        grace: Duration::ZERO,
    }
}

pub fn fake_supervisor(
    paths: &ContextPaths,
    launcher: FakeLauncher,
    clock: Arc<FakeClock>,
) -> DaemonSupervisor {
    DaemonSupervisor::new(paths.clone(), settings(), Box::new(launcher), Box::new(clock))
}

/// A real daemon accept loop on a background thread, serving the sample
/// records through the production startup and shutdown path.
pub struct RunningDaemon {
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<Result<(), DaemonError>>>,
}

impl RunningDaemon {
    pub fn start(paths: &ContextPaths, service: ContextService) -> Self {
        let paths = paths.clone();
        let (shutdown, rx) = oneshot::channel::<()>();

        let thread = std::thread::spawn(move || {
            let _guard = DaemonGuard::acquire(&paths)?;
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            runtime.block_on(daemon::serve(&paths, Arc::new(service), async move {
                let _ = rx.await;
            }))
        });

        Self {
            shutdown: Some(shutdown),
            thread: Some(thread),
        }
    }

    /// Start and wait until the ready marker appears.
    pub fn start_ready(paths: &ContextPaths, service: ContextService) -> Self {
        let daemon = Self::start(paths, service);
        wait_for(|| paths.ready_file.exists() && paths.socket.exists());
        daemon
    }

    pub fn stop(mut self) -> Result<(), DaemonError> {
        self.join().expect("daemon thread panicked")
    }

    fn join(&mut self) -> std::thread::Result<Result<(), DaemonError>> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.thread.take() {
            Some(thread) => thread.join(),
            None => Ok(Ok(())),
        }
    }
}

impl Drop for RunningDaemon {
    fn drop(&mut self) {
        let _ = self.join();
    }
}

/// Real-time wait for a condition set by another thread.
pub fn wait_for<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met within 10s");
        std::thread::sleep(Duration::from_millis(10));
    }
}
