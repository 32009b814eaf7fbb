use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use homedir::my_home;
use serde::{Deserialize, Serialize};

/// Environment variable overriding the base directory
pub const BASE_PATH_ENV: &str = "MAILCTX_BASE_PATH";

const CONFIG_FILE_NAME: &str = "config.yaml";

/// Default embedding model, matches the one the index is usually built with
const DEFAULT_MODEL: &str = "all-MiniLM-L6-v2";
const DEFAULT_LIMIT: usize = 3;
const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 60;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
/// Keeps three records inside the client's 8 KiB response window
const DEFAULT_MAX_TEXT_CHARS: usize = 1500;
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const DEFAULT_INDEX_BATCH_SIZE: usize = 100;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Model name for embeddings (e.g., "all-MiniLM-L6-v2")
    #[serde(default = "default_model")]
    pub model: String,

    /// Number of similar messages returned when the caller doesn't ask
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// Listening endpoint. Defaults to a per-user socket in the temp directory.
    #[serde(default)]
    pub socket_path: Option<PathBuf>,

    /// How long a caller waits for a freshly launched daemon
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Extra wait after the daemon reports ready
    #[serde(default)]
    pub ready_grace_ms: u64,

    /// Round-trip timeout for a single query
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Record bodies are clipped to this many characters on the wire
    #[serde(default = "default_max_text_chars")]
    pub max_text_chars: usize,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    #[serde(default = "default_index_batch_size")]
    pub index_batch_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            default_limit: DEFAULT_LIMIT,
            socket_path: None,
            startup_timeout_secs: DEFAULT_STARTUP_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            ready_grace_ms: 0,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_text_chars: DEFAULT_MAX_TEXT_CHARS,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            index_batch_size: DEFAULT_INDEX_BATCH_SIZE,
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

fn default_startup_timeout_secs() -> u64 {
    DEFAULT_STARTUP_TIMEOUT_SECS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_max_text_chars() -> usize {
    DEFAULT_MAX_TEXT_CHARS
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_index_batch_size() -> usize {
    DEFAULT_INDEX_BATCH_SIZE
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if self.model.trim().is_empty() {
            bail!("model cannot be empty");
        }
        if self.startup_timeout_secs == 0 {
            bail!("startup_timeout_secs must be greater than 0");
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be greater than 0");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than 0");
        }
        if self.max_text_chars == 0 {
            bail!("max_text_chars must be greater than 0");
        }
        if self.download_timeout_secs == 0 {
            bail!("download_timeout_secs must be greater than 0");
        }
        if self.index_batch_size == 0 {
            bail!("index_batch_size must be greater than 0");
        }
        Ok(())
    }

    /// Load `config.yaml` from `base_path`, writing the defaults first if the
    /// file does not exist yet.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        let config_path = base_path.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            let defaults = serde_yml::to_string(&Self::default())?;
            std::fs::write(&config_path, defaults)
                .with_context(|| format!("failed to write {}", config_path.display()))?;
        }

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.validate()?;

        Ok(config)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ready_grace(&self) -> Duration {
        Duration::from_millis(self.ready_grace_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

/// Well-known filesystem rendezvous points shared by the daemon and callers.
#[derive(Debug, Clone)]
pub struct ContextPaths {
    pub base_dir: PathBuf,
    pub socket: PathBuf,
    pub pid_file: PathBuf,
    pub ready_file: PathBuf,
    pub lock_file: PathBuf,
    pub store: PathBuf,
    pub log_file: PathBuf,
    pub models_dir: PathBuf,
}

impl ContextPaths {
    pub fn new(base_dir: &Path, socket: PathBuf) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            socket,
            pid_file: base_dir.join("daemon.pid"),
            ready_file: base_dir.join("daemon.ready"),
            lock_file: base_dir.join("daemon.lock"),
            store: base_dir.join("vectors.bin"),
            log_file: base_dir.join("daemon.log"),
            models_dir: base_dir.join("models"),
        }
    }

    pub fn from_config(base_dir: &Path, config: &Config) -> Self {
        let socket = config
            .socket_path
            .clone()
            .unwrap_or_else(default_socket_path);
        Self::new(base_dir, socket)
    }
}

/// Resolve the base directory: `$MAILCTX_BASE_PATH` or `~/.local/share/mailctx`.
pub fn base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var(BASE_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }

    let home = my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;
    Ok(home.join(".local/share/mailctx"))
}

fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join(format!("mailctx-{}.sock", current_uid()))
}

#[cfg(unix)]
fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}

#[cfg(not(unix))]
fn current_uid() -> u32 {
    0
}
