//! Text embeddings.
//!
//! The daemon and the indexer only see the [`Embedder`] trait, so tests can
//! swap in a deterministic embedder without downloading a model.
//! [`EmbeddingModel`] is the fastembed-backed implementation.

use std::path::PathBuf;
use std::sync::{mpsc, Mutex};
use std::time::Duration;

use fastembed::{InitOptions, TextEmbedding};
use sha2::{Digest, Sha256};

const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Accepted model names. Lookup ignores case, dashes and dots.
const SUPPORTED_MODELS: &[(&str, fastembed::EmbeddingModel)] = &[
    ("all-MiniLM-L6-v2", fastembed::EmbeddingModel::AllMiniLML6V2),
    ("all-MiniLM-L6-v2-q", fastembed::EmbeddingModel::AllMiniLML6V2Q),
    ("bge-small-en-v1.5", fastembed::EmbeddingModel::BGESmallENV15),
    ("bge-base-en-v1.5", fastembed::EmbeddingModel::BGEBaseENV15),
    ("bge-large-en-v1.5", fastembed::EmbeddingModel::BGELargeENV15),
];

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Model download did not finish within {0} seconds")]
    DownloadTimeout(u64),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Text-to-vector mapping shared by index build time and query time.
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    fn dimensions(&self) -> usize;

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        texts.iter().map(|text| self.embed(text)).collect()
    }

    /// Identifies the model in the vector file header.
    fn model_id_hash(&self) -> [u8; 32] {
        model_id_hash(self.name())
    }
}

/// SHA256 of the model name.
pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    Sha256::digest(model_name.as_bytes()).into()
}

fn squash(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '-' && *c != '.')
        .flat_map(char::to_lowercase)
        .collect()
}

fn lookup_model(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
    let wanted = squash(name);
    SUPPORTED_MODELS
        .iter()
        .find(|(known, _)| squash(known) == wanted)
        .map(|(_, model)| model.clone())
        .ok_or_else(|| {
            let known: Vec<&str> = SUPPORTED_MODELS.iter().map(|(n, _)| *n).collect();
            EmbeddingError::InvalidModel(format!(
                "unknown model {}, supported: {}",
                name,
                known.join(", ")
            ))
        })
}

/// fastembed model behind a Mutex, its embed() takes &mut self.
pub struct EmbeddingModel {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl EmbeddingModel {
    /// Load the named model from `cache_dir`, downloading it on first use.
    ///
    /// Loading runs on a helper thread so a stalled download gives up after
    /// `download_timeout`; the thread itself is left to finish or die with
    /// the process.
    pub fn new(
        model_name: &str,
        cache_dir: PathBuf,
        download_timeout: Option<Duration>,
    ) -> Result<Self, EmbeddingError> {
        let variant = lookup_model(model_name)?;
        let timeout = download_timeout.unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);

        std::fs::create_dir_all(&cache_dir).map_err(|e| {
            EmbeddingError::InitFailed(format!(
                "cannot create {}: {}",
                cache_dir.display(),
                e
            ))
        })?;

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let options = InitOptions::new(variant)
                .with_cache_dir(cache_dir)
                .with_show_download_progress(false);
            let _ = tx.send(TextEmbedding::try_new(options).map_err(|e| e.to_string()));
        });

        let mut model = match rx.recv_timeout(timeout) {
            Ok(Ok(model)) => model,
            Ok(Err(e)) => return Err(EmbeddingError::InitFailed(e)),
            Err(mpsc::RecvTimeoutError::Timeout) => {
                return Err(EmbeddingError::DownloadTimeout(timeout.as_secs()))
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                return Err(EmbeddingError::InitFailed(
                    "model loader thread panicked".to_string(),
                ))
            }
        };

        let dimensions = model
            .embed(vec!["dimension check"], None)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?
            .first()
            .map(Vec::len)
            .ok_or_else(|| EmbeddingError::InitFailed("model returned no embedding".to_string()))?;
        log::debug!("model {} produces {} dimensions", model_name, dimensions);

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    fn run<S: AsRef<str> + Send + Sync>(
        &self,
        texts: Vec<S>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut model = self
            .model
            .lock()
            .map_err(|e| EmbeddingError::EmbeddingFailed(format!("model lock poisoned: {}", e)))?;
        model
            .embed(texts, None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))
    }
}

impl Embedder for EmbeddingModel {
    fn name(&self) -> &str {
        &self.model_name
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.run(vec![text])?
            .pop()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("no embedding returned".to_string()))
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        self.run(texts.iter().map(String::as_str).collect())
    }
}
