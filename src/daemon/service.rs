//! Query service owned by the context daemon.
//!
//! Built once at startup from the embedding model and the vector store and
//! never mutated afterwards, so request handlers share it through an `Arc`.

use crate::config::{Config, ContextPaths};
use crate::daemon::protocol::{EmailContext, SearchRequest, SearchResponse, RESPONSE_BUFFER_SIZE};
use crate::semantic::{
    clip_text, Embedder, EmbeddingError, EmbeddingModel, IndexError, VectorIndex, VectorStorage,
    VectorStorageError,
};

/// Errors that stop the daemon or fail a single request.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("another daemon is already running (lock held on {0})")]
    AlreadyRunning(String),

    #[error("vector store not found at {0}, run `mailctx index` first")]
    StoreMissing(String),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("failed to bind {path}: {source}")]
    Bind {
        path: String,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed request: {0}")]
    BadRequest(#[from] serde_json::Error),
}

pub struct ContextService {
    embedder: Box<dyn Embedder>,
    index: VectorIndex,
    max_text_chars: usize,
}

impl ContextService {
    pub fn new(embedder: Box<dyn Embedder>, index: VectorIndex, max_text_chars: usize) -> Self {
        Self {
            embedder,
            index,
            max_text_chars,
        }
    }

    /// Load the embedding model and open the vector store.
    ///
    /// A store written for another model or dimension is a startup error;
    /// the daemon never rebuilds or writes the store.
    pub fn load(config: &Config, paths: &ContextPaths) -> Result<Self, DaemonError> {
        let storage = VectorStorage::new(paths.store.clone());
        if !storage.exists() {
            return Err(DaemonError::StoreMissing(
                storage.path().display().to_string(),
            ));
        }

        log::info!("Loading embedding model '{}'", config.model);
        let model = EmbeddingModel::new(
            &config.model,
            paths.models_dir.clone(),
            Some(config.download_timeout()),
        )?;

        log::info!("Opening vector store {}", storage.path().display());
        let index = storage.load(&model.model_id_hash(), model.dimensions())?;
        log::info!(
            "Loaded {} records ({} dimensions)",
            index.len(),
            index.dimensions()
        );

        Ok(Self::new(Box::new(model), index, config.max_text_chars))
    }

    pub fn indexed_count(&self) -> usize {
        self.index.len()
    }

    /// Records nearest to `query`, best first, at most `limit` of them.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<EmailContext>, DaemonError> {
        let query = query.trim();
        if query.is_empty() || limit == 0 {
            return Ok(vec![]);
        }

        let query_embedding = self.embedder.embed(query)?;
        let neighbors = self.index.nearest(&query_embedding, limit)?;
        log::debug!(
            "scores {:?}",
            neighbors.iter().map(|n| n.score).collect::<Vec<_>>()
        );

        Ok(neighbors
            .into_iter()
            .map(|neighbor| {
                let mut email = EmailContext::from(neighbor.record);
                email.text = clip_text(&email.text, self.max_text_chars);
                email
            })
            .collect())
    }

    /// Turn one raw request into one response that fits the client's read
    /// window. Never fails: errors become an error response.
    pub fn handle(&self, raw: &[u8]) -> SearchResponse {
        match self.try_handle(raw) {
            Ok(emails) => SearchResponse::fitted(emails, RESPONSE_BUFFER_SIZE),
            Err(e) => {
                log::error!("Error handling request: {}", e);
                SearchResponse::error(e.to_string())
            }
        }
    }

    fn try_handle(&self, raw: &[u8]) -> Result<Vec<EmailContext>, DaemonError> {
        let request: SearchRequest = serde_json::from_slice(raw)?;
        let query = request.query.unwrap_or_default();
        log::debug!("query {:?} limit {}", query, request.limit);
        self.search(&query, request.limit)
    }
}
