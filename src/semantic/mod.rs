//! Semantic search infrastructure for past mail.
//!
//! # Architecture
//!
//! - `embeddings`: `Embedder` trait and the fastembed-backed model
//! - `index`: In-memory vector index with cosine similarity search
//! - `storage`: Binary file I/O for vectors.bin persistence
//! - `preprocess`: Body cleanup before embedding, clipping for the wire
//! - `record`: The stored mail record

pub mod embeddings;
mod index;
mod preprocess;
mod record;
mod storage;

pub use embeddings::{Embedder, EmbeddingError, EmbeddingModel};
pub use index::{IndexError, VectorIndex};
pub use preprocess::{clean_body, clip_text};
pub use record::EmailRecord;
pub use storage::{VectorStorage, VectorStorageError};
