//! Offline construction of the vector store.
//!
//! Reads mail records as JSON Lines (`text`, `subject`, `sender`, `date`,
//! `path`), cleans the bodies, embeds them in batches and writes
//! `vectors.bin`. The previous store is replaced.

use std::io::BufRead;

use indicatif::{ProgressBar, ProgressStyle};

use crate::semantic::{
    clean_body, EmailRecord, Embedder, EmbeddingError, IndexError, VectorIndex, VectorStorage,
    VectorStorageError,
};

#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    #[error("failed to read records: {0}")]
    Io(#[from] std::io::Error),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Storage error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("embedder returned {got} vectors for {expected} records")]
    BatchSizeMismatch { expected: usize, got: usize },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IndexReport {
    pub indexed: usize,
    pub skipped_empty: usize,
    pub skipped_malformed: usize,
}

/// Parse and clean records. Malformed lines and empty bodies are counted
/// and skipped.
pub fn read_records<R: BufRead>(
    reader: R,
    report: &mut IndexReport,
) -> Result<Vec<EmailRecord>, IndexerError> {
    let mut records = vec![];

    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let mut record: EmailRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("Skipping line {}: {}", line_no + 1, e);
                report.skipped_malformed += 1;
                continue;
            }
        };

        match clean_body(&record.text) {
            Some(text) => {
                record.text = text;
                records.push(record);
            }
            None => report.skipped_empty += 1,
        }
    }

    Ok(records)
}

/// Embed `records` in batches of `batch_size` into a fresh index.
pub fn build_index(
    records: Vec<EmailRecord>,
    embedder: &dyn Embedder,
    batch_size: usize,
    progress: &ProgressBar,
) -> Result<VectorIndex, IndexerError> {
    let mut index = VectorIndex::new(embedder.dimensions());
    let mut next_id: u64 = 0;

    for batch in records.chunks(batch_size.max(1)) {
        let texts: Vec<String> = batch.iter().map(|r| r.text.clone()).collect();
        let embeddings = embedder.embed_batch(&texts)?;
        if embeddings.len() != batch.len() {
            return Err(IndexerError::BatchSizeMismatch {
                expected: batch.len(),
                got: embeddings.len(),
            });
        }

        for (record, embedding) in batch.iter().zip(embeddings) {
            match index.insert(next_id, record.clone(), embedding) {
                Ok(()) => next_id += 1,
                Err(IndexError::ZeroNormVector) => {
                    log::warn!("Skipping {}: empty embedding", record.path);
                }
                Err(e) => return Err(e.into()),
            }
        }
        progress.inc(batch.len() as u64);
    }

    Ok(index)
}

/// Read, embed and save. Returns what was indexed and skipped.
pub fn run<R: BufRead>(
    reader: R,
    embedder: &dyn Embedder,
    storage: &VectorStorage,
    batch_size: usize,
    show_progress: bool,
) -> Result<IndexReport, IndexerError> {
    let mut report = IndexReport::default();
    let records = read_records(reader, &mut report)?;
    log::info!("Embedding {} records with '{}'", records.len(), embedder.name());

    let progress = if show_progress {
        let bar = ProgressBar::new(records.len() as u64);
        if let Ok(style) =
            ProgressStyle::with_template("{bar:40} {pos}/{len} emails ({eta} left)")
        {
            bar.set_style(style);
        }
        bar
    } else {
        ProgressBar::hidden()
    };

    let index = build_index(records, embedder, batch_size, &progress)?;
    progress.finish_and_clear();

    report.indexed = index.len();
    storage.save(&index, &embedder.model_id_hash())?;
    log::info!(
        "Wrote {} records to {}",
        report.indexed,
        storage.path().display()
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::HashEmbedder;
    use std::io::Cursor;

    const RECORDS: &str = r#"{"text":"Renewal terms attached.\n> old quote","subject":"Renewal","sender":"Ana <ana@example.com>","date":"Mon, 3 Mar 2025","path":"/mail/1"}
not json at all

{"text":"> only a quote","subject":"Fwd","sender":"Bo","date":"Tue","path":"/mail/2"}
{"text":"Lunch on Friday?","subject":"Lunch","sender":"Cy","date":"Wed","path":"/mail/3"}
"#;

    #[test]
    fn test_read_records_cleans_and_counts() {
        let mut report = IndexReport::default();
        let records = read_records(Cursor::new(RECORDS), &mut report).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].text, "Renewal terms attached.");
        assert_eq!(records[0].path, "/mail/1");
        assert_eq!(report.skipped_malformed, 1);
        assert_eq!(report.skipped_empty, 1);
    }

    #[test]
    fn test_run_writes_loadable_store() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(tmp.path().join("vectors.bin"));
        let embedder = HashEmbedder::new(8);

        let report = run(Cursor::new(RECORDS), &embedder, &storage, 1, false).unwrap();
        assert_eq!(report.indexed, 2);

        let index = storage
            .load(&embedder.model_id_hash(), embedder.dimensions())
            .unwrap();
        assert_eq!(index.len(), 2);
        let subjects: Vec<&str> = index.iter().map(|(_, e)| e.record.subject.as_str()).collect();
        assert!(subjects.contains(&"Renewal"));
        assert!(subjects.contains(&"Lunch"));
    }

    #[test]
    fn test_embedding_failure_aborts() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = VectorStorage::new(tmp.path().join("vectors.bin"));

        let result = run(
            Cursor::new(RECORDS),
            &HashEmbedder::failing(8),
            &storage,
            10,
            false,
        );
        assert!(matches!(result, Err(IndexerError::Embedding(_))));
        assert!(!storage.exists());
    }
}
