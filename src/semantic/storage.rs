//! On-disk vector store, `vectors.bin`.
//!
//! ```text
//! header   47 bytes
//!   version      u8          1
//!   model_id     [u8; 32]    SHA256 of the model name
//!   dimensions   u16 le
//!   entry_count  u64 le
//!   header_crc   u32 le      CRC32 of the 43 bytes above
//! entry    repeated entry_count times
//!   id           u64 le
//!   record_len   u32 le
//!   record       JSON EmailRecord, record_len bytes
//!   embedding    f32 le * dimensions
//! trailer
//!   body_crc     u32 le      CRC32 of every entry byte
//! ```
//!
//! Written whole by the indexer, read whole by the daemon.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::semantic::index::{VectorEntry, VectorIndex};
use crate::semantic::EmailRecord;

const FORMAT_VERSION: u8 = 1;

const HEADER_SIZE: usize = 47;
const CRC_OFFSET: usize = 43;

/// Guards allocations when a length field is corrupt
const MAX_RECORD_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: store was built with a different model")]
    ModelMismatch,

    #[error("Checksum mismatch in {0}: file may be corrupted")]
    ChecksumMismatch(&'static str),

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

#[derive(Debug, PartialEq)]
struct Header {
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}

impl Header {
    fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0] = FORMAT_VERSION;
        bytes[1..33].copy_from_slice(&self.model_id);
        bytes[33..35].copy_from_slice(&self.dimensions.to_le_bytes());
        bytes[35..CRC_OFFSET].copy_from_slice(&self.entry_count.to_le_bytes());
        let crc = crc32fast::hash(&bytes[..CRC_OFFSET]);
        bytes[CRC_OFFSET..].copy_from_slice(&crc.to_le_bytes());
        bytes
    }

    fn decode(bytes: &[u8; HEADER_SIZE]) -> Result<Self, VectorStorageError> {
        if bytes[0] != FORMAT_VERSION {
            return Err(VectorStorageError::VersionMismatch(bytes[0], FORMAT_VERSION));
        }
        if le_u32(&bytes[CRC_OFFSET..]) != crc32fast::hash(&bytes[..CRC_OFFSET]) {
            return Err(VectorStorageError::ChecksumMismatch("header"));
        }

        let mut model_id = [0u8; 32];
        model_id.copy_from_slice(&bytes[1..33]);
        let mut count = [0u8; 8];
        count.copy_from_slice(&bytes[35..CRC_OFFSET]);

        Ok(Self {
            model_id,
            dimensions: u16::from_le_bytes([bytes[33], bytes[34]]),
            entry_count: u64::from_le_bytes(count),
        })
    }

    /// The loaded model must be the one the store was built with.
    fn check(&self, model_id: &[u8; 32], dimensions: usize) -> Result<(), VectorStorageError> {
        if self.model_id != *model_id {
            return Err(VectorStorageError::ModelMismatch);
        }
        if self.dimensions as usize != dimensions {
            return Err(VectorStorageError::DimensionMismatch {
                expected: dimensions,
                got: self.dimensions as usize,
            });
        }
        Ok(())
    }
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

/// Reader or writer that folds every byte passing through into a CRC32.
struct Crc<T> {
    inner: T,
    hasher: crc32fast::Hasher,
}

impl<T> Crc<T> {
    fn new(inner: T) -> Self {
        Self {
            inner,
            hasher: crc32fast::Hasher::new(),
        }
    }

    fn finish(self) -> (T, u32) {
        (self.inner, self.hasher.finalize())
    }
}

impl<R: Read> Read for Crc<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

impl<W: Write> Write for Crc<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

pub struct VectorStorage {
    path: PathBuf,
}

impl VectorStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the whole store into memory.
    ///
    /// Fails unless the file was written for `model_id` with `dimensions`.
    pub fn load(
        &self,
        model_id: &[u8; 32],
        dimensions: usize,
    ) -> Result<VectorIndex, VectorStorageError> {
        let mut reader = BufReader::new(File::open(&self.path)?);

        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes)?;
        let header = Header::decode(&header_bytes)?;
        header.check(model_id, dimensions)?;

        let mut body = Crc::new(reader);
        let mut index = VectorIndex::new(dimensions);
        for _ in 0..header.entry_count {
            let (id, record, embedding) = read_entry(&mut body, dimensions)?;
            if let Err(e) = index.insert(id, record, embedding) {
                log::warn!("skipping stored record {}: {}", id, e);
            }
        }

        let (mut reader, computed) = body.finish();
        let mut trailer = [0u8; 4];
        reader.read_exact(&mut trailer)?;
        if u32::from_le_bytes(trailer) != computed {
            return Err(VectorStorageError::ChecksumMismatch("entries"));
        }

        Ok(index)
    }

    /// Replace the store with `index`.
    ///
    /// Written to a sibling temp file, synced, then renamed over the old
    /// store, so a reader sees either the old or the new file.
    pub fn save(&self, index: &VectorIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
        let temp_path = self.path.with_extension("tmp");

        if let Err(e) = write_store(&temp_path, index, model_id) {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }
}

fn write_store(
    path: &Path,
    index: &VectorIndex,
    model_id: &[u8; 32],
) -> Result<(), VectorStorageError> {
    let header = Header {
        model_id: *model_id,
        dimensions: u16::try_from(index.dimensions()).map_err(|_| {
            VectorStorageError::InvalidFormat(format!(
                "{} dimensions do not fit the header",
                index.dimensions()
            ))
        })?,
        entry_count: index.len() as u64,
    };

    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(&header.encode())?;

    let mut body = Crc::new(writer);
    for (id, entry) in index.iter() {
        write_entry(&mut body, id, entry)?;
    }
    let (mut writer, crc) = body.finish();
    writer.write_all(&crc.to_le_bytes())?;

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

fn read_entry<R: Read>(
    reader: &mut R,
    dimensions: usize,
) -> Result<(u64, EmailRecord, Vec<f32>), VectorStorageError> {
    let mut word = [0u8; 8];
    reader.read_exact(&mut word)?;
    let id = u64::from_le_bytes(word);

    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let record_len = u32::from_le_bytes(len);
    if record_len > MAX_RECORD_LEN {
        return Err(VectorStorageError::InvalidFormat(format!(
            "record {} claims {} bytes",
            id, record_len
        )));
    }

    let mut record_bytes = vec![0u8; record_len as usize];
    reader.read_exact(&mut record_bytes)?;
    let record = serde_json::from_slice(&record_bytes).map_err(|e| {
        VectorStorageError::InvalidFormat(format!("record {} is not valid: {}", id, e))
    })?;

    let mut raw = vec![0u8; dimensions * 4];
    reader.read_exact(&mut raw)?;
    let embedding = raw
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    Ok((id, record, embedding))
}

fn write_entry<W: Write>(
    writer: &mut W,
    id: u64,
    entry: &VectorEntry,
) -> Result<(), VectorStorageError> {
    let record_bytes = serde_json::to_vec(&entry.record)
        .map_err(|e| VectorStorageError::InvalidFormat(e.to_string()))?;
    let record_len = u32::try_from(record_bytes.len())
        .ok()
        .filter(|len| *len <= MAX_RECORD_LEN)
        .ok_or_else(|| {
            VectorStorageError::InvalidFormat(format!("record {} is too large to store", id))
        })?;

    writer.write_all(&id.to_le_bytes())?;
    writer.write_all(&record_len.to_le_bytes())?;
    writer.write_all(&record_bytes)?;
    let floats: Vec<u8> = entry
        .embedding
        .iter()
        .flat_map(|value| value.to_le_bytes())
        .collect();
    writer.write_all(&floats)?;

    Ok(())
}
