//! Binary storage for cache snapshots.
//!
//! File format: pairs_cache.bin
//!
//! Header (27 bytes):
//! - version: u8 (1)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - last_updated: i64 (unix millis, little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated):
//! - pair_id: u64 (little-endian)
//! - item1: u32 length + UTF-8 bytes
//! - item2: u32 length + UTF-8 bytes
//! - embedding: [f32; dimensions] (little-endian)

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::semantic::snapshot::{CacheSnapshot, CachedItem, EmbeddingMatrix};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// version(1) + dimensions(2) + entry_count(8) + last_updated(8) + checksum(4)
const HEADER_SIZE: usize = 27;

/// Upper bound for a single stored string, guards against reading garbage lengths.
const MAX_TEXT_LEN: u32 = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,
}

/// Storage manager for the persisted cache snapshot.
pub struct SnapshotStorage {
    path: PathBuf,
}

impl SnapshotStorage {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load a snapshot. A missing file is `Ok(None)`.
    pub fn load(&self) -> Result<Option<CacheSnapshot>, SnapshotStorageError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let mut reader = BufReader::new(file);

        let header = Self::read_header(&mut reader)?;
        let dimensions = header.dimensions as usize;

        let last_updated = DateTime::<Utc>::from_timestamp_millis(header.last_updated)
            .ok_or_else(|| {
                SnapshotStorageError::InvalidFormat(format!(
                    "bad timestamp {}",
                    header.last_updated
                ))
            })?;

        let count = usize::try_from(header.entry_count)
            .map_err(|_| SnapshotStorageError::InvalidFormat("entry count overflow".into()))?;

        // capacity is a hint only; a lying header must not trigger a huge allocation
        let hint = count.min(1 << 16);
        let mut items = Vec::with_capacity(hint);
        let mut matrix = EmbeddingMatrix::with_capacity(dimensions, hint);

        for _ in 0..count {
            let (item, embedding) = Self::read_entry(&mut reader, dimensions)?;
            matrix.push_row(&embedding);
            items.push(item);
        }

        CacheSnapshot::new(items, matrix, last_updated)
            .map(Some)
            .map_err(|e| SnapshotStorageError::InvalidFormat(e.to_string()))
    }

    /// Save a snapshot.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, snapshot: &CacheSnapshot) -> Result<(), SnapshotStorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let temp_path = self.path.with_extension("tmp");

        let result = self.write_to_file(&temp_path, snapshot);

        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    /// Delete the storage file if it exists.
    pub fn delete(&self) -> Result<(), SnapshotStorageError> {
        if self.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn write_to_file(
        &self,
        path: &Path,
        snapshot: &CacheSnapshot,
    ) -> Result<(), SnapshotStorageError> {
        let dimensions = u16::try_from(snapshot.embeddings().dimensions()).map_err(|_| {
            SnapshotStorageError::InvalidFormat(format!(
                "{} dimensions do not fit the format",
                snapshot.embeddings().dimensions()
            ))
        })?;

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = Header {
            version: FORMAT_VERSION,
            dimensions,
            entry_count: snapshot.len() as u64,
            last_updated: snapshot.last_updated().timestamp_millis(),
        };
        Self::write_header(&mut writer, &header)?;

        for (item, row) in snapshot.items().iter().zip(snapshot.embeddings().iter_rows()) {
            Self::write_entry(&mut writer, item, row)?;
        }

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;

        Ok(())
    }

    fn read_header(reader: &mut impl Read) -> Result<Header, SnapshotStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header_bytes)?;

        let version = header_bytes[0];
        if version != FORMAT_VERSION {
            return Err(SnapshotStorageError::VersionMismatch(version, FORMAT_VERSION));
        }

        let stored_checksum = u32::from_le_bytes(le_array(&header_bytes[23..27]));
        let computed_checksum = Self::compute_checksum(&header_bytes[0..23]);
        if stored_checksum != computed_checksum {
            return Err(SnapshotStorageError::ChecksumMismatch);
        }

        Ok(Header {
            version,
            dimensions: u16::from_le_bytes(le_array(&header_bytes[1..3])),
            entry_count: u64::from_le_bytes(le_array(&header_bytes[3..11])),
            last_updated: i64::from_le_bytes(le_array(&header_bytes[11..19])),
        })
    }

    fn write_header(writer: &mut impl Write, header: &Header) -> Result<(), SnapshotStorageError> {
        let mut header_bytes = [0u8; HEADER_SIZE];

        header_bytes[0] = header.version;
        header_bytes[1..3].copy_from_slice(&header.dimensions.to_le_bytes());
        header_bytes[3..11].copy_from_slice(&header.entry_count.to_le_bytes());
        header_bytes[11..19].copy_from_slice(&header.last_updated.to_le_bytes());
        // bytes 19..23 reserved

        let checksum = Self::compute_checksum(&header_bytes[0..23]);
        header_bytes[23..27].copy_from_slice(&checksum.to_le_bytes());

        writer.write_all(&header_bytes)?;
        Ok(())
    }

    fn read_entry(
        reader: &mut impl Read,
        dimensions: usize,
    ) -> Result<(CachedItem, Vec<f32>), SnapshotStorageError> {
        let mut id_bytes = [0u8; 8];
        reader.read_exact(&mut id_bytes)?;
        let id = u64::from_le_bytes(id_bytes);

        let item1 = Self::read_text(reader)?;
        let item2 = Self::read_text(reader)?;

        let mut embedding = Vec::with_capacity(dimensions);
        for _ in 0..dimensions {
            let mut float_bytes = [0u8; 4];
            reader.read_exact(&mut float_bytes)?;
            embedding.push(f32::from_le_bytes(float_bytes));
        }

        Ok((CachedItem { id, item1, item2 }, embedding))
    }

    fn write_entry(
        writer: &mut impl Write,
        item: &CachedItem,
        embedding: &[f32],
    ) -> Result<(), SnapshotStorageError> {
        writer.write_all(&item.id.to_le_bytes())?;
        Self::write_text(writer, &item.item1)?;
        Self::write_text(writer, &item.item2)?;

        for &value in embedding {
            writer.write_all(&value.to_le_bytes())?;
        }

        Ok(())
    }

    fn read_text(reader: &mut impl Read) -> Result<String, SnapshotStorageError> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes);
        if len > MAX_TEXT_LEN {
            return Err(SnapshotStorageError::InvalidFormat(format!(
                "text length {len} exceeds limit"
            )));
        }

        let mut buf = vec![0u8; len as usize];
        reader.read_exact(&mut buf)?;
        String::from_utf8(buf)
            .map_err(|e| SnapshotStorageError::InvalidFormat(format!("invalid utf8: {e}")))
    }

    fn write_text(writer: &mut impl Write, text: &str) -> Result<(), SnapshotStorageError> {
        let len = u32::try_from(text.len())
            .ok()
            .filter(|len| *len <= MAX_TEXT_LEN)
            .ok_or_else(|| SnapshotStorageError::InvalidFormat("text too long".into()))?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(text.as_bytes())?;
        Ok(())
    }

    fn compute_checksum(data: &[u8]) -> u32 {
        crc32fast::hash(data)
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

#[derive(Debug)]
struct Header {
    version: u8,
    dimensions: u16,
    entry_count: u64,
    last_updated: i64,
}
