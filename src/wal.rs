//! Write-ahead log for staged index mutations.
//!
//! Staged (not yet snapshotted) changes live only in each branch's working
//! index. Every such change is written here first, so the working indexes
//! can be rebuilt after a restart. A snapshot or branch deletion marks the
//! branch's entries committed; committed entries are never replayed.

use crate::error::{Result, StoreError};
use crate::index::PathIndex;
use crate::types::{Hash, ModulePath};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Magic bytes for WAL file.
const WAL_MAGIC: &[u8; 4] = b"WAL\0";

/// Current WAL format version.
const WAL_VERSION: u8 = 1;

/// Header size: magic + version.
const HEADER_LEN: u64 = 5;

/// A staged mutation of a branch's working index.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalOperation {
    /// Point a path at content.
    Set {
        branch: String,
        path: ModulePath,
        hash: Hash,
    },
    /// Remove a path.
    Remove { branch: String, path: ModulePath },
    /// Replace everything under a prefix (restore and rollback).
    Replace {
        branch: String,
        prefix: ModulePath,
        entries: Vec<(ModulePath, Hash)>,
    },
}

impl WalOperation {
    pub fn branch(&self) -> &str {
        match self {
            WalOperation::Set { branch, .. }
            | WalOperation::Remove { branch, .. }
            | WalOperation::Replace { branch, .. } => branch,
        }
    }

    /// Apply to a working index, returning each path whose value changed
    /// and its new value (`None` = removed).
    ///
    /// Every operation overwrites, so re-applying an already applied entry
    /// changes nothing.
    pub fn apply_to(&self, index: &mut PathIndex) -> Vec<(ModulePath, Option<Hash>)> {
        match self {
            WalOperation::Set { path, hash, .. } => {
                if index.set(path.clone(), *hash) == Some(*hash) {
                    Vec::new()
                } else {
                    vec![(path.clone(), Some(*hash))]
                }
            }
            WalOperation::Remove { path, .. } => {
                if index.remove(path) {
                    vec![(path.clone(), None)]
                } else {
                    Vec::new()
                }
            }
            WalOperation::Replace {
                prefix, entries, ..
            } => {
                let source: PathIndex = entries.iter().cloned().collect();
                index.replace_subtree(prefix, &source)
            }
        }
    }
}

/// A single pending WAL entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WalEntry {
    /// Unique sequence number for this entry.
    pub seq: u64,
    pub operation: WalOperation,
    /// Seconds since Unix epoch.
    pub timestamp: u64,
}

/// What is physically framed in the file.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum WalRecord {
    Entry(WalEntry),
    Committed(Vec<u64>),
}

/// Write-ahead log manager.
pub struct WriteAheadLog {
    /// Path to the WAL file.
    path: PathBuf,
    /// Current sequence number.
    next_seq: Mutex<u64>,
    /// Write handle.
    writer: Mutex<Option<BufWriter<File>>>,
}

impl WriteAheadLog {
    /// Create or open a WAL file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (next_seq, writer) = if path.exists() {
            let file = OpenOptions::new().read(true).open(&path)?;
            let mut reader = BufReader::new(file);
            Self::read_header(&mut reader)?;

            let mut max_seq = 0u64;
            let mut valid_end = HEADER_LEN;
            while let Ok((record, size)) = Self::read_record(&mut reader) {
                if let WalRecord::Entry(entry) = record {
                    max_seq = max_seq.max(entry.seq);
                }
                valid_end += size;
            }

            // Drop a torn tail so new entries stay reachable.
            let file = OpenOptions::new().append(true).open(&path)?;
            if file.metadata()?.len() > valid_end {
                warn!(path = %path.display(), "truncating torn WAL tail");
                file.set_len(valid_end)?;
                file.sync_all()?;
            }
            (max_seq + 1, Some(BufWriter::new(file)))
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;

            file.write_all(WAL_MAGIC)?;
            file.write_all(&[WAL_VERSION])?;
            file.sync_all()?;

            (1, Some(BufWriter::new(file)))
        };

        Ok(Self {
            path,
            next_seq: Mutex::new(next_seq),
            writer: Mutex::new(writer),
        })
    }

    /// Log an operation (returns sequence number).
    pub fn log(&self, operation: WalOperation) -> Result<u64> {
        let mut next_seq = self.next_seq.lock();
        let seq = *next_seq;
        *next_seq += 1;

        let entry = WalEntry {
            seq,
            operation,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };

        self.append(&WalRecord::Entry(entry))?;
        Ok(seq)
    }

    /// Mark entries as committed.
    pub fn commit(&self, seqs: &[u64]) -> Result<()> {
        if seqs.is_empty() {
            return Ok(());
        }
        self.append(&WalRecord::Committed(seqs.to_vec()))
    }

    /// All pending (uncommitted) entries, in sequence order.
    pub fn get_pending_entries(&self) -> Result<Vec<WalEntry>> {
        if let Some(w) = self.writer.lock().as_mut() {
            w.flush()?;
        }
        Self::read_pending(&self.path)
    }

    /// Rewrite the log with only its pending entries. Sequence numbers keep
    /// counting from where they were.
    pub fn compact(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        if let Some(w) = writer.as_mut() {
            w.flush()?;
        }
        let pending = Self::read_pending(&self.path)?;
        let kept = pending.len();

        let tmp_path = self.path.with_extension("wal.tmp");
        {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            tmp.write_all(WAL_MAGIC)?;
            tmp.write_all(&[WAL_VERSION])?;
            for entry in pending {
                Self::write_record(&mut tmp, &WalRecord::Entry(entry))?;
            }
            tmp.flush()?;
            tmp.get_ref().sync_all()?;
        }

        *writer = None;
        fs::rename(&tmp_path, &self.path)?;
        *writer = Some(BufWriter::new(
            OpenOptions::new().append(true).open(&self.path)?,
        ));

        debug!(kept, "compacted WAL");
        Ok(())
    }

    fn read_pending(path: &Path) -> Result<Vec<WalEntry>> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(HEADER_LEN))?;
        let mut reader = BufReader::new(file);

        let mut entries = BTreeMap::new();
        let mut committed = HashSet::new();

        // A torn final record just ends the scan.
        while let Ok((record, _)) = Self::read_record(&mut reader) {
            match record {
                WalRecord::Entry(entry) => {
                    entries.insert(entry.seq, entry);
                }
                WalRecord::Committed(seqs) => committed.extend(seqs),
            }
        }

        Ok(entries
            .into_iter()
            .filter(|(seq, _)| !committed.contains(seq))
            .map(|(_, entry)| entry)
            .collect())
    }

    /// Clear the WAL (called once nothing is pending).
    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        *writer = None;

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;

        file.write_all(WAL_MAGIC)?;
        file.write_all(&[WAL_VERSION])?;
        file.sync_all()?;

        *writer = Some(BufWriter::new(
            OpenOptions::new().append(true).open(&self.path)?,
        ));

        *self.next_seq.lock() = 1;

        Ok(())
    }

    /// Check if WAL has any pending entries.
    pub fn has_pending(&self) -> Result<bool> {
        Ok(!self.get_pending_entries()?.is_empty())
    }

    fn append(&self, record: &WalRecord) -> Result<()> {
        let mut writer = self.writer.lock();
        if let Some(ref mut w) = *writer {
            Self::write_record(w, record)?;
            w.flush()?;
            w.get_ref().sync_all()?;
        }
        Ok(())
    }

    fn read_header(reader: &mut BufReader<File>) -> Result<()> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != WAL_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid WAL magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != WAL_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported WAL version: {}",
                version[0]
            )));
        }
        Ok(())
    }

    fn write_record(writer: &mut BufWriter<File>, record: &WalRecord) -> Result<()> {
        let encoded = rmp_serde::to_vec(record)?;

        let len = encoded.len() as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&encoded)?;

        let checksum = crc32fast::hash(&encoded);
        writer.write_all(&checksum.to_le_bytes())?;

        Ok(())
    }

    /// Read one framed record, returning it and its size on disk.
    fn read_record(reader: &mut BufReader<File>) -> Result<(WalRecord, u64)> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > 100 * 1024 * 1024 {
            return Err(StoreError::Corruption("WAL entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);

        let computed_checksum = crc32fast::hash(&encoded);
        if stored_checksum != computed_checksum {
            return Err(StoreError::Corruption("WAL checksum mismatch".into()));
        }

        Ok((rmp_serde::from_slice(&encoded)?, 8 + len as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn set(branch: &str, path: &str, content: &[u8]) -> WalOperation {
        WalOperation::Set {
            branch: branch.to_string(),
            path: ModulePath::parse(path).unwrap(),
            hash: Hash::from_bytes(content),
        }
    }

    #[test]
    fn test_wal_basic() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("test.wal")).unwrap();

        let seq = wal.log(set("main", "mod/a", b"hello")).unwrap();
        assert_eq!(seq, 1);

        let pending = wal.get_pending_entries().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].seq, 1);
        assert_eq!(pending[0].operation.branch(), "main");

        wal.commit(&[1]).unwrap();

        let pending = wal.get_pending_entries().unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn test_wal_partial_commit() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("test.wal")).unwrap();

        let seq1 = wal.log(set("main", "a", b"one")).unwrap();
        let seq2 = wal
            .log(WalOperation::Remove {
                branch: "feature".to_string(),
                path: ModulePath::parse("b").unwrap(),
            })
            .unwrap();
        let seq3 = wal.log(set("main", "c", b"three")).unwrap();

        assert_eq!((seq1, seq2, seq3), (1, 2, 3));

        wal.commit(&[seq1, seq3]).unwrap();

        let pending = wal.get_pending_entries().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].seq, 2);
        assert_eq!(pending[0].operation.branch(), "feature");
    }

    #[test]
    fn test_wal_persistence() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");

        {
            let wal = WriteAheadLog::open(&wal_path).unwrap();
            wal.log(set("main", "mod/a", b"module bytes")).unwrap();
        }

        {
            let wal = WriteAheadLog::open(&wal_path).unwrap();
            let pending = wal.get_pending_entries().unwrap();
            assert_eq!(pending.len(), 1);
            assert_eq!(pending[0].operation, set("main", "mod/a", b"module bytes"));

            // Sequence numbers continue after reopen.
            assert_eq!(wal.log(set("main", "b", b"x")).unwrap(), 2);
        }
    }

    #[test]
    fn test_apply_is_idempotent() {
        let mut index = PathIndex::new();
        let keep = ModulePath::parse("lib/keep").unwrap();
        index.set(keep.clone(), Hash::from_bytes(b"keep"));

        let ops = vec![
            set("main", "lib/a", b"a"),
            WalOperation::Replace {
                branch: "main".to_string(),
                prefix: ModulePath::parse("lib").unwrap(),
                entries: vec![(ModulePath::parse("lib/b").unwrap(), Hash::from_bytes(b"b"))],
            },
            WalOperation::Remove {
                branch: "main".to_string(),
                path: keep.clone(),
            },
        ];

        let changes: Vec<_> = ops.iter().flat_map(|op| op.apply_to(&mut index)).collect();
        assert_eq!(changes.len(), 4);
        let after_first_pass = index.clone();

        for op in &ops {
            op.apply_to(&mut index);
        }
        assert_eq!(index, after_first_pass);
        assert_eq!(index.len(), 1);
        assert!(!index.contains(&keep));
    }

    #[test]
    fn test_torn_tail_truncated_on_open() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");

        {
            let wal = WriteAheadLog::open(&wal_path).unwrap();
            wal.log(set("main", "a", b"a")).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&wal_path).unwrap();
            file.write_all(&[7, 0, 0, 0, 1, 2]).unwrap();
        }

        {
            let wal = WriteAheadLog::open(&wal_path).unwrap();
            wal.log(set("main", "b", b"b")).unwrap();
        }

        let wal = WriteAheadLog::open(&wal_path).unwrap();
        let pending = wal.get_pending_entries().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1].operation, set("main", "b", b"b"));
    }

    #[test]
    fn test_compact_keeps_pending() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");
        let wal = WriteAheadLog::open(&wal_path).unwrap();

        for i in 0..20 {
            let seq = wal.log(set("main", "a", format!("v{i}").as_bytes())).unwrap();
            wal.commit(&[seq]).unwrap();
        }
        let kept = wal.log(set("feature", "b", b"staged")).unwrap();
        let before = std::fs::metadata(&wal_path).unwrap().len();

        wal.compact().unwrap();
        assert!(std::fs::metadata(&wal_path).unwrap().len() < before);

        let pending = wal.get_pending_entries().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].seq, kept);
        assert_eq!(wal.log(set("main", "c", b"c")).unwrap(), kept + 1);

        // Compaction survives a reopen.
        drop(wal);
        let wal = WriteAheadLog::open(&wal_path).unwrap();
        assert_eq!(wal.get_pending_entries().unwrap().len(), 2);
    }

    #[test]
    fn test_wal_clear() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path().join("test.wal")).unwrap();

        wal.log(set("main", "a", b"")).unwrap();
        assert!(wal.has_pending().unwrap());

        wal.clear().unwrap();
        assert!(!wal.has_pending().unwrap());

        let seq = wal.log(set("main", "after_clear", b"")).unwrap();
        assert_eq!(seq, 1);
    }
}
