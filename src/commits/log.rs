//! Append-only commit log.

use crate::commits::Commit;
use crate::error::{Result, StoreError};
use memmap2::Mmap;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic bytes for the commit log.
const LOG_MAGIC: &[u8; 4] = b"CMT\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// Header size: magic + version.
const HEADER_LEN: u64 = 5;

/// Sanity limit for a single encoded commit.
const MAX_ENTRY_LEN: usize = 256 * 1024 * 1024;

/// Append-only log of commits.
///
/// Each entry is `len (u32 LE) | MessagePack commit | crc32 (u32 LE)`.
pub struct CommitLog {
    path: PathBuf,

    /// Write handle and the offset the next entry lands at.
    file: Mutex<(File, u64)>,
}

impl CommitLog {
    /// Open or create a commit log, returning every commit it holds in
    /// append order.
    ///
    /// A torn entry at the tail (crash mid-append) is truncated away.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Vec<Commit>)> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        if file.metadata()?.len() == 0 {
            file.write_all(LOG_MAGIC)?;
            file.write_all(&[LOG_VERSION])?;
            file.sync_all()?;
        }

        let (commits, end) = Self::scan(&file)?;

        let len = file.metadata()?.len();
        if end < len {
            warn!(
                path = %path.display(),
                dropped_bytes = len - end,
                "truncating torn commit log tail"
            );
            file.set_len(end)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(end))?;

        Ok((
            Self {
                path,
                file: Mutex::new((file, end)),
            },
            commits,
        ))
    }

    /// Append a commit and fsync.
    pub fn append(&self, commit: &Commit) -> Result<()> {
        let encoded = rmp_serde::to_vec(commit)?;
        let checksum = crc32fast::hash(&encoded);

        let mut guard = self.file.lock();
        let (file, offset) = &mut *guard;
        file.seek(SeekFrom::Start(*offset))?;
        file.write_all(&(encoded.len() as u32).to_le_bytes())?;
        file.write_all(&encoded)?;
        file.write_all(&checksum.to_le_bytes())?;
        file.sync_all()?;

        *offset += 4 + encoded.len() as u64 + 4;
        Ok(())
    }

    /// Current file size.
    pub fn size(&self) -> u64 {
        self.file.lock().1
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decode every complete entry. Returns the commits and the offset just
    /// past the last good entry.
    fn scan(file: &File) -> Result<(Vec<Commit>, u64)> {
        // SAFETY: the store holds an exclusive lock on its directory, so no
        // other process mutates the file while it is mapped.
        let map = unsafe { Mmap::map(file)? };

        if map.len() < HEADER_LEN as usize || &map[0..4] != LOG_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid commit log magic".into()));
        }
        if map[4] != LOG_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported commit log version: {}",
                map[4]
            )));
        }

        let mut commits = Vec::new();
        let mut pos = HEADER_LEN as usize;

        while pos + 4 <= map.len() {
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&map[pos..pos + 4]);
            let len = u32::from_le_bytes(len_bytes) as usize;

            if len > MAX_ENTRY_LEN {
                return Err(StoreError::Corruption("Commit log entry too large".into()));
            }

            let body_start = pos + 4;
            let body_end = body_start + len;
            if body_end + 4 > map.len() {
                break;
            }

            let encoded = &map[body_start..body_end];
            let mut checksum_bytes = [0u8; 4];
            checksum_bytes.copy_from_slice(&map[body_end..body_end + 4]);
            let stored_checksum = u32::from_le_bytes(checksum_bytes);
            let computed_checksum = crc32fast::hash(encoded);

            if stored_checksum != computed_checksum {
                // Only the final entry may be torn; anything earlier is damage.
                if body_end + 4 == map.len() {
                    break;
                }
                return Err(StoreError::ChecksumMismatch {
                    expected: stored_checksum,
                    got: computed_checksum,
                });
            }

            commits.push(rmp_serde::from_slice(encoded)?);
            pos = body_end + 4;
        }

        Ok((commits, pos as u64))
    }
}
