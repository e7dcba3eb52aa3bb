//! Module content storage implementation.

use crate::error::{Result, StoreError};
use crate::types::Hash;
use lru::LruCache;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Magic bytes for module files.
const MODULE_MAGIC: &[u8; 4] = b"MOD\0";

/// Current module file format version.
const MODULE_VERSION: u8 = 1;

/// Header size: magic + version + content length.
const HEADER_LEN: u64 = 4 + 1 + 8;

/// Content-addressed module storage.
pub struct BlobStorage {
    /// Base directory for module files.
    path: PathBuf,

    /// LRU cache for recently accessed modules.
    cache: Mutex<LruCache<Hash, Vec<u8>>>,

    /// Suffix counter for temporary files.
    tmp_counter: AtomicU64,
}

impl BlobStorage {
    /// Create a new content store at the given path.
    pub fn new(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let cache_size = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        Ok(Self {
            path,
            cache: Mutex::new(LruCache::new(cache_size)),
            tmp_counter: AtomicU64::new(0),
        })
    }

    /// Store module bytes, returning their hash.
    ///
    /// If the content already exists, this is a no-op and returns the existing hash.
    pub fn put(&self, content: &[u8]) -> Result<Hash> {
        let hash = Hash::from_bytes(content);

        if self.contains(&hash) {
            return Ok(hash);
        }

        let shard_dir = self.shard_path(&hash);
        fs::create_dir_all(&shard_dir)?;

        // Write to a private temp file, then rename into place so concurrent
        // writers of the same content never observe a partial file.
        let tmp_path = shard_dir.join(format!(
            "{}.tmp{}",
            hash.to_hex(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        let written = Self::write_module(&tmp_path, content)
            .and_then(|()| fs::rename(&tmp_path, self.module_path(&hash)).map_err(Into::into));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        debug!(hash = %hash, bytes = content.len(), "stored module");

        self.cache.lock().put(hash, content.to_vec());

        Ok(hash)
    }

    /// Get module bytes by hash.
    pub fn get(&self, hash: &Hash) -> Result<Option<Vec<u8>>> {
        if let Some(cached) = self.cache.lock().get(hash).cloned() {
            return Ok(Some(cached));
        }

        let module_path = self.module_path(hash);
        let mut file = match File::open(&module_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MODULE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid module magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != MODULE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported module version: {}",
                version[0]
            )));
        }

        let mut content_len_bytes = [0u8; 8];
        file.read_exact(&mut content_len_bytes)?;
        let content_len = u64::from_le_bytes(content_len_bytes);
        if content_len.saturating_add(HEADER_LEN + 4) != file.metadata()?.len() {
            return Err(StoreError::Corruption(format!(
                "Module {hash} length does not match its file"
            )));
        }

        let mut content = vec![0u8; content_len as usize];
        file.read_exact(&mut content)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&content);

        if stored_checksum != computed_checksum {
            warn!(hash = %hash, "module checksum mismatch");
            return Err(StoreError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        let computed_hash = Hash::from_bytes(&content);
        if &computed_hash != hash {
            return Err(StoreError::HashMismatch {
                expected: *hash,
                got: computed_hash,
            });
        }

        self.cache.lock().put(*hash, content.clone());

        Ok(Some(content))
    }

    /// Check if content exists.
    pub fn contains(&self, hash: &Hash) -> bool {
        if self.cache.lock().contains(hash) {
            return true;
        }
        self.module_path(hash).is_file()
    }

    /// Size of the stored content in bytes, if present.
    pub fn size(&self, hash: &Hash) -> Result<Option<u64>> {
        match fs::metadata(self.module_path(hash)) {
            Ok(meta) => Ok(Some(meta.len().saturating_sub(HEADER_LEN + 4))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete content (garbage collection only).
    pub fn delete(&self, hash: &Hash) -> Result<bool> {
        self.cache.lock().pop(hash);

        match fs::remove_file(self.module_path(hash)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// List all content hashes.
    pub fn list(&self) -> Result<Vec<Hash>> {
        let mut hashes = Vec::new();

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                for module_entry in fs::read_dir(entry.path())? {
                    let module_entry = module_entry?;
                    let filename = module_entry.file_name();
                    let filename_str = filename.to_string_lossy();
                    // Temp files carry a suffix and fail to parse.
                    if let Ok(hash) = Hash::from_hex(&filename_str) {
                        hashes.push(hash);
                    }
                }
            }
        }

        Ok(hashes)
    }

    /// Get total size of all stored files.
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0u64;

        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                for module_entry in fs::read_dir(entry.path())? {
                    let module_entry = module_entry?;
                    total += module_entry.metadata()?.len();
                }
            }
        }

        Ok(total)
    }

    fn write_module(path: &Path, content: &[u8]) -> Result<()> {
        let mut file = File::create(path)?;

        file.write_all(MODULE_MAGIC)?;
        file.write_all(&[MODULE_VERSION])?;

        let content_len = content.len() as u64;
        file.write_all(&content_len.to_le_bytes())?;
        file.write_all(content)?;

        let checksum = crc32fast::hash(content);
        file.write_all(&checksum.to_le_bytes())?;

        file.sync_all()?;
        Ok(())
    }

    fn shard_path(&self, hash: &Hash) -> PathBuf {
        self.path.join(hash.shard_prefix())
    }

    fn module_path(&self, hash: &Hash) -> PathBuf {
        self.shard_path(hash).join(hash.to_hex())
    }
}
