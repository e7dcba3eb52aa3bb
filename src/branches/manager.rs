//! Branch manager implementation.

use crate::commits::CommitGraph;
use crate::error::{Result, StoreError};
use crate::index::PathIndex;
use crate::types::{Branch, Hash, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Magic bytes for branch table file.
const BRANCH_TABLE_MAGIC: &[u8; 4] = b"BRT\0";

/// Current branch table format version.
const BRANCH_TABLE_VERSION: u8 = 1;

/// Bytes around the encoded table: magic, version, length, checksum.
const BRANCH_TABLE_FRAMING: u64 = 4 + 1 + 8 + 4;

/// Name of the default branch when none is configured.
pub const DEFAULT_BRANCH: &str = "main";

/// Live state of one branch.
///
/// Held behind its own mutex; every staged mutation and every snapshot of
/// the branch takes it for the duration of that single operation.
#[derive(Debug)]
pub struct BranchState {
    pub name: String,
    pub tip: Option<Hash>,
    /// Working index: the tip's index plus staged mutations.
    pub working: PathIndex,
    pub created: Timestamp,
    /// WAL sequence numbers of staged mutations not yet snapshotted.
    pub pending: Vec<u64>,
    /// Set once the branch is removed from the table; handles obtained
    /// before the deletion must not keep mutating it.
    pub deleted: bool,
}

impl BranchState {
    pub fn branch(&self) -> Branch {
        Branch {
            name: self.name.clone(),
            tip: self.tip,
            created: self.created,
        }
    }

    /// Fail with `BranchNotFound` if the branch was deleted under us.
    pub fn ensure_live(&self) -> Result<()> {
        if self.deleted {
            return Err(StoreError::BranchNotFound(self.name.clone()));
        }
        Ok(())
    }
}

pub type BranchHandle = Arc<Mutex<BranchState>>;

/// Persisted part of a branch.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct BranchRecord {
    tip: Option<Hash>,
    created: Timestamp,
}

/// Branch table stored on disk.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct BranchTable {
    default_branch: String,
    branches: BTreeMap<String, BranchRecord>,
}

/// Manages named branches.
///
/// Lock order: the table lock is never held while waiting on a branch
/// lock, and the record lock is always taken last.
pub struct BranchManager {
    /// Path to branch table file.
    path: PathBuf,

    default_branch: String,

    branches: RwLock<HashMap<String, BranchHandle>>,

    /// Mirror of what is on disk, updated on every tip move.
    records: Mutex<BranchTable>,
}

impl BranchManager {
    /// Load the branch table, creating the default branch if missing.
    ///
    /// Working indexes start out as their tip's committed index; staged
    /// changes are replayed from the WAL by the store afterwards.
    pub fn load(
        path: impl AsRef<Path>,
        default_branch: &str,
        commits: &CommitGraph,
    ) -> Result<Self> {
        validate_name(default_branch)?;
        let path = path.as_ref().to_path_buf();

        let mut table = if path.exists() {
            Self::read_table(&path)?
        } else {
            BranchTable::default()
        };
        table.default_branch = default_branch.to_string();

        let created_default = !table.branches.contains_key(default_branch);
        if created_default {
            table.branches.insert(
                default_branch.to_string(),
                BranchRecord {
                    tip: None,
                    created: Timestamp::now(),
                },
            );
        }

        let mut branches = HashMap::with_capacity(table.branches.len());
        for (name, record) in &table.branches {
            let working = match record.tip {
                Some(tip) => commits.require(&tip)?.index.clone(),
                None => PathIndex::new(),
            };
            branches.insert(
                name.clone(),
                Arc::new(Mutex::new(BranchState {
                    name: name.clone(),
                    tip: record.tip,
                    working,
                    created: record.created,
                    pending: Vec::new(),
                    deleted: false,
                })),
            );
        }

        let manager = Self {
            path,
            default_branch: default_branch.to_string(),
            branches: RwLock::new(branches),
            records: Mutex::new(table),
        };

        if created_default {
            manager.save()?;
        }

        debug!(branches = manager.len(), "loaded branch table");
        Ok(manager)
    }

    pub fn default_branch(&self) -> &str {
        &self.default_branch
    }

    /// Get the handle for a branch.
    pub fn get(&self, name: &str) -> Result<BranchHandle> {
        self.branches
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::BranchNotFound(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.branches.read().contains_key(name)
    }

    /// Register a new branch starting at `tip` with the given working index.
    pub fn create(&self, name: &str, tip: Option<Hash>, working: PathIndex) -> Result<Branch> {
        validate_name(name)?;

        let mut branches = self.branches.write();
        if branches.contains_key(name) {
            return Err(StoreError::BranchExists(name.to_string()));
        }

        let state = BranchState {
            name: name.to_string(),
            tip,
            working,
            created: Timestamp::now(),
            pending: Vec::new(),
            deleted: false,
        };
        let branch = state.branch();

        {
            let mut records = self.records.lock();
            records.branches.insert(
                name.to_string(),
                BranchRecord {
                    tip,
                    created: state.created,
                },
            );
            self.write_table(&records)?;
        }

        branches.insert(name.to_string(), Arc::new(Mutex::new(state)));
        info!(branch = name, "created branch");
        Ok(branch)
    }

    /// Remove a branch from the table, returning its handle.
    ///
    /// The default branch cannot be deleted. The caller marks the returned
    /// state deleted and settles its staged changes.
    pub fn remove(&self, name: &str) -> Result<BranchHandle> {
        if name == self.default_branch {
            return Err(StoreError::ProtectedBranch(name.to_string()));
        }

        let mut branches = self.branches.write();
        if !branches.contains_key(name) {
            return Err(StoreError::BranchNotFound(name.to_string()));
        }

        {
            let mut records = self.records.lock();
            records.branches.remove(name);
            self.write_table(&records)?;
        }

        let handle = branches
            .remove(name)
            .ok_or_else(|| StoreError::BranchNotFound(name.to_string()))?;
        info!(branch = name, "deleted branch");
        Ok(handle)
    }

    /// Persist a tip move. Called with the branch lock held.
    pub fn record_tip(&self, name: &str, tip: Option<Hash>) -> Result<()> {
        let mut records = self.records.lock();
        match records.branches.get_mut(name) {
            Some(record) => record.tip = tip,
            // Deleted concurrently; nothing left to persist.
            None => return Ok(()),
        }
        self.write_table(&records)
    }

    /// Branch names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.branches.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// All branch handles, sorted by name (the lock order).
    pub fn handles(&self) -> Vec<BranchHandle> {
        let branches = self.branches.read();
        let mut entries: Vec<(&String, &BranchHandle)> = branches.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    /// Metadata of every branch, sorted by name.
    pub fn list(&self) -> Vec<Branch> {
        self.handles().iter().map(|h| h.lock().branch()).collect()
    }

    pub fn len(&self) -> usize {
        self.branches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.read().is_empty()
    }

    /// Save the branch table to file.
    pub fn save(&self) -> Result<()> {
        let records = self.records.lock();
        self.write_table(&records)
    }

    fn write_table(&self, table: &BranchTable) -> Result<()> {
        let encoded = rmp_serde::to_vec(table)?;

        // Write to a sibling and rename so a crash never leaves a torn table.
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)?;

            file.write_all(BRANCH_TABLE_MAGIC)?;
            file.write_all(&[BRANCH_TABLE_VERSION])?;
            file.write_all(&(encoded.len() as u64).to_le_bytes())?;
            file.write_all(&encoded)?;
            file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn read_table(path: &Path) -> Result<BranchTable> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != BRANCH_TABLE_MAGIC {
            return Err(StoreError::InvalidFormat(
                "Invalid branch table magic".into(),
            ));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != BRANCH_TABLE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported branch table version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);
        if len.saturating_add(BRANCH_TABLE_FRAMING) != file.metadata()?.len() {
            return Err(StoreError::Corruption(
                "Branch table length does not match its file".into(),
            ));
        }

        let mut encoded = vec![0u8; len as usize];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(StoreError::ChecksumMismatch { expected, got });
        }

        Ok(rmp_serde::from_slice(&encoded)?)
    }
}

/// Branch names are non-empty and limited to `[A-Za-z0-9._-]`.
pub fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidBranchName(name.to_string()))
    }
}
