//! Main Store struct tying all components together.

use crate::auth::AuthConfig;
use crate::blobs::BlobStorage;
use crate::branches::{three_way, BranchManager, BranchState, DEFAULT_BRANCH};
use crate::commits::CommitGraph;
use crate::error::{Result, StoreError};
use crate::index::PathIndex;
use crate::subscriptions::{
    DropReason, StoreEvent, SubscriptionConfig, SubscriptionHandle, SubscriptionId,
    SubscriptionManager,
};
use crate::types::{
    Branch, CommitInfo, GcStats, Hash, MergeOutcome, ModulePath, StoreStats, Timestamp,
    Version,
};
use crate::wal::{WalOperation, WriteAheadLog};
use fs2::FileExt;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Base path for the store.
    pub path: PathBuf,

    /// Module cache size (number of modules).
    pub blob_cache_size: usize,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// Branch used when a request names none. Cannot be deleted.
    pub default_branch: String,

    /// Author recorded on commits made without an explicit one.
    pub author: String,

    /// Token table for the request API.
    pub auth: AuthConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./wasmstore"),
            blob_cache_size: 1000,
            create_if_missing: true,
            default_branch: DEFAULT_BRANCH.to_string(),
            author: "wasmstore".to_string(),
            auth: AuthConfig::default(),
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"WMS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// The versioned module store.
///
/// Provides a unified interface for:
/// - Storing modules by content hash
/// - Staging path changes per branch and snapshotting them into commits
/// - Navigating history (versions, restore, rollback)
/// - Creating, deleting and merging branches
/// - Sweeping unreachable content
///
/// Every store-facing call names its branch explicitly.
pub struct Store {
    /// Store configuration.
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    /// Module content.
    blobs: BlobStorage,

    /// Commit arena and log.
    commits: CommitGraph,

    /// Branch manager.
    branches: BranchManager,

    /// Staged mutations not yet captured by a commit.
    wal: WriteAheadLog,

    /// Watch feed.
    subscriptions: SubscriptionManager,

    /// Mutations hold this shared; GC holds it exclusively so it sees a
    /// consistent cut of every tip and working index.
    gc_lock: RwLock<()>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create a new store.
    #[instrument(skip(config), fields(path = %config.path.display()))]
    pub fn create(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        fs::create_dir_all(config.path.join("objects"))?;

        Self::write_manifest(&config.path)?;

        let lock_file = Self::acquire_lock(&config.path)?;

        let store = Self::assemble(config, lock_file)?;
        info!("created store");
        Ok(store)
    }

    /// Open an existing store, replaying any staged changes from the WAL.
    #[instrument(skip(config), fields(path = %config.path.display()))]
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;

        let lock_file = Self::acquire_lock(&config.path)?;

        let store = Self::assemble(config, lock_file)?;
        store.replay_wal()?;
        info!(
            branches = store.branches.len(),
            commits = store.commits.len(),
            "opened store"
        );
        Ok(store)
    }

    fn assemble(config: StoreConfig, lock_file: File) -> Result<Self> {
        let blobs = BlobStorage::new(config.path.join("objects"), config.blob_cache_size)?;
        let commits = CommitGraph::open(config.path.join("commits.log"))?;
        let branches = BranchManager::load(
            config.path.join("branches.bin"),
            &config.default_branch,
            &commits,
        )?;
        let wal = WriteAheadLog::open(config.path.join("staging.wal"))?;

        Ok(Self {
            config,
            _lock_file: lock_file,
            blobs,
            commits,
            branches,
            wal,
            subscriptions: SubscriptionManager::new(),
            gc_lock: RwLock::new(()),
        })
    }

    /// Rebuild working indexes from pending WAL entries.
    fn replay_wal(&self) -> Result<()> {
        let pending = self.wal.get_pending_entries()?;
        if pending.is_empty() {
            return self.wal.clear();
        }

        let mut replayed = 0usize;
        let mut orphaned = Vec::new();
        for entry in pending {
            let Ok(handle) = self.branches.get(entry.operation.branch()) else {
                orphaned.push(entry.seq);
                continue;
            };
            let mut state = handle.lock();
            entry.operation.apply_to(&mut state.working);
            state.pending.push(entry.seq);
            replayed += 1;
        }

        if !orphaned.is_empty() {
            warn!(
                entries = orphaned.len(),
                "discarding staged changes for missing branches"
            );
            self.wal.commit(&orphaned)?;
        }
        info!(entries = replayed, "replayed staged changes");
        Ok(())
    }

    // --- Module Operations ---

    /// Store `bytes` and point `path` at them on `branch`.
    #[instrument(skip(self, bytes), fields(len = bytes.len()))]
    pub fn add(&self, branch: &str, path: &ModulePath, bytes: &[u8]) -> Result<Hash> {
        Self::require_module_path(path)?;
        let _gc = self.gc_lock.read();

        let hash = self.blobs.put(bytes)?;
        self.stage(
            branch,
            WalOperation::Set {
                branch: branch.to_string(),
                path: path.clone(),
                hash,
            },
        )?;
        debug!(%hash, "added module");
        Ok(hash)
    }

    /// Point `path` at content that is already stored.
    pub fn set_hash(&self, branch: &str, path: &ModulePath, hash: Hash) -> Result<()> {
        Self::require_module_path(path)?;
        let _gc = self.gc_lock.read();

        if !self.blobs.contains(&hash) {
            return Err(StoreError::ContentNotFound(hash));
        }
        self.stage(
            branch,
            WalOperation::Set {
                branch: branch.to_string(),
                path: path.clone(),
                hash,
            },
        )
    }

    /// Module bytes and hash at `path`, staged changes included.
    pub fn find(&self, branch: &str, path: &ModulePath) -> Result<Option<(Vec<u8>, Hash)>> {
        let Some(hash) = self.hash(branch, path)? else {
            return Ok(None);
        };
        let bytes = self
            .blobs
            .get(&hash)?
            .ok_or(StoreError::ContentNotFound(hash))?;
        Ok(Some((bytes, hash)))
    }

    /// Module bytes by content hash, regardless of any path.
    pub fn find_by_hash(&self, hash: &Hash) -> Result<Option<Vec<u8>>> {
        self.blobs.get(hash)
    }

    /// Content hash at `path`.
    pub fn hash(&self, branch: &str, path: &ModulePath) -> Result<Option<Hash>> {
        let handle = self.branches.get(branch)?;
        let state = handle.lock();
        Ok(state.working.lookup(path))
    }

    pub fn contains(&self, branch: &str, path: &ModulePath) -> Result<bool> {
        Ok(self.hash(branch, path)?.is_some())
    }

    /// Whether content with this hash is stored.
    pub fn contains_hash(&self, hash: &Hash) -> bool {
        self.blobs.contains(hash)
    }

    /// Remove `path`. Returns false if it was not present.
    pub fn remove(&self, branch: &str, path: &ModulePath) -> Result<bool> {
        let _gc = self.gc_lock.read();
        let handle = self.branches.get(branch)?;
        let mut state = handle.lock();
        state.ensure_live()?;

        if !state.working.contains(path) {
            return Ok(false);
        }
        self.stage_locked(
            &mut state,
            WalOperation::Remove {
                branch: branch.to_string(),
                path: path.clone(),
            },
        )?;
        Ok(true)
    }

    /// Every module at or below `prefix`.
    pub fn list(&self, branch: &str, prefix: &ModulePath) -> Result<BTreeMap<ModulePath, Hash>> {
        let handle = self.branches.get(branch)?;
        let state = handle.lock();
        Ok(state.working.entries_under(prefix))
    }

    /// Immediate children of `prefix`.
    pub fn list_children(&self, branch: &str, prefix: &ModulePath) -> Result<Vec<ModulePath>> {
        let handle = self.branches.get(branch)?;
        let state = handle.lock();
        Ok(state.working.list_children(prefix).into_iter().collect())
    }

    // --- History Operations ---

    /// Commit the branch's staged state with the configured author.
    pub fn snapshot(&self, branch: &str) -> Result<Hash> {
        let author = self.config.author.clone();
        self.snapshot_with(branch, &author, "snapshot")
    }

    /// Commit the branch's staged state.
    ///
    /// With nothing staged the current tip is returned unchanged. A branch
    /// without commits always gets a root commit.
    #[instrument(skip(self))]
    pub fn snapshot_with(&self, branch: &str, author: &str, message: &str) -> Result<Hash> {
        let _gc = self.gc_lock.read();
        let handle = self.branches.get(branch)?;
        let mut state = handle.lock();
        state.ensure_live()?;
        self.snapshot_locked(&mut state, author, message)
    }

    /// Replace the subtree at `path` (the whole index for the root path)
    /// with its contents in `commit`. The result is staged.
    #[instrument(skip(self))]
    pub fn restore(&self, branch: &str, commit: &Hash, path: &ModulePath) -> Result<()> {
        let _gc = self.gc_lock.read();
        let commit = self.commits.require(commit)?;

        let handle = self.branches.get(branch)?;
        let mut state = handle.lock();
        state.ensure_live()?;
        self.stage_locked(
            &mut state,
            WalOperation::Replace {
                branch: branch.to_string(),
                prefix: path.clone(),
                entries: commit.index.entries_under(path).into_iter().collect(),
            },
        )
    }

    /// Restore `path` to its state in the tip's first parent. Rolling back
    /// a root commit restores to empty.
    #[instrument(skip(self))]
    pub fn rollback(&self, branch: &str, path: &ModulePath) -> Result<()> {
        let _gc = self.gc_lock.read();
        let handle = self.branches.get(branch)?;
        let mut state = handle.lock();
        state.ensure_live()?;

        let tip = state
            .tip
            .ok_or_else(|| StoreError::NoCommits(branch.to_string()))?;
        let previous = match self.commits.require(&tip)?.first_parent() {
            Some(parent) => self.commits.require(&parent)?.index.entries_under(path),
            None => BTreeMap::new(),
        };

        self.stage_locked(
            &mut state,
            WalOperation::Replace {
                branch: branch.to_string(),
                prefix: path.clone(),
                entries: previous.into_iter().collect(),
            },
        )
    }

    /// Merge `source` into `target`.
    ///
    /// Staged changes on the source are snapshotted first; staged changes
    /// on the target are included in the merge commit. Where both sides
    /// changed a path since their merge base, the source wins.
    #[instrument(skip(self))]
    pub fn merge(&self, source: &str, target: &str) -> Result<MergeOutcome> {
        if source == target {
            self.branches.get(source)?;
            return Ok(MergeOutcome::UpToDate);
        }

        let _gc = self.gc_lock.read();
        let source_handle = self.branches.get(source)?;
        let target_handle = self.branches.get(target)?;

        // Lock in name order.
        let (mut source_state, mut target_state) = if source < target {
            let s = source_handle.lock();
            (s, target_handle.lock())
        } else {
            let t = target_handle.lock();
            (source_handle.lock(), t)
        };
        source_state.ensure_live()?;
        target_state.ensure_live()?;

        if self.is_dirty(&source_state)? {
            let author = self.config.author.clone();
            let message = format!("snapshot before merge into {target}");
            self.snapshot_locked(&mut source_state, &author, &message)?;
        }
        let Some(source_tip) = source_state.tip else {
            return Ok(MergeOutcome::UpToDate);
        };

        if let Some(target_tip) = target_state.tip {
            if self.commits.is_ancestor(&source_tip, &target_tip) {
                debug!("source already contained in target");
                return Ok(MergeOutcome::UpToDate);
            }
        }

        let base = match target_state.tip {
            Some(target_tip) => match self.commits.merge_base(&target_tip, &source_tip) {
                Some(base) => self.commits.require(&base)?.index.clone(),
                None => PathIndex::new(),
            },
            None => PathIndex::new(),
        };
        let theirs = self.commits.require(&source_tip)?;
        let merged = three_way(&base, &target_state.working, &theirs.index);

        let parents: Vec<Hash> = target_state
            .tip
            .into_iter()
            .chain(std::iter::once(source_tip))
            .collect();
        let commit = self.commits.commit(
            parents,
            merged.clone(),
            &self.config.author,
            &format!("merge {source} into {target}"),
            Timestamp::now(),
        )?;

        let changes = target_state
            .working
            .replace_subtree(&ModulePath::root(), &merged);
        self.advance_tip(&mut target_state, commit)?;

        for change in changes {
            self.subscriptions.broadcast(change_event(target, change));
        }
        info!(%commit, "merged");
        Ok(MergeOutcome::Merged(commit))
    }

    /// Distinct contents of `path`, most recent first.
    ///
    /// The head is always the current value: content staged but not yet
    /// snapshotted leads with no commit attached.
    pub fn versions(&self, branch: &str, path: &ModulePath) -> Result<Vec<Version>> {
        let (tip, staged) = {
            let handle = self.branches.get(branch)?;
            let state = handle.lock();
            (state.tip, state.working.lookup(path))
        };

        let mut versions: Vec<Version> = match tip {
            Some(tip) => self
                .commits
                .versions(&tip, path)
                .into_iter()
                .map(|(content, commit)| Version {
                    content,
                    commit: Some(commit),
                })
                .collect(),
            None => Vec::new(),
        };

        if let Some(content) = staged {
            if versions.first().map(|v| v.content) != Some(content) {
                versions.retain(|v| v.content != content);
                versions.insert(
                    0,
                    Version {
                        content,
                        commit: None,
                    },
                );
            }
        }
        Ok(versions)
    }

    pub fn commit_info(&self, hash: &Hash) -> Result<CommitInfo> {
        self.commits.info(hash)
    }

    /// Walk the ancestry of a branch tip, newest first (breadth-first).
    pub fn history(&self, branch: &str) -> Result<Vec<CommitInfo>> {
        let tip = self.branch(branch)?.tip;
        Ok(match tip {
            Some(tip) => self.commits.ancestors(tip).map(|c| c.info()).collect(),
            None => Vec::new(),
        })
    }

    // --- Branch Operations ---

    /// Create `name` at the tip of `from` (the default branch when `None`).
    /// Staged changes on `from` are not carried over.
    #[instrument(skip(self))]
    pub fn create_branch(&self, name: &str, from: Option<&str>) -> Result<Branch> {
        let _gc = self.gc_lock.read();
        let from = from.unwrap_or(self.branches.default_branch());

        let tip = self.branches.get(from)?.lock().tip;
        let working = match tip {
            Some(tip) => self.commits.require(&tip)?.index.clone(),
            None => PathIndex::new(),
        };

        let branch = self.branches.create(name, tip, working)?;
        self.subscriptions.broadcast(StoreEvent::BranchCreated {
            name: name.to_string(),
            tip,
        });
        Ok(branch)
    }

    /// Delete a branch and discard its staged changes.
    #[instrument(skip(self))]
    pub fn delete_branch(&self, name: &str) -> Result<()> {
        let _gc = self.gc_lock.read();
        let handle = self.branches.remove(name)?;

        {
            let mut state = handle.lock();
            state.deleted = true;
            let pending = std::mem::take(&mut state.pending);
            self.wal.commit(&pending)?;
        }

        self.subscriptions.broadcast(StoreEvent::BranchDeleted {
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn branch(&self, name: &str) -> Result<Branch> {
        Ok(self.branches.get(name)?.lock().branch())
    }

    /// All branches, sorted by name.
    pub fn branches(&self) -> Vec<Branch> {
        self.branches.list()
    }

    pub fn branch_names(&self) -> Vec<String> {
        self.branches.names()
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        self.branches.exists(name)
    }

    pub fn default_branch(&self) -> &str {
        self.branches.default_branch()
    }

    // --- Maintenance ---

    /// Delete every stored module not reachable from a branch's history or
    /// working index.
    #[instrument(skip(self))]
    pub fn gc(&self) -> Result<GcStats> {
        let started = Instant::now();
        let _gc = self.gc_lock.write();

        let mut live: HashSet<Hash> = HashSet::new();
        let mut visited: HashSet<Hash> = HashSet::new();

        for handle in self.branches.handles() {
            let state = handle.lock();
            live.extend(state.working.hashes().copied());

            if let Some(tip) = state.tip {
                for commit in self.commits.ancestors(tip) {
                    if visited.insert(commit.hash) {
                        live.extend(commit.index.hashes().copied());
                    }
                }
            }
        }

        let mut stats = GcStats::default();
        for hash in self.blobs.list()? {
            stats.examined += 1;
            if live.contains(&hash) {
                continue;
            }
            let size = self.blobs.size(&hash)?.unwrap_or(0);
            if self.blobs.delete(&hash)? {
                stats.deleted += 1;
                stats.bytes_reclaimed += size;
            }
        }
        // Nothing can stage while the lock is held, so this is a safe point
        // to drop settled entries.
        self.wal.compact()?;
        stats.duration_ms = started.elapsed().as_millis() as u64;

        info!(
            examined = stats.examined,
            deleted = stats.deleted,
            bytes = stats.bytes_reclaimed,
            "gc complete"
        );
        Ok(stats)
    }

    /// Subscribe to store events.
    pub fn watch(&self, config: SubscriptionConfig) -> SubscriptionHandle {
        self.subscriptions.subscribe(config)
    }

    pub fn unwatch(&self, id: SubscriptionId) {
        self.subscriptions.unsubscribe(id);
    }

    /// Get store statistics.
    pub fn stats(&self) -> Result<StoreStats> {
        Ok(StoreStats {
            module_count: self.blobs.list()?.len() as u64,
            commit_count: self.commits.len() as u64,
            branch_count: self.branches.len() as u64,
            content_size_bytes: self.blobs.total_size()?,
            commit_log_bytes: self.commits.log_size(),
        })
    }

    /// Sync all data to disk and compact the WAL.
    pub fn sync(&self) -> Result<()> {
        let _gc = self.gc_lock.write();
        self.branches.save()?;
        self.wal.compact()
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn auth(&self) -> &AuthConfig {
        &self.config.auth
    }

    // --- Internals ---

    fn stage(&self, branch: &str, operation: WalOperation) -> Result<()> {
        let handle = self.branches.get(branch)?;
        let mut state = handle.lock();
        state.ensure_live()?;
        self.stage_locked(&mut state, operation)
    }

    /// Log then apply one mutation. Caller holds the GC read lock and the
    /// branch lock.
    fn stage_locked(&self, state: &mut BranchState, operation: WalOperation) -> Result<()> {
        let seq = self.wal.log(operation.clone())?;
        state.pending.push(seq);

        for change in operation.apply_to(&mut state.working) {
            self.subscriptions.broadcast(change_event(&state.name, change));
        }
        Ok(())
    }

    fn snapshot_locked(&self, state: &mut BranchState, author: &str, message: &str) -> Result<Hash> {
        if let Some(tip) = state.tip {
            if !self.is_dirty(state)? {
                // Settle entries whose effect the tip already holds.
                let pending = std::mem::take(&mut state.pending);
                self.wal.commit(&pending)?;
                return Ok(tip);
            }
        }

        let commit = self.commits.commit(
            state.tip.into_iter().collect(),
            state.working.clone(),
            author,
            message,
            Timestamp::now(),
        )?;
        self.advance_tip(state, commit)?;

        info!(branch = %state.name, %commit, "snapshot");
        Ok(commit)
    }

    /// Move the tip, persist it, then retire the staged entries it covers.
    fn advance_tip(&self, state: &mut BranchState, commit: Hash) -> Result<()> {
        state.tip = Some(commit);
        self.branches.record_tip(&state.name, state.tip)?;

        let pending = std::mem::take(&mut state.pending);
        self.wal.commit(&pending)?;

        self.subscriptions.broadcast(StoreEvent::Committed {
            branch: state.name.clone(),
            commit,
        });
        Ok(())
    }

    fn is_dirty(&self, state: &BranchState) -> Result<bool> {
        Ok(match state.tip {
            Some(tip) => self.commits.require(&tip)?.index != state.working,
            None => !state.working.is_empty(),
        })
    }

    fn require_module_path(path: &ModulePath) -> Result<()> {
        if path.is_root() {
            return Err(StoreError::InvalidPath("/".into()));
        }
        Ok(())
    }

    fn write_manifest(path: &Path) -> Result<()> {
        use std::io::Write;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::create(manifest_path)?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        use std::io::Read;

        let manifest_path = path.join("MANIFEST");
        let mut file = File::open(manifest_path).map_err(|_| StoreError::NotInitialized)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_path = path.join("LOCK");
        let lock_file = File::create(lock_path)?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
        self.subscriptions.close_all(DropReason::Closed);
    }
}

fn change_event(branch: &str, (path, hash): (ModulePath, Option<Hash>)) -> StoreEvent {
    let branch = branch.to_string();
    match hash {
        Some(hash) => StoreEvent::Updated { branch, path, hash },
        None => StoreEvent::Removed { branch, path },
    }
}
