//! Commit graph implementation.

use crate::commits::CommitLog;
use crate::error::{Result, StoreError};
use crate::index::PathIndex;
use crate::types::{CommitInfo, Hash, ModulePath, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// An immutable commit: a full path index snapshot plus lineage metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub hash: Hash,
    /// Empty for a root commit, two entries for a merge.
    pub parents: Vec<Hash>,
    pub date: Timestamp,
    pub author: String,
    pub message: String,
    pub index: PathIndex,
}

/// Everything a commit hash covers.
#[derive(Serialize)]
struct CommitBody<'a> {
    parents: &'a [Hash],
    date: Timestamp,
    author: &'a str,
    message: &'a str,
    index: &'a PathIndex,
}

impl Commit {
    /// Build a commit, deriving its hash from its content.
    pub fn new(
        parents: Vec<Hash>,
        index: PathIndex,
        author: impl Into<String>,
        message: impl Into<String>,
        date: Timestamp,
    ) -> Result<Self> {
        let author = author.into();
        let message = message.into();
        let body = CommitBody {
            parents: &parents,
            date,
            author: &author,
            message: &message,
            index: &index,
        };
        let hash = Hash::from_bytes(&rmp_serde::to_vec(&body)?);

        Ok(Self {
            hash,
            parents,
            date,
            author,
            message,
            index,
        })
    }

    /// Recompute the hash and compare it with the stored one.
    pub fn verify(&self) -> Result<()> {
        let rebuilt = Commit::new(
            self.parents.clone(),
            self.index.clone(),
            self.author.clone(),
            self.message.clone(),
            self.date,
        )?;
        if rebuilt.hash != self.hash {
            return Err(StoreError::HashMismatch {
                expected: self.hash,
                got: rebuilt.hash,
            });
        }
        Ok(())
    }

    pub fn info(&self) -> CommitInfo {
        CommitInfo {
            hash: self.hash,
            parents: self.parents.clone(),
            date: self.date.as_secs(),
            author: self.author.clone(),
            message: self.message.clone(),
        }
    }

    pub fn first_parent(&self) -> Option<Hash> {
        self.parents.first().copied()
    }
}

/// Hash-addressed arena of commits, persisted through a [`CommitLog`].
///
/// Commits are never mutated or removed, so history shared between
/// branches is shared here too.
pub struct CommitGraph {
    log: CommitLog,
    commits: RwLock<HashMap<Hash, Arc<Commit>>>,
}

impl CommitGraph {
    /// Open the graph, loading and verifying every logged commit.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (log, loaded) = CommitLog::open(path)?;

        let mut commits = HashMap::with_capacity(loaded.len());
        for commit in loaded {
            commit.verify()?;
            commits.insert(commit.hash, Arc::new(commit));
        }
        debug!(commits = commits.len(), "loaded commit graph");

        Ok(Self {
            log,
            commits: RwLock::new(commits),
        })
    }

    /// Create a commit. Identical content yields the identical, already
    /// stored commit.
    pub fn commit(
        &self,
        parents: Vec<Hash>,
        index: PathIndex,
        author: &str,
        message: &str,
        date: Timestamp,
    ) -> Result<Hash> {
        for parent in &parents {
            if !self.contains(parent) {
                return Err(StoreError::CommitNotFound(*parent));
            }
        }

        let commit = Commit::new(parents, index, author, message, date)?;
        let hash = commit.hash;

        let mut commits = self.commits.write();
        if commits.contains_key(&hash) {
            return Ok(hash);
        }
        self.log.append(&commit)?;
        commits.insert(hash, Arc::new(commit));

        debug!(commit = %hash, "created commit");
        Ok(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<Arc<Commit>> {
        self.commits.read().get(hash).cloned()
    }

    /// Fetch a commit or fail with `CommitNotFound`.
    pub fn require(&self, hash: &Hash) -> Result<Arc<Commit>> {
        self.get(hash).ok_or(StoreError::CommitNotFound(*hash))
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.commits.read().contains_key(hash)
    }

    pub fn info(&self, hash: &Hash) -> Result<CommitInfo> {
        Ok(self.require(hash)?.info())
    }

    pub fn len(&self) -> usize {
        self.commits.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.read().is_empty()
    }

    pub fn log_size(&self) -> u64 {
        self.log.size()
    }

    /// Breadth-first walk over `start` and all of its ancestors.
    ///
    /// Parents are visited in stored order and each commit is yielded once,
    /// so the sequence is deterministic.
    pub fn ancestors(&self, start: Hash) -> Ancestors<'_> {
        Ancestors::new(self, start)
    }

    /// Whether `ancestor` is `descendant` or reachable from it.
    pub fn is_ancestor(&self, ancestor: &Hash, descendant: &Hash) -> bool {
        self.ancestors(*descendant).any(|c| c.hash == *ancestor)
    }

    /// First commit reachable from `a` (breadth-first) that is also
    /// reachable from `b`.
    pub fn merge_base(&self, a: &Hash, b: &Hash) -> Option<Hash> {
        let reachable_from_b: HashSet<Hash> = self.ancestors(*b).map(|c| c.hash).collect();
        self.ancestors(*a)
            .map(|c| c.hash)
            .find(|hash| reachable_from_b.contains(hash))
    }

    /// Distinct contents `path` held anywhere in the history of `tip`,
    /// most recent first, each paired with the latest commit that
    /// introduced it (its value differs from every parent's).
    ///
    /// Recency follows [`CommitGraph::newest_first`], so the head is always
    /// the value at `tip` itself.
    pub fn versions(&self, tip: &Hash, path: &ModulePath) -> Vec<(Hash, Hash)> {
        let mut slots: Vec<(Hash, Option<Hash>)> = Vec::new();
        let mut position: HashMap<Hash, usize> = HashMap::new();

        for commit in self.newest_first(*tip) {
            let Some(value) = commit.index.lookup(path) else {
                continue;
            };
            let slot = *position.entry(value).or_insert_with(|| {
                slots.push((value, None));
                slots.len() - 1
            });
            if slots[slot].1.is_none() && self.introduces(&commit, path, value) {
                slots[slot].1 = Some(commit.hash);
            }
        }

        // Every held value is introduced by some ancestor, so nothing is
        // dropped here on a complete graph.
        slots
            .into_iter()
            .filter_map(|(value, commit)| commit.map(|commit| (value, commit)))
            .collect()
    }

    /// `start` and all of its ancestors, every commit before its parents.
    /// Among commits whose descendants are all emitted, the newest date
    /// goes first, ties broken by breadth-first walk order.
    pub fn newest_first(&self, start: Hash) -> Vec<Arc<Commit>> {
        let walked: Vec<Arc<Commit>> = self.ancestors(start).collect();
        let Some(first) = walked.first() else {
            return Vec::new();
        };
        let rank: HashMap<Hash, usize> = walked
            .iter()
            .enumerate()
            .map(|(i, commit)| (commit.hash, i))
            .collect();

        // Unemitted children per commit.
        let mut waiting = vec![0usize; walked.len()];
        for commit in &walked {
            for parent in &commit.parents {
                if let Some(&i) = rank.get(parent) {
                    waiting[i] += 1;
                }
            }
        }

        let mut ready = BinaryHeap::from([(first.date, Reverse(0usize))]);
        let mut ordered = Vec::with_capacity(walked.len());
        while let Some((_, Reverse(i))) = ready.pop() {
            let commit = Arc::clone(&walked[i]);
            for parent in &commit.parents {
                if let Some(&p) = rank.get(parent) {
                    waiting[p] -= 1;
                    if waiting[p] == 0 {
                        ready.push((walked[p].date, Reverse(p)));
                    }
                }
            }
            ordered.push(commit);
        }
        ordered
    }

    fn introduces(&self, commit: &Commit, path: &ModulePath, value: Hash) -> bool {
        commit.parents.iter().all(|parent| {
            self.get(parent)
                .map_or(true, |parent| parent.index.lookup(path) != Some(value))
        })
    }
}

/// Lazy, deterministic walk over commit ancestry.
pub struct Ancestors<'a> {
    graph: &'a CommitGraph,
    queue: VecDeque<Hash>,
    seen: HashSet<Hash>,
}

impl<'a> Ancestors<'a> {
    fn new(graph: &'a CommitGraph, start: Hash) -> Self {
        let mut seen = HashSet::new();
        seen.insert(start);
        Self {
            graph,
            queue: VecDeque::from([start]),
            seen,
        }
    }
}

impl Iterator for Ancestors<'_> {
    type Item = Arc<Commit>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(hash) = self.queue.pop_front() {
            let Some(commit) = self.graph.get(&hash) else {
                continue;
            };

            for parent in &commit.parents {
                if self.seen.insert(*parent) {
                    self.queue.push_back(*parent);
                }
            }

            return Some(commit);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn p(s: &str) -> ModulePath {
        ModulePath::parse(s).unwrap()
    }

    fn index(entries: &[(&str, &str)]) -> PathIndex {
        entries
            .iter()
            .map(|(path, content)| (p(path), Hash::from_bytes(content.as_bytes())))
            .collect()
    }

    fn graph(dir: &TempDir) -> CommitGraph {
        CommitGraph::open(dir.path().join("commits.log")).unwrap()
    }

    #[test]
    fn test_commit_hash_is_content_derived() {
        let a = Commit::new(vec![], index(&[("a", "1")]), "me", "msg", Timestamp(1)).unwrap();
        let b = Commit::new(vec![], index(&[("a", "1")]), "me", "msg", Timestamp(1)).unwrap();
        let c = Commit::new(vec![], index(&[("a", "2")]), "me", "msg", Timestamp(1)).unwrap();
        assert_eq!(a.hash, b.hash);
        assert_ne!(a.hash, c.hash);
        a.verify().unwrap();
    }

    #[test]
    fn test_identical_commits_deduplicate() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir);

        let first = graph
            .commit(vec![], index(&[("a", "1")]), "me", "init", Timestamp(1))
            .unwrap();
        let size = graph.log_size();
        let again = graph
            .commit(vec![], index(&[("a", "1")]), "me", "init", Timestamp(1))
            .unwrap();

        assert_eq!(first, again);
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.log_size(), size);
    }

    #[test]
    fn test_unknown_parent_rejected() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir);

        let missing = Hash::from_bytes(b"missing");
        let result = graph.commit(vec![missing], PathIndex::new(), "me", "x", Timestamp(1));
        assert!(matches!(result, Err(StoreError::CommitNotFound(_))));
    }

    #[test]
    fn test_ancestors_breadth_first() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir);

        let root = graph
            .commit(vec![], PathIndex::new(), "me", "root", Timestamp(1))
            .unwrap();
        let left = graph
            .commit(vec![root], index(&[("l", "1")]), "me", "left", Timestamp(2))
            .unwrap();
        let right = graph
            .commit(vec![root], index(&[("r", "1")]), "me", "right", Timestamp(3))
            .unwrap();
        let merge = graph
            .commit(vec![left, right], index(&[("l", "1"), ("r", "1")]), "me", "merge", Timestamp(4))
            .unwrap();

        let order: Vec<Hash> = graph.ancestors(merge).map(|c| c.hash).collect();
        assert_eq!(order, vec![merge, left, right, root]);

        assert!(graph.is_ancestor(&root, &merge));
        assert!(!graph.is_ancestor(&left, &right));
        assert_eq!(graph.merge_base(&left, &right), Some(root));
        assert_eq!(graph.merge_base(&merge, &right), Some(right));
    }

    #[test]
    fn test_versions_most_recent_first() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir);

        let c1 = graph
            .commit(vec![], index(&[("m", "v1")]), "me", "1", Timestamp(1))
            .unwrap();
        let c2 = graph
            .commit(vec![c1], index(&[("m", "v2")]), "me", "2", Timestamp(2))
            .unwrap();
        let c3 = graph
            .commit(vec![c2], index(&[("m", "v2"), ("other", "x")]), "me", "3", Timestamp(3))
            .unwrap();
        let c4 = graph
            .commit(vec![c3], index(&[("m", "v1")]), "me", "4", Timestamp(4))
            .unwrap();

        let v1 = Hash::from_bytes(b"v1");
        let v2 = Hash::from_bytes(b"v2");

        assert_eq!(graph.versions(&c4, &p("m")), vec![(v1, c4), (v2, c2)]);
        assert_eq!(graph.versions(&c3, &p("m")), vec![(v2, c2), (v1, c1)]);
        assert!(graph.versions(&c4, &p("absent")).is_empty());
    }

    #[test]
    fn test_versions_follow_merged_parents() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir);

        let base = graph
            .commit(vec![], index(&[("m", "v1")]), "me", "base", Timestamp(1))
            .unwrap();
        let edit2 = graph
            .commit(vec![base], index(&[("m", "v2")]), "me", "edit", Timestamp(2))
            .unwrap();
        let edit3 = graph
            .commit(vec![edit2], index(&[("m", "v3")]), "me", "edit", Timestamp(3))
            .unwrap();
        let merge = graph
            .commit(vec![base, edit3], index(&[("m", "v3")]), "me", "merge", Timestamp(4))
            .unwrap();

        let hash = |s: &str| Hash::from_bytes(s.as_bytes());
        assert_eq!(
            graph.versions(&merge, &p("m")),
            vec![(hash("v3"), edit3), (hash("v2"), edit2), (hash("v1"), base)]
        );
    }

    #[test]
    fn test_newest_first_keeps_children_before_parents() {
        let dir = TempDir::new().unwrap();
        let graph = graph(&dir);

        // Equal dates: ancestry alone decides.
        let root = graph
            .commit(vec![], index(&[("m", "a")]), "me", "root", Timestamp(5))
            .unwrap();
        let side = graph
            .commit(vec![root], index(&[("m", "b")]), "me", "side", Timestamp(5))
            .unwrap();
        let side2 = graph
            .commit(vec![side], index(&[("m", "c")]), "me", "side", Timestamp(5))
            .unwrap();
        let merge = graph
            .commit(vec![root, side2], index(&[("m", "c")]), "me", "merge", Timestamp(5))
            .unwrap();

        let order: Vec<Hash> = graph.newest_first(merge).iter().map(|c| c.hash).collect();
        assert_eq!(order, vec![merge, side2, side, root]);
        assert_eq!(graph.versions(&merge, &p("m"))[0].0, Hash::from_bytes(b"c"));
        assert!(graph.newest_first(Hash::from_bytes(b"unknown")).is_empty());
    }

    #[test]
    fn test_reopen_preserves_graph() {
        let dir = TempDir::new().unwrap();
        let (root, child) = {
            let graph = graph(&dir);
            let root = graph
                .commit(vec![], index(&[("a", "1")]), "me", "root", Timestamp(1))
                .unwrap();
            let child = graph
                .commit(vec![root], index(&[("a", "2")]), "me", "child", Timestamp(2))
                .unwrap();
            (root, child)
        };

        let graph = graph(&dir);
        assert_eq!(graph.len(), 2);
        let info = graph.info(&child).unwrap();
        assert_eq!(info.parents, vec![root]);
        assert_eq!(info.message, "child");
    }
}
