//! Path index implementation.

use crate::types::{Hash, ModulePath};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

/// Mapping from module path to content hash.
///
/// Backed by an ordered map so iteration, serialization and therefore
/// commit hashes are deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathIndex {
    entries: BTreeMap<ModulePath, Hash>,
}

impl PathIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve the content currently stored at `path`.
    pub fn lookup(&self, path: &ModulePath) -> Option<Hash> {
        self.entries.get(path).copied()
    }

    /// Record a mapping, returning the previous hash if any.
    pub fn set(&mut self, path: ModulePath, hash: Hash) -> Option<Hash> {
        self.entries.insert(path, hash)
    }

    /// Delete a mapping. Returns false if the path was absent.
    pub fn remove(&mut self, path: &ModulePath) -> bool {
        self.entries.remove(path).is_some()
    }

    pub fn contains(&self, path: &ModulePath) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Immediate children of `prefix`, one level deep.
    ///
    /// A child is returned whether it is itself a module or a directory
    /// containing modules further down.
    pub fn list_children(&self, prefix: &ModulePath) -> BTreeSet<ModulePath> {
        let depth = prefix.len() + 1;
        self.under(prefix)
            .filter(|(path, _)| path.len() >= depth)
            .map(|(path, _)| path.truncate(depth))
            .collect()
    }

    /// Every entry at or below `prefix`, recursively.
    pub fn entries_under(&self, prefix: &ModulePath) -> BTreeMap<ModulePath, Hash> {
        self.under(prefix)
            .map(|(path, hash)| (path.clone(), *hash))
            .collect()
    }

    /// Replace everything at or below `prefix` with the matching entries of `source`.
    ///
    /// Returns the paths whose value changed, with their new value.
    pub fn replace_subtree(
        &mut self,
        prefix: &ModulePath,
        source: &PathIndex,
    ) -> Vec<(ModulePath, Option<Hash>)> {
        let incoming = source.entries_under(prefix);
        let outgoing = self.entries_under(prefix);

        let mut changes = Vec::new();
        for (path, old) in &outgoing {
            if !incoming.contains_key(path) {
                self.entries.remove(path);
                changes.push((path.clone(), None));
            } else if incoming.get(path) != Some(old) {
                changes.push((path.clone(), incoming.get(path).copied()));
            }
        }
        for (path, hash) in incoming {
            if !outgoing.contains_key(&path) {
                changes.push((path.clone(), Some(hash)));
            }
            self.entries.insert(path, hash);
        }
        changes.sort_by(|a, b| a.0.cmp(&b.0));
        changes
    }

    /// All content hashes referenced by this index.
    pub fn hashes(&self) -> impl Iterator<Item = &Hash> {
        self.entries.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ModulePath, &Hash)> {
        self.entries.iter()
    }

    /// Union of the paths of two indexes.
    pub fn union_paths<'a>(&'a self, other: &'a PathIndex) -> BTreeSet<&'a ModulePath> {
        self.entries.keys().chain(other.entries.keys()).collect()
    }

    // Paths sort lexicographically by segment, so everything under a prefix
    // is one contiguous range starting at the prefix itself.
    fn under<'a>(
        &'a self,
        prefix: &'a ModulePath,
    ) -> impl Iterator<Item = (&'a ModulePath, &'a Hash)> + 'a {
        self.entries
            .range((Bound::Included(prefix), Bound::Unbounded))
            .take_while(move |(path, _)| path.starts_with(prefix))
    }
}

impl FromIterator<(ModulePath, Hash)> for PathIndex {
    fn from_iter<T: IntoIterator<Item = (ModulePath, Hash)>>(iter: T) -> Self {
        PathIndex {
            entries: iter.into_iter().collect(),
        }
    }
}
