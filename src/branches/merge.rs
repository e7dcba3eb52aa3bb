//! Three-way merge of path indexes.

use crate::index::PathIndex;

/// Merge `source` into `target` relative to their common ancestor `base`.
///
/// Per path: if both sides agree the value is kept; if one side still
/// equals the base the other side's value is taken; if both changed it,
/// the source wins. Absence counts as a value, so a deletion on one side
/// is carried like any other change.
pub fn three_way(base: &PathIndex, target: &PathIndex, source: &PathIndex) -> PathIndex {
    let mut merged = PathIndex::new();

    for path in target.union_paths(source) {
        let ours = target.lookup(path);
        let theirs = source.lookup(path);

        let value = if ours == theirs {
            ours
        } else if theirs == base.lookup(path) {
            ours
        } else {
            theirs
        };

        if let Some(hash) = value {
            merged.set(path.clone(), hash);
        }
    }

    merged
}
