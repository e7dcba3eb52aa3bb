//! Per-branch path index.
//!
//! Maps hierarchical module paths to content hashes. Each branch keeps a
//! working copy that staged mutations apply to; each commit carries an
//! immutable copy.

mod path_index;

pub use path_index::PathIndex;
