//! Commit graph.
//!
//! Commits are immutable snapshots of a branch's path index with lineage
//! metadata. They live in an arena addressed by hash and are persisted to
//! an append-only log, so history shared between branches is stored once.

mod graph;
mod log;

pub use graph::{Ancestors, Commit, CommitGraph};
pub use log::CommitLog;
