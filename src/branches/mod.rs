//! Named branches and merging.
//!
//! A branch is a mutable pointer to a tip commit plus a working index of
//! staged mutations. Branches are independent: each has its own lock.

mod manager;
mod merge;

pub use manager::{validate_name, BranchHandle, BranchManager, BranchState, DEFAULT_BRANCH};
pub use merge::three_way;
