//! # wasmstore
//!
//! A versioned, content-addressed store for WebAssembly modules.
//!
//! ## Core Concepts
//!
//! - **Modules**: Immutable byte payloads stored once per content hash
//! - **Paths**: Hierarchical names mapped to module hashes, per branch
//! - **Commits**: Immutable snapshots of a branch's path index with lineage
//! - **Branches**: Named tips with a staged working index; merged three-way
//! - **GC**: Sweeps content no branch can reach any more
//!
//! The [`api`] module maps the `/api/v1` REST contract onto [`Store`]
//! without tying it to an HTTP framework.
//!
//! ## Example
//!
//! ```ignore
//! use wasmstore::{ModulePath, Store, StoreConfig};
//!
//! let store = Store::open_or_create(StoreConfig::new("./modules"))?;
//!
//! let path = ModulePath::parse("filters/resize.wasm")?;
//! let hash = store.add("main", &path, &wasm_bytes)?;
//! let commit = store.snapshot("main")?;
//!
//! store.create_branch("experiment", None)?;
//! store.add("experiment", &path, &patched_bytes)?;
//! store.merge("experiment", "main")?;
//! ```

pub mod api;
pub mod auth;
pub mod blobs;
pub mod branches;
pub mod commits;
pub mod error;
pub mod index;
pub mod store;
pub mod subscriptions;
pub mod types;
pub mod wal;

// Re-exports
pub use api::{Api, Request, Response};
pub use auth::{AuthConfig, Grant, Method};
pub use blobs::BlobStorage;
pub use branches::{three_way, BranchManager, DEFAULT_BRANCH};
pub use commits::{Commit, CommitGraph};
pub use error::{ErrorKind, Result, StoreError};
pub use index::PathIndex;
pub use store::{Store, StoreConfig};
pub use subscriptions::{
    DropReason, StoreEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId, SubscriptionManager,
};
pub use types::*;
pub use wal::{WalEntry, WalOperation, WriteAheadLog};
