//! Watch feed: in-process subscriptions to store events.
//!
//! Subscribers receive module updates and removals, commits, and branch
//! creation/deletion, optionally filtered by branch and path prefix.
//! Each subscription has a bounded buffer; a subscriber that falls behind
//! is dropped rather than slowing writers down.
//!
//! # Example
//!
//! ```ignore
//! let handle = store.watch(SubscriptionConfig {
//!     filter: SubscriptionFilter::modules("main"),
//!     ..Default::default()
//! });
//!
//! loop {
//!     match handle.recv() {
//!         Ok(StoreEvent::Updated { path, hash, .. }) => println!("{path} -> {hash}"),
//!         Ok(StoreEvent::Dropped { .. }) | Err(_) => break,
//!         Ok(_) => {}
//!     }
//! }
//! ```

mod manager;
mod types;

pub use manager::SubscriptionManager;
pub use types::{
    DropReason, StoreEvent, SubscriptionConfig, SubscriptionFilter, SubscriptionHandle,
    SubscriptionId,
};
