//! Subscription types for the watch feed.

use crate::types::{Hash, ModulePath};
use serde::{Deserialize, Serialize};

/// Configuration for a subscription.
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Max buffered events before dropping subscriber.
    /// Default: 1000
    pub buffer_size: usize,

    /// Filter criteria.
    pub filter: SubscriptionFilter,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1000,
            filter: SubscriptionFilter::all(),
        }
    }
}

/// Filter criteria for subscriptions.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionFilter {
    /// Only events for this branch (None = every branch).
    pub branch: Option<String>,

    /// Only module events at or below this path.
    pub path_prefix: Option<ModulePath>,

    /// Include `Updated` / `Removed` events.
    pub include_modules: bool,

    /// Include `Committed` events.
    pub include_commits: bool,

    /// Include branch creation and deletion.
    pub include_branch_events: bool,
}

impl SubscriptionFilter {
    /// Module changes on one branch.
    pub fn modules(branch: impl Into<String>) -> Self {
        Self {
            branch: Some(branch.into()),
            include_modules: true,
            ..Default::default()
        }
    }

    /// Module changes below a path, on any branch.
    pub fn path(prefix: ModulePath) -> Self {
        Self {
            path_prefix: Some(prefix),
            include_modules: true,
            ..Default::default()
        }
    }

    /// Commits on any branch.
    pub fn commits() -> Self {
        Self {
            include_commits: true,
            ..Default::default()
        }
    }

    /// Subscribe to branch events.
    pub fn branches() -> Self {
        Self {
            include_branch_events: true,
            ..Default::default()
        }
    }

    /// Subscribe to everything.
    pub fn all() -> Self {
        Self {
            include_modules: true,
            include_commits: true,
            include_branch_events: true,
            ..Default::default()
        }
    }

    /// Restrict to one branch.
    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub(crate) fn matches(&self, event: &StoreEvent) -> bool {
        let branch_ok = |name: &str| self.branch.as_deref().map_or(true, |b| b == name);
        let path_ok = |path: &ModulePath| {
            self.path_prefix
                .as_ref()
                .map_or(true, |prefix| path.starts_with(prefix))
        };

        match event {
            StoreEvent::Updated { branch, path, .. } | StoreEvent::Removed { branch, path } => {
                self.include_modules && branch_ok(branch) && path_ok(path)
            }
            StoreEvent::Committed { branch, .. } => self.include_commits && branch_ok(branch),
            StoreEvent::BranchCreated { name, .. } | StoreEvent::BranchDeleted { name } => {
                self.include_branch_events && branch_ok(name)
            }
            StoreEvent::Dropped { .. } => true,
        }
    }
}

/// Events emitted by subscriptions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreEvent {
    /// A path now points at new content in a branch's working index.
    Updated {
        branch: String,
        path: ModulePath,
        hash: Hash,
    },

    /// A path was removed from a branch's working index.
    Removed { branch: String, path: ModulePath },

    /// A branch tip moved to a new commit (snapshot or merge).
    Committed { branch: String, commit: Hash },

    /// A new branch was created.
    BranchCreated { name: String, tip: Option<Hash> },

    /// A branch was deleted.
    BranchDeleted { name: String },

    /// Subscription was dropped.
    Dropped { reason: DropReason },
}

/// Why a subscription was dropped.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
    /// The store is shutting down.
    Closed,
}

/// Unique identifier for a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Handle to manage a subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<StoreEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<StoreEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<StoreEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<StoreEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn updated(branch: &str, path: &str) -> StoreEvent {
        StoreEvent::Updated {
            branch: branch.to_string(),
            path: ModulePath::parse(path).unwrap(),
            hash: Hash::from_bytes(b"x"),
        }
    }

    #[test]
    fn test_filter_by_branch() {
        let filter = SubscriptionFilter::modules("feature");
        assert!(filter.matches(&updated("feature", "a")));
        assert!(!filter.matches(&updated("main", "a")));
    }

    #[test]
    fn test_filter_by_path_prefix() {
        let filter = SubscriptionFilter::path(ModulePath::parse("mod").unwrap());
        assert!(filter.matches(&updated("main", "mod/a")));
        assert!(filter.matches(&updated("main", "mod")));
        assert!(!filter.matches(&updated("main", "module")));
        assert!(!filter.matches(&updated("main", "other/a")));
    }

    #[test]
    fn test_filter_by_kind() {
        let commit = StoreEvent::Committed {
            branch: "main".to_string(),
            commit: Hash::from_bytes(b"c"),
        };
        assert!(SubscriptionFilter::commits().matches(&commit));
        assert!(!SubscriptionFilter::commits().matches(&updated("main", "a")));
        assert!(!SubscriptionFilter::branches().matches(&commit));
        assert!(SubscriptionFilter::all().on_branch("main").matches(&commit));
    }

    #[test]
    fn test_event_json_shape() {
        let json = serde_json::to_value(updated("main", "mod/a")).unwrap();
        assert_eq!(json["type"], "updated");
        assert_eq!(json["path"], "mod/a");
        assert_eq!(json["hash"], Hash::from_bytes(b"x").to_hex());
    }
}
