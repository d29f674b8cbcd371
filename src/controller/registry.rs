//! In-flight reconcile registry
//!
//! Tracks the cancellation token of every running reconcile so a deletion
//! observed mid-poll can stop a create/update wait, and shutdown can stop all
//! of them. Tokens are children of the process shutdown token.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// What a registered reconcile is doing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileKind {
    /// Create or update
    Apply,
    /// Delete
    Delete,
}

#[derive(Debug)]
struct Entry {
    id: u64,
    kind: ReconcileKind,
    token: CancellationToken,
}

/// Registry of running reconciles keyed by `namespace/name`
#[derive(Debug)]
pub struct InFlightRegistry {
    shutdown: CancellationToken,
    active: DashMap<String, Entry>,
    next_id: AtomicU64,
}

/// Registration handle; unregisters on drop
#[derive(Debug)]
pub struct InFlightGuard {
    registry: Arc<InFlightRegistry>,
    key: String,
    id: u64,
    token: CancellationToken,
}

impl InFlightGuard {
    /// Token the reconcile must observe
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        // A newer reconcile for the same key may have replaced this entry
        self.registry
            .active
            .remove_if(&self.key, |_, entry| entry.id == self.id);
    }
}

impl InFlightRegistry {
    /// Create a registry whose tokens all derive from `shutdown`
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            active: DashMap::new(),
            next_id: AtomicU64::new(0),
        }
    }

    /// Registry key for a namespaced resource
    pub fn key(namespace: &str, name: &str) -> String {
        format!("{namespace}/{name}")
    }

    /// Register a reconcile and return its guard
    pub fn register(self: &Arc<Self>, key: String, kind: ReconcileKind) -> InFlightGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        debug!(key = %key, ?kind, "registering reconcile");
        self.active.insert(
            key.clone(),
            Entry {
                id,
                kind,
                token: token.clone(),
            },
        );
        InFlightGuard {
            registry: Arc::clone(self),
            key,
            id,
            token,
        }
    }

    /// Cancel a running create/update for `key`
    ///
    /// Delete reconciles are left alone. Returns whether anything was cancelled.
    pub fn cancel_apply(&self, key: &str) -> bool {
        match self.active.get(key) {
            Some(entry) if entry.kind == ReconcileKind::Apply => {
                info!(key = %key, "cancelling in-flight apply for deleted resource");
                entry.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every running reconcile
    pub fn cancel_all(&self) {
        let count = self.active.len();
        if count > 0 {
            info!(count, "cancelling all in-flight reconciles");
        }
        self.shutdown.cancel();
    }

    /// Number of running reconciles
    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Whether no reconcile is running
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> Arc<InFlightRegistry> {
        Arc::new(InFlightRegistry::new(CancellationToken::new()))
    }

    /// Story: deleting a resource mid-poll cancels its create/update
    #[test]
    fn story_deletion_cancels_apply() {
        let registry = registry();
        let guard = registry.register(InFlightRegistry::key("infra", "vpc"), ReconcileKind::Apply);

        assert!(registry.cancel_apply("infra/vpc"));
        assert!(guard.token().is_cancelled());
    }

    /// Story: the delete reconcile itself is not cancelled by the deletion
    /// watcher
    #[test]
    fn story_delete_is_not_cancelled_by_deletion() {
        let registry = registry();
        let guard = registry.register("infra/vpc".to_string(), ReconcileKind::Delete);

        assert!(!registry.cancel_apply("infra/vpc"));
        assert!(!guard.token().is_cancelled());
    }

    #[test]
    fn guard_unregisters_on_drop() {
        let registry = registry();
        {
            let _guard = registry.register("infra/vpc".to_string(), ReconcileKind::Apply);
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
        assert!(!registry.cancel_apply("infra/vpc"));
    }

    #[test]
    fn stale_guard_does_not_remove_newer_entry() {
        let registry = registry();
        let first = registry.register("infra/vpc".to_string(), ReconcileKind::Apply);
        let second = registry.register("infra/vpc".to_string(), ReconcileKind::Delete);

        drop(first);
        assert_eq!(registry.len(), 1);
        drop(second);
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_all_reaches_every_reconcile() {
        let registry = registry();
        let a = registry.register("infra/a".to_string(), ReconcileKind::Apply);
        let b = registry.register("infra/b".to_string(), ReconcileKind::Delete);

        registry.cancel_all();

        assert!(a.token().is_cancelled());
        assert!(b.token().is_cancelled());
    }
}
