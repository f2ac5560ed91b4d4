//! Synchronous observer-list event dispatch.
//!
//! Events are delivered on the thread that completes the transition, with no
//! cross-thread marshaling. The hook list is snapshotted before dispatch so
//! hooks are never invoked under the list lock and may themselves subscribe
//! or unsubscribe.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Subscription ids are unique process-wide, so a [`Subscription`] can only
/// ever match the hook it was returned for.
static NEXT_SUBSCRIPTION: AtomicU64 = AtomicU64::new(0);

/// A handle identifying a registered event hook.
///
/// Returned by [`Cache::on_created`](crate::Cache::on_created) and
/// [`Cache::on_failed`](crate::Cache::on_failed), and consumed by
/// [`Cache::unsubscribe`](crate::Cache::unsubscribe).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// A list of event hooks of a common (unsized) callable type.
pub(crate) struct HookList<F: ?Sized> {
    hooks: RwLock<Vec<(Subscription, Arc<F>)>>,
}

impl<F: ?Sized> HookList<F> {
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe(&self, hook: Arc<F>) -> Subscription {
        let id = Subscription(NEXT_SUBSCRIPTION.fetch_add(1, Ordering::Relaxed));
        self.hooks.write().push((id, hook));
        id
    }

    /// Removes the hook registered under `id`, returning whether it was found.
    pub fn unsubscribe(&self, id: Subscription) -> bool {
        let mut hooks = self.hooks.write();
        let len = hooks.len();
        hooks.retain(|(registered, _)| *registered != id);
        hooks.len() != len
    }

    /// Invokes `call` once per registered hook, in subscription order.
    pub fn broadcast(&self, mut call: impl FnMut(&F)) {
        let snapshot: Vec<_> = self
            .hooks
            .read()
            .iter()
            .map(|(_, hook)| Arc::clone(hook))
            .collect();
        for hook in snapshot {
            call(&hook);
        }
    }
}
