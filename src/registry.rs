//! Handles and the process-wide subscription registry.
//!
//! Every live subscription is published here under its
//! [`SubscriptionId`] as a `Weak` entry. A [`Handle`] carries only the id, so
//! cancelling resolves the subscription at call time: cancelling after the
//! target is gone, after the owner released the subscription, or twice in a
//! row is a no-op.

use crate::subscription::{SubscriptionCore, SubscriptionId, SubscriptionOptions, SubscriptionState};
use foldhash::fast::FixedState;
use papaya::HashMap as PapayaHashMap;
use std::sync::{Arc, LazyLock, Weak};

/// Fixed seed: registry keys are internal, so HashDoS resistance is not needed.
const REGISTRY_SEED: u64 = 0x517c_c1b7_2722_0a95;

// Global map: SubscriptionId -> weak subscription
// Uses papaya's lock-free HashMap so cancellation from any thread never
// contends with delivery.
static REGISTRY: LazyLock<PapayaHashMap<SubscriptionId, Weak<SubscriptionCore>, FixedState>> =
    LazyLock::new(|| PapayaHashMap::with_hasher(FixedState::with_seed(REGISTRY_SEED)));

pub(crate) fn register(core: &Arc<SubscriptionCore>) {
    REGISTRY.pin().insert(core.id(), Arc::downgrade(core));
}

pub(crate) fn unregister(id: SubscriptionId) {
    REGISTRY.pin().remove(&id);
}

pub(crate) fn lookup(id: SubscriptionId) -> Option<Arc<SubscriptionCore>> {
    REGISTRY.pin().get(&id).and_then(Weak::upgrade)
}

/// Number of subscriptions currently registered, across all observers.
///
/// Useful for leak checks in diagnostics; the count is process-wide.
pub fn live_subscriptions() -> usize {
    REGISTRY.pin().len()
}

/// Caller-held capability for cancelling one subscription.
///
/// Handles are `Copy` and do not keep the subscription alive. Dropping a
/// handle does not cancel anything; use [`Handle::cancel_on_drop`] for that.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Handle {
    id: Option<SubscriptionId>,
}

impl Handle {
    /// The no-op handle returned for a null target.
    pub const fn null() -> Self {
        Self { id: None }
    }

    pub(crate) fn new(id: SubscriptionId) -> Self {
        Self { id: Some(id) }
    }

    /// True for the handle returned for a null target.
    pub fn is_null(&self) -> bool {
        self.id.is_none()
    }

    /// Id of the underlying subscription, if any.
    pub fn id(&self) -> Option<SubscriptionId> {
        self.id
    }

    fn core(&self) -> Option<Arc<SubscriptionCore>> {
        self.id.and_then(lookup)
    }

    /// Cancel the subscription.
    ///
    /// Idempotent and callable from any thread, including from inside the
    /// subscription's own callback. No callback invocation starts after this
    /// returns; one that already started may still finish.
    pub fn cancel(&self) {
        if let Some(core) = self.core() {
            core.cancel();
        }
    }

    /// Current state, or `None` once the subscription has been released by
    /// its owner (or for a null handle).
    pub fn state(&self) -> Option<SubscriptionState> {
        self.core().map(|core| core.state())
    }

    /// True while events are still being delivered.
    pub fn is_active(&self) -> bool {
        self.state() == Some(SubscriptionState::Active)
    }

    /// Observed property path, while the subscription is still held.
    pub fn path(&self) -> Option<String> {
        self.core().map(|core| core.path().to_owned())
    }

    /// Delivery options the subscription was created with.
    pub fn options(&self) -> Option<SubscriptionOptions> {
        self.core().map(|core| core.options())
    }

    /// True while the subscription is held and its target is still alive.
    pub fn is_target_alive(&self) -> bool {
        self.core().is_some_and(|core| core.is_target_alive())
    }

    /// Wrap the handle in a guard that cancels it when dropped.
    pub fn cancel_on_drop(self) -> HandleGuard {
        HandleGuard { handle: self }
    }
}

/// RAII guard that cancels its [`Handle`] on drop.
#[derive(Debug)]
#[must_use = "dropping the guard cancels the subscription immediately"]
pub struct HandleGuard {
    handle: Handle,
}

impl HandleGuard {
    /// The guarded handle.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    /// Release the handle without cancelling it.
    pub fn disarm(self) -> Handle {
        let handle = self.handle;
        std::mem::forget(self);
        handle
    }
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}

/// Cancel every handle in `handles`.
pub fn cancel_all<'a>(handles: impl IntoIterator<Item = &'a Handle>) {
    for handle in handles {
        handle.cancel();
    }
}
