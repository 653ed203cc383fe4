// Subscription - the binding of one (target, property path) to a sink
//
// A SubscriptionCore is owned by whoever delivers its events: the sink of a
// single observer, or the aggregator for latest-value observation. Handles
// never own it; they look it up weakly through the registry by id.
//
// LIFECYCLE:
// - Active: events are delivered
// - Cancelled: the caller cancelled, or a delivery error auto-cancelled it
// - TargetGone: the provider reported the target destroyed
//
// State only moves out of Active, never back. The move is a single
// compare-and-set, so exactly one closer runs the provider detach. Only a
// cancel detaches: on teardown and delivery failure the provider has already
// dropped the registration.

use crate::registry;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// Source of subscription ids. Ids are never reused, so a stale handle can
/// never reach a newer subscription.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a subscription.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    fn next() -> Self {
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// The raw numeric id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Lifecycle state of a subscription - uses u8 for AtomicU8 storage
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Events are being delivered
    Active = 0,
    /// Cancelled by the caller or after an unhandled delivery error
    Cancelled = 1,
    /// The observed target was destroyed
    TargetGone = 2,
}

impl SubscriptionState {
    /// Convert from u8 to SubscriptionState
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => SubscriptionState::Active,
            1 => SubscriptionState::Cancelled,
            _ => SubscriptionState::TargetGone,
        }
    }
}

/// Why a subscription left the Active state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Cancelled,
    TargetGone,
    Failed,
}

impl CloseReason {
    fn state(self) -> SubscriptionState {
        match self {
            CloseReason::Cancelled | CloseReason::Failed => SubscriptionState::Cancelled,
            CloseReason::TargetGone => SubscriptionState::TargetGone,
        }
    }
}

/// Per-subscription delivery options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionOptions {
    /// The provider was asked to deliver the current value on subscribe.
    pub fire_immediately: bool,
    /// Callbacks receive the previous value alongside the new one.
    pub want_old_and_new: bool,
}

type Detach = Box<dyn FnOnce() + Send>;
type CloseHook = Box<dyn Fn(CloseReason) + Send + Sync>;

pub(crate) struct SubscriptionCore {
    id: SubscriptionId,
    path: String,
    target: Weak<dyn Any + Send + Sync>,
    options: SubscriptionOptions,
    state: AtomicU8,
    /// Provider unsubscribe, installed once the provider has accepted the sink.
    detach: Mutex<Option<Detach>>,
    /// Owner notification, run by whoever closes the subscription and again
    /// on every later cancel.
    on_close: Option<CloseHook>,
}

impl SubscriptionCore {
    /// Create an Active subscription and publish it in the registry.
    pub(crate) fn new<T>(
        target: &Arc<T>,
        path: &str,
        options: SubscriptionOptions,
        on_close: Option<CloseHook>,
    ) -> Arc<Self>
    where
        T: Any + Send + Sync,
    {
        let target: Weak<T> = Arc::downgrade(target);
        let target: Weak<dyn Any + Send + Sync> = target;
        let core = Arc::new(Self {
            id: SubscriptionId::next(),
            path: path.to_owned(),
            target,
            options,
            state: AtomicU8::new(SubscriptionState::Active as u8),
            detach: Mutex::new(None),
            on_close,
        });
        registry::register(&core);
        debug!(id = %core.id, path, "subscription created");
        core
    }

    pub(crate) fn id(&self) -> SubscriptionId {
        self.id
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn options(&self) -> SubscriptionOptions {
        self.options
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        SubscriptionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state() == SubscriptionState::Active
    }

    pub(crate) fn is_target_alive(&self) -> bool {
        self.target.strong_count() > 0
    }

    /// Install the provider unsubscribe.
    ///
    /// If the subscription was closed while the provider was still
    /// subscribing, the detach runs right away.
    pub(crate) fn attach(&self, detach: Detach) {
        let mut slot = self.detach.lock();
        if self.is_active() {
            *slot = Some(detach);
            return;
        }
        drop(slot);
        detach();
    }

    /// Move out of Active. Returns false if the subscription was already closed.
    pub(crate) fn close(&self, reason: CloseReason) -> bool {
        let closed = self.state.compare_exchange(
            SubscriptionState::Active as u8,
            reason.state() as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if closed.is_err() {
            return false;
        }

        // The provider already dropped its side on teardown and failure
        let detach = self.detach.lock().take();
        if let Some(detach) = detach.filter(|_| reason == CloseReason::Cancelled) {
            detach();
        }

        debug!(id = %self.id, path = %self.path, ?reason, "subscription closed");

        if let Some(hook) = &self.on_close {
            hook(reason);
        }
        true
    }

    /// Caller-initiated cancel.
    ///
    /// Unlike [`close`](Self::close), the owner hook hears about every cancel,
    /// even once the subscription has already ended, so work queued for it
    /// can be dropped.
    pub(crate) fn cancel(&self) {
        if self.close(CloseReason::Cancelled) {
            return;
        }
        if let Some(hook) = &self.on_close {
            hook(CloseReason::Cancelled);
        }
    }
}

impl Drop for SubscriptionCore {
    fn drop(&mut self) {
        registry::unregister(self.id);
    }
}

impl fmt::Debug for SubscriptionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionCore")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("state", &self.state())
            .field("target_alive", &self.is_target_alive())
            .finish_non_exhaustive()
    }
}
