//! The host-side contract for change detection.
//!
//! The engine never detects property changes itself. A [`NotificationProvider`]
//! is handed an [`EventSink`] per subscription and pushes change, teardown and
//! error events into it from whatever thread it likes.

use crate::error::{ObserveError, Result};
use std::sync::Arc;

/// Change detection for (target, property path) pairs.
///
/// Contract:
/// - `subscribe` fails with [`ObserveError::InvalidPath`] when `path` does not
///   resolve on `target`. When `wants_initial` is set, the provider calls
///   `sink.change(None, current)` before returning.
/// - `sink.change` may be called zero or more times afterwards, on any thread.
/// - `sink.teardown` is called exactly once if the target is destroyed while
///   the subscription is live. No change follows a teardown.
/// - `sink.fail` reports a delivery error that ends the subscription, such as
///   the path no longer resolving. The provider drops the registration before
///   calling it, and no change follows.
/// - `unsubscribe` is idempotent and safe after teardown.
///
/// Providers must not hold their own locks while calling into a sink: sinks
/// run user callbacks, which may call back into the provider.
pub trait NotificationProvider: Send + Sync + 'static {
    /// Observed object type. Targets are only ever held weakly by the engine.
    type Target: Send + Sync + 'static;
    /// Property value type delivered to callbacks.
    type Value: Clone + Send + Sync + 'static;
    /// Provider-side registration token.
    type Token: Send + 'static;

    /// Start delivering events for `path` on `target` into `sink`.
    fn subscribe(
        &self,
        target: &Arc<Self::Target>,
        path: &str,
        wants_initial: bool,
        sink: EventSink<Self::Value>,
    ) -> Result<Self::Token>;

    /// Stop delivering events for `token`.
    fn unsubscribe(&self, token: &Self::Token);
}

/// Receiver side of one subscription, implemented by the observers.
pub(crate) trait Deliver<V>: Send + Sync {
    fn change(&self, old: Option<V>, new: V);
    fn teardown(&self);
    fn fail(&self, error: ObserveError);
}

/// Where a provider pushes events for one subscription.
///
/// Cheap to clone. Calling into a sink whose subscription has ended is a
/// no-op.
pub struct EventSink<V> {
    inner: Arc<dyn Deliver<V>>,
}

impl<V> EventSink<V> {
    pub(crate) fn new(inner: Arc<dyn Deliver<V>>) -> Self {
        Self { inner }
    }

    /// Report a new value. `old` is `None` when the previous value is unknown,
    /// as for the initial delivery.
    pub fn change(&self, old: Option<V>, new: V) {
        self.inner.change(old, new);
    }

    /// Report that the observed target has been destroyed.
    pub fn teardown(&self) {
        self.inner.teardown();
    }

    /// Report a delivery error, such as the path no longer resolving.
    pub fn fail(&self, error: ObserveError) {
        self.inner.fail(error);
    }
}

impl<V> Clone for EventSink<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V> std::fmt::Debug for EventSink<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}
