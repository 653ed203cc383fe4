use crate::error::{ObserveError, Result};
use crate::provider::{Deliver, EventSink, NotificationProvider};
use crate::registry::Handle;
use crate::subscription::{CloseReason, SubscriptionCore, SubscriptionOptions};
use std::sync::Arc;
use tracing::{trace, warn};

type ErrorHook = Arc<dyn Fn(&ObserveError) + Send + Sync>;

/// Options for single-property observation.
///
/// # Example
/// ```ignore
/// let options = ObserveOptions::new()
///     .fire_immediately(false)
///     .on_error(|err| eprintln!("observation failed: {err}"));
/// ```
#[derive(Clone)]
pub struct ObserveOptions {
    fire_immediately: bool,
    on_error: Option<ErrorHook>,
}

impl ObserveOptions {
    /// Default options: fire immediately, no error hook.
    pub fn new() -> Self {
        Self {
            fire_immediately: true,
            on_error: None,
        }
    }

    /// Invoke the callback once with the current value before `observe` returns.
    pub fn fire_immediately(mut self, fire: bool) -> Self {
        self.fire_immediately = fire;
        self
    }

    /// Receive delivery errors instead of having them logged. The subscription
    /// still ends: the provider has dropped it.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ObserveError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

impl Default for ObserveOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ObserveOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserveOptions")
            .field("fire_immediately", &self.fire_immediately)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// The two callback shapes of a single observer.
enum Callback<V> {
    New(Box<dyn Fn(&V) + Send + Sync>),
    OldAndNew(Box<dyn Fn(Option<&V>, &V) + Send + Sync>),
}

/// Sink for one single-property observation.
struct ObserverSink<V> {
    core: Arc<SubscriptionCore>,
    callback: Callback<V>,
    on_error: Option<ErrorHook>,
}

impl<V: Send + Sync> Deliver<V> for ObserverSink<V> {
    fn change(&self, old: Option<V>, new: V) {
        if !self.core.is_active() {
            trace!(id = %self.core.id(), "change after close ignored");
            return;
        }
        match &self.callback {
            Callback::New(f) => f(&new),
            Callback::OldAndNew(f) => f(old.as_ref(), &new),
        }
    }

    fn teardown(&self) {
        self.core.close(CloseReason::TargetGone);
    }

    fn fail(&self, error: ObserveError) {
        if !self.core.is_active() {
            return;
        }
        match &self.on_error {
            Some(hook) => hook(&error),
            None => {
                warn!(id = %self.core.id(), path = %self.core.path(), %error, "delivery failed, cancelling");
            }
        }
        self.core.close(CloseReason::Failed);
    }
}

/// Entry point for registering observations against a provider.
///
/// Cloning an `Observer` shares the same provider.
pub struct Observer<P> {
    provider: Arc<P>,
}

impl<P> Clone for Observer<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
        }
    }
}

impl<P: NotificationProvider> Observer<P> {
    /// Create an observer over `provider`.
    pub fn new(provider: P) -> Self {
        Self::from_arc(Arc::new(provider))
    }

    /// Create an observer over an already shared provider.
    pub fn from_arc(provider: Arc<P>) -> Self {
        Self { provider }
    }

    /// The underlying provider.
    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// Observe `path` on `target` with default options, receiving new values.
    ///
    /// The callback fires once with the current value before this returns.
    /// A `None` target yields [`Handle::null`].
    pub fn observe<F>(
        &self,
        target: Option<&Arc<P::Target>>,
        path: &str,
        callback: F,
    ) -> Result<Handle>
    where
        F: Fn(&P::Value) + Send + Sync + 'static,
    {
        self.observe_with(target, path, ObserveOptions::default(), callback)
    }

    /// Observe `path` on `target`, receiving new values.
    pub fn observe_with<F>(
        &self,
        target: Option<&Arc<P::Target>>,
        path: &str,
        options: ObserveOptions,
        callback: F,
    ) -> Result<Handle>
    where
        F: Fn(&P::Value) + Send + Sync + 'static,
    {
        self.register(target, path, options, Callback::New(Box::new(callback)))
    }

    /// Observe `path` on `target`, receiving the previous and the new value.
    ///
    /// The previous value is `None` when it is unknown, as for the immediate
    /// initial invocation.
    pub fn observe_old_and_new<F>(
        &self,
        target: Option<&Arc<P::Target>>,
        path: &str,
        options: ObserveOptions,
        callback: F,
    ) -> Result<Handle>
    where
        F: Fn(Option<&P::Value>, &P::Value) + Send + Sync + 'static,
    {
        self.register(target, path, options, Callback::OldAndNew(Box::new(callback)))
    }

    fn register(
        &self,
        target: Option<&Arc<P::Target>>,
        path: &str,
        options: ObserveOptions,
        callback: Callback<P::Value>,
    ) -> Result<Handle> {
        let Some(target) = target else {
            return Ok(Handle::null());
        };

        let subscription_options = SubscriptionOptions {
            fire_immediately: options.fire_immediately,
            want_old_and_new: matches!(callback, Callback::OldAndNew(_)),
        };
        let core = SubscriptionCore::new(target, path, subscription_options, None);
        let sink = ObserverSink {
            core: Arc::clone(&core),
            callback,
            on_error: options.on_error,
        };

        self.attach(&core, target, path, EventSink::new(Arc::new(sink)))?;
        Ok(Handle::new(core.id()))
    }

    /// Subscribe `sink` with the provider and hand the unsubscribe to `core`.
    pub(crate) fn attach(
        &self,
        core: &Arc<SubscriptionCore>,
        target: &Arc<P::Target>,
        path: &str,
        sink: EventSink<P::Value>,
    ) -> Result<()> {
        let wants_initial = core.options().fire_immediately;
        let token = match self.provider.subscribe(target, path, wants_initial, sink) {
            Ok(token) => token,
            Err(error) => {
                core.close(CloseReason::Failed);
                return Err(error);
            }
        };
        let provider = Arc::clone(&self.provider);
        core.attach(Box::new(move || provider.unsubscribe(&token)));
        Ok(())
    }
}

impl<P> std::fmt::Debug for Observer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer").finish_non_exhaustive()
    }
}
