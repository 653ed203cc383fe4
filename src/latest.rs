// Latest-value aggregation over a fixed list of (target, path) pairs
//
// One aggregator owns N subscriptions and N slots. Every accepted change
// updates its slot and produces one combined callback invocation carrying the
// changed index and a snapshot of all slots.
//
// SERIALIZATION:
// - The aggregator lock guards slots, the pending queue and the `delivering`
//   flag. It is never held while the user callback runs.
// - A change updates its slot, copies the snapshot and pushes
//   (index, snapshot) onto the pending queue under the lock. If no delivery is
//   running, the current thread becomes the drainer and invokes the callback
//   for queued entries one at a time, in FIFO order, until the queue is empty.
// - Changes that arrive while a delivery runs (from other threads, or
//   reentrantly from inside the callback) only enqueue. At most one callback
//   invocation per aggregator is running at any moment.
//
// - A panicking callback releases the drainer role and discards whatever was
//   still queued. The slots keep the values; the next change delivers them.
//
// SLOT LIFECYCLE:
// - Unknown until the first accepted change, then Value(v).
// - Target destroyed or delivery failure: Dead, sealed.
// - Handle cancelled: sealed, keeps its frozen last value.
// - Sealed slots ignore further changes.
// - Cancelling a handle or a delivery failure mutes the index: its queued
//   entries are dropped before they are delivered, even if the slot was
//   already sealed by a teardown. A teardown alone does not mute, so a change
//   accepted before it is still delivered.
//
// REGISTRATION:
// - Initial values arriving on the registering thread fill slots silently.
// - Changes from other threads while pairs are still being registered are
//   queued and delivered once registration completes.

use crate::error::{ObserveError, Result};
use crate::observer::Observer;
use crate::provider::{Deliver, EventSink, NotificationProvider};
use crate::registry::{self, Handle};
use crate::subscription::{CloseReason, SubscriptionCore, SubscriptionOptions};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{trace, warn};

/// Latest known value for one index of a latest-value observation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Slot<V> {
    /// No value has been observed yet.
    #[default]
    Unknown,
    /// The most recent observed value.
    Value(V),
    /// The target was destroyed (or its path failed); no further values arrive.
    Dead,
}

impl<V> Slot<V> {
    /// The value, if one has been observed.
    pub fn value(&self) -> Option<&V> {
        match self {
            Slot::Value(v) => Some(v),
            Slot::Unknown | Slot::Dead => None,
        }
    }

    /// True for [`Slot::Unknown`].
    pub fn is_unknown(&self) -> bool {
        matches!(self, Slot::Unknown)
    }

    /// True for [`Slot::Dead`].
    pub fn is_dead(&self) -> bool {
        matches!(self, Slot::Dead)
    }
}

/// Callback invoked with the changed index and a full snapshot.
///
/// `arity` is checked against the number of registered pairs before any
/// subscription is created. Build one with [`fixed`] or [`dynamic`].
pub trait CombinedCallback<V>: Send + Sync + 'static {
    /// Number of values this callback accepts.
    fn arity(&self) -> usize;

    /// Invoke with `values.len() == self.arity()`.
    fn invoke(&self, index: usize, values: &[Slot<V>]);
}

/// Combined callback over a fixed-size array of slots. See [`fixed`].
pub struct Fixed<const N: usize, F> {
    f: F,
}

/// Combined callback with a runtime arity. See [`dynamic`].
pub struct Dynamic<F> {
    arity: usize,
    f: F,
}

/// Build a combined callback whose arity is the array length `N`.
///
/// # Example
/// ```ignore
/// let callback = fixed(|index: usize, [title, color]: &[Slot<Value>; 2]| {
///     println!("{index} changed: {title:?} {color:?}");
/// });
/// ```
pub fn fixed<V, const N: usize, F>(f: F) -> Fixed<N, F>
where
    F: Fn(usize, &[Slot<V>; N]) + Send + Sync + 'static,
{
    Fixed { f }
}

/// Build a combined callback over a slice with an explicit arity.
pub fn dynamic<V, F>(arity: usize, f: F) -> Dynamic<F>
where
    F: Fn(usize, &[Slot<V>]) + Send + Sync + 'static,
{
    Dynamic { arity, f }
}

impl<V, const N: usize, F> CombinedCallback<V> for Fixed<N, F>
where
    F: Fn(usize, &[Slot<V>; N]) + Send + Sync + 'static,
{
    fn arity(&self) -> usize {
        N
    }

    fn invoke(&self, index: usize, values: &[Slot<V>]) {
        match <&[Slot<V>; N]>::try_from(values) {
            Ok(values) => (self.f)(index, values),
            Err(_) => warn!(expected = N, actual = values.len(), "snapshot length mismatch"),
        }
    }
}

impl<V, F> CombinedCallback<V> for Dynamic<F>
where
    F: Fn(usize, &[Slot<V>]) + Send + Sync + 'static,
{
    fn arity(&self) -> usize {
        self.arity
    }

    fn invoke(&self, index: usize, values: &[Slot<V>]) {
        (self.f)(index, values)
    }
}

type SlotErrorHook = Arc<dyn Fn(usize, &ObserveError) + Send + Sync>;

/// Options for latest-value observation.
#[derive(Clone, Default)]
pub struct LatestOptions {
    receive_initial: bool,
    on_error: Option<SlotErrorHook>,
}

impl LatestOptions {
    /// Default options: no initial values, no error hook.
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate slots from the current values at registration.
    ///
    /// Initial values fill the slots silently: the first combined callback
    /// still fires on the first change after registration.
    pub fn receive_initial(mut self, receive: bool) -> Self {
        self.receive_initial = receive;
        self
    }

    /// Receive delivery errors with the affected index instead of having them
    /// logged. The subscription still ends and its slot turns Dead.
    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(usize, &ObserveError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

impl std::fmt::Debug for LatestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatestOptions")
            .field("receive_initial", &self.receive_initial)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// One index of the aggregator.
struct SlotEntry<V> {
    slot: Slot<V>,
    sealed: Option<CloseReason>,
    muted: bool,
    subscription: Option<Arc<SubscriptionCore>>,
}

struct AggregatorState<V> {
    entries: Vec<SlotEntry<V>>,
    pending: VecDeque<(usize, Vec<Slot<V>>)>,
    delivering: bool,
    /// Thread registering the pairs, until registration completes.
    constructing: Option<ThreadId>,
}

impl<V: Clone> AggregatorState<V> {
    fn snapshot(&self) -> Vec<Slot<V>> {
        self.entries.iter().map(|entry| entry.slot.clone()).collect()
    }

    /// Pop the next entry that may still be delivered.
    fn next_delivery(&mut self) -> Option<(usize, Vec<Slot<V>>)> {
        while let Some((index, snapshot)) = self.pending.pop_front() {
            if !self.entries[index].muted {
                return Some((index, snapshot));
            }
            trace!(index, "dropping queued delivery for cancelled slot");
        }
        None
    }
}

struct Aggregator<V> {
    state: Mutex<AggregatorState<V>>,
    callback: Box<dyn CombinedCallback<V>>,
    on_error: Option<SlotErrorHook>,
}

impl<V: Clone + Send + Sync + 'static> Aggregator<V> {
    fn new(len: usize, callback: Box<dyn CombinedCallback<V>>, on_error: Option<SlotErrorHook>) -> Self {
        let entries = (0..len)
            .map(|_| SlotEntry {
                slot: Slot::Unknown,
                sealed: None,
                muted: false,
                subscription: None,
            })
            .collect();
        Self {
            state: Mutex::new(AggregatorState {
                entries,
                pending: VecDeque::new(),
                delivering: false,
                constructing: Some(thread::current().id()),
            }),
            callback,
            on_error,
        }
    }

    fn install(&self, index: usize, subscription: Arc<SubscriptionCore>) {
        self.state.lock().entries[index].subscription = Some(subscription);
    }

    /// End registration and deliver anything other threads queued meanwhile.
    fn finish_construction(&self) {
        {
            let mut state = self.state.lock();
            state.constructing = None;
            if state.delivering || state.pending.is_empty() {
                return;
            }
            state.delivering = true;
        }
        self.drain();
    }

    /// Accept a change for `index` and deliver it (or queue it behind the
    /// running delivery).
    fn accept(&self, index: usize, value: V) {
        {
            let mut state = self.state.lock();
            let entry = &mut state.entries[index];
            if entry.sealed.is_some() {
                trace!(index, "change for sealed slot ignored");
                return;
            }
            entry.slot = Slot::Value(value);

            if state.constructing == Some(thread::current().id()) {
                return;
            }
            let snapshot = state.snapshot();
            state.pending.push_back((index, snapshot));
            if state.delivering || state.constructing.is_some() {
                return;
            }
            state.delivering = true;
        }
        self.drain();
    }

    /// Deliver queued entries until the queue is empty. Only the thread that
    /// set `delivering` runs this.
    fn drain(&self) {
        let guard = DrainGuard { state: &self.state };
        loop {
            let next = {
                let mut state = self.state.lock();
                let next = state.next_delivery();
                if next.is_none() {
                    state.delivering = false;
                }
                next
            };
            let Some((index, snapshot)) = next else {
                break;
            };
            self.callback.invoke(index, &snapshot);
        }
        std::mem::forget(guard);
    }

    /// Seal `index`. Cancelled slots keep their last value; others become Dead.
    ///
    /// A cancel or failure also mutes the index, including one already sealed
    /// by a teardown.
    fn seal(&self, index: usize, reason: CloseReason) {
        let mut state = self.state.lock();
        let entry = &mut state.entries[index];
        if reason != CloseReason::TargetGone {
            entry.muted = true;
        }
        if entry.sealed.is_some() {
            return;
        }
        entry.sealed = Some(reason);
        if reason != CloseReason::Cancelled {
            entry.slot = Slot::Dead;
        }
    }

    fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    fn snapshot(&self) -> Vec<Slot<V>> {
        self.state.lock().snapshot()
    }

    fn active_count(&self) -> usize {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.subscription.as_ref().is_some_and(|s| s.is_active()))
            .count()
    }
}

/// Releases the drainer role if the callback unwinds, so later changes are
/// still delivered. Entries still queued are discarded.
struct DrainGuard<'a, V> {
    state: &'a Mutex<AggregatorState<V>>,
}

impl<V> Drop for DrainGuard<'_, V> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        let discarded = state.pending.len();
        state.pending.clear();
        state.delivering = false;
        if discarded > 0 {
            warn!(discarded, "combined callback panicked, discarding queued deliveries");
        }
    }
}

/// Sink for one index of an aggregator.
struct SlotSink<V> {
    aggregator: Arc<Aggregator<V>>,
    index: usize,
    core: Arc<SubscriptionCore>,
}

impl<V: Clone + Send + Sync + 'static> Deliver<V> for SlotSink<V> {
    fn change(&self, _old: Option<V>, new: V) {
        self.aggregator.accept(self.index, new);
    }

    fn teardown(&self) {
        self.core.close(CloseReason::TargetGone);
    }

    fn fail(&self, error: ObserveError) {
        if !self.core.is_active() {
            return;
        }
        match &self.aggregator.on_error {
            Some(hook) => hook(self.index, &error),
            None => {
                warn!(index = self.index, id = %self.core.id(), %error, "delivery failed, cancelling slot");
            }
        }
        self.core.close(CloseReason::Failed);
    }
}

/// A running latest-value observation.
///
/// Holds one [`Handle`] per registered pair, in registration order. Dropping
/// this does not cancel anything: observation continues until every handle is
/// cancelled or every target is destroyed.
pub struct LatestObservation<V> {
    handles: Vec<Handle>,
    aggregator: Arc<Aggregator<V>>,
}

impl<V: Clone + Send + Sync + 'static> LatestObservation<V> {
    /// Handles in pair order. Null targets have a null handle.
    pub fn handles(&self) -> &[Handle] {
        &self.handles
    }

    /// Handle for pair `index`.
    pub fn handle(&self, index: usize) -> Option<Handle> {
        self.handles.get(index).copied()
    }

    /// Number of slots, always equal to the number of registered pairs.
    pub fn len(&self) -> usize {
        self.aggregator.len()
    }

    /// Always false: at least one pair is required.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current slot values.
    pub fn snapshot(&self) -> Vec<Slot<V>> {
        self.aggregator.snapshot()
    }

    /// Number of subscriptions still delivering.
    pub fn active_count(&self) -> usize {
        self.aggregator.active_count()
    }

    /// Cancel every subscription. No combined callback starts afterwards.
    pub fn cancel_all(&self) {
        registry::cancel_all(&self.handles);
    }

    /// Give up introspection and keep only the handles.
    pub fn into_handles(self) -> Vec<Handle> {
        self.handles
    }
}

impl<V> std::fmt::Debug for LatestObservation<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatestObservation")
            .field("handles", &self.handles)
            .finish_non_exhaustive()
    }
}

impl<P: NotificationProvider> Observer<P> {
    /// Observe every (target, path) pair and receive one combined callback
    /// per change, with default [`LatestOptions`].
    pub fn observe_latest<C>(
        &self,
        pairs: &[(Option<&Arc<P::Target>>, &str)],
        callback: C,
    ) -> Result<LatestObservation<P::Value>>
    where
        C: CombinedCallback<P::Value>,
    {
        self.observe_latest_with(pairs, LatestOptions::default(), callback)
    }

    /// Observe every (target, path) pair and receive one combined callback
    /// per change.
    ///
    /// Fails with [`ObserveError::NoPairs`] or [`ObserveError::ArityMismatch`]
    /// before subscribing anything. If a path fails to resolve, the pairs
    /// already subscribed are cancelled and the error is returned.
    ///
    /// Changes made by other threads while the pairs are being registered are
    /// delivered, in order, before this returns.
    pub fn observe_latest_with<C>(
        &self,
        pairs: &[(Option<&Arc<P::Target>>, &str)],
        options: LatestOptions,
        callback: C,
    ) -> Result<LatestObservation<P::Value>>
    where
        C: CombinedCallback<P::Value>,
    {
        if pairs.is_empty() {
            return Err(ObserveError::NoPairs);
        }
        let expected = callback.arity();
        if expected != pairs.len() {
            return Err(ObserveError::ArityMismatch {
                expected,
                actual: pairs.len(),
            });
        }

        let aggregator = Arc::new(Aggregator::new(
            pairs.len(),
            Box::new(callback),
            options.on_error.clone(),
        ));

        let mut handles = Vec::with_capacity(pairs.len());
        for (index, (target, path)) in pairs.iter().enumerate() {
            let Some(target) = target else {
                aggregator.seal(index, CloseReason::TargetGone);
                handles.push(Handle::null());
                continue;
            };
            match self.subscribe_slot(&aggregator, index, target, path, options.receive_initial) {
                Ok(handle) => handles.push(handle),
                Err(error) => {
                    registry::cancel_all(&handles);
                    return Err(error);
                }
            }
        }
        aggregator.finish_construction();

        Ok(LatestObservation {
            handles,
            aggregator,
        })
    }

    fn subscribe_slot(
        &self,
        aggregator: &Arc<Aggregator<P::Value>>,
        index: usize,
        target: &Arc<P::Target>,
        path: &str,
        receive_initial: bool,
    ) -> Result<Handle> {
        let weak = Arc::downgrade(aggregator);
        let core = SubscriptionCore::new(
            target,
            path,
            SubscriptionOptions {
                fire_immediately: receive_initial,
                want_old_and_new: false,
            },
            Some(Box::new(move |reason| {
                if let Some(aggregator) = weak.upgrade() {
                    aggregator.seal(index, reason);
                }
            })),
        );
        aggregator.install(index, Arc::clone(&core));

        let sink = SlotSink {
            aggregator: Arc::clone(aggregator),
            index,
            core: Arc::clone(&core),
        };
        self.attach(&core, target, path, EventSink::new(Arc::new(sink)))?;
        Ok(Handle::new(core.id()))
    }
}
