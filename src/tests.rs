/// End-to-end scenarios for single and latest-value observation
use crate::{
    Handle, LatestOptions, MemoryProvider, MemoryToken, NotificationProvider, ObserveError,
    ObserveOptions, Observer, PropertyObject, Slot, SubscriptionState, cancel_all, dynamic,
    fixed,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

// Values of mixed property types, the way a host object model would box them
#[derive(Clone, Debug, PartialEq)]
enum Val {
    Int(i64),
    Text(String),
}

fn text(s: &str) -> Val {
    Val::Text(s.to_owned())
}

type Calls = Arc<Mutex<Vec<(usize, Vec<Slot<Val>>)>>>;

fn recorder() -> Calls {
    Arc::new(Mutex::new(Vec::new()))
}

fn observer() -> Observer<MemoryProvider<Val>> {
    Observer::new(MemoryProvider::new())
}

fn object_a() -> Arc<PropertyObject<Val>> {
    PropertyObject::new("A", [("x", Val::Int(0))])
}

fn object_b() -> Arc<PropertyObject<Val>> {
    PropertyObject::new("B", [("y", text(""))])
}

/// Provider wrapper that counts subscribe calls
struct CountingProvider {
    inner: MemoryProvider<Val>,
    subscribes: AtomicUsize,
}

impl NotificationProvider for CountingProvider {
    type Target = PropertyObject<Val>;
    type Value = Val;
    type Token = MemoryToken<Val>;

    fn subscribe(
        &self,
        target: &Arc<PropertyObject<Val>>,
        path: &str,
        wants_initial: bool,
        sink: crate::EventSink<Val>,
    ) -> crate::Result<MemoryToken<Val>> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        self.inner.subscribe(target, path, wants_initial, sink)
    }

    fn unsubscribe(&self, token: &MemoryToken<Val>) {
        self.inner.unsubscribe(token);
    }
}

/// Provider wrapper that runs a closure on another thread while subscribing
/// to `path`
struct InterleavingProvider {
    inner: MemoryProvider<Val>,
    path: &'static str,
    during_subscribe: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl NotificationProvider for InterleavingProvider {
    type Target = PropertyObject<Val>;
    type Value = Val;
    type Token = MemoryToken<Val>;

    fn subscribe(
        &self,
        target: &Arc<PropertyObject<Val>>,
        path: &str,
        wants_initial: bool,
        sink: crate::EventSink<Val>,
    ) -> crate::Result<MemoryToken<Val>> {
        let interleaved = if path == self.path {
            self.during_subscribe.lock().take()
        } else {
            None
        };
        if let Some(f) = interleaved {
            thread::scope(|scope| {
                scope.spawn(f);
            });
        }
        self.inner.subscribe(target, path, wants_initial, sink)
    }

    fn unsubscribe(&self, token: &MemoryToken<Val>) {
        self.inner.unsubscribe(token);
    }
}

#[test]
fn latest_values_track_changes_and_teardown() {
    let observer = observer();
    let a = object_a();
    let b = object_b();
    let calls = recorder();

    let calls_clone = calls.clone();
    let observation = observer
        .observe_latest(
            &[(Some(&a), "x"), (Some(&b), "y")],
            fixed(move |index: usize, values: &[Slot<Val>; 2]| {
                calls_clone.lock().push((index, values.to_vec()));
            }),
        )
        .unwrap();
    assert_eq!(observation.len(), 2);
    assert!(calls.lock().is_empty());

    a.set("x", Val::Int(5)).unwrap();
    assert_eq!(
        calls.lock().last().cloned(),
        Some((0, vec![Slot::Value(Val::Int(5)), Slot::Unknown]))
    );

    b.set("y", text("z")).unwrap();
    assert_eq!(
        calls.lock().last().cloned(),
        Some((1, vec![Slot::Value(Val::Int(5)), Slot::Value(text("z"))]))
    );

    // Teardown is silent
    let b_handle = observation.handle(1).unwrap();
    drop(b);
    assert_eq!(calls.lock().len(), 2);
    assert_eq!(b_handle.state(), Some(SubscriptionState::TargetGone));
    b_handle.cancel();
    assert_eq!(b_handle.state(), Some(SubscriptionState::TargetGone));

    a.set("x", Val::Int(6)).unwrap();
    assert_eq!(
        calls.lock().last().cloned(),
        Some((0, vec![Slot::Value(Val::Int(6)), Slot::Dead]))
    );
    assert_eq!(calls.lock().len(), 3);
    assert_eq!(observation.len(), 2);
}

#[test]
fn arity_mismatch_creates_no_subscriptions() {
    let provider = Arc::new(CountingProvider {
        inner: MemoryProvider::new(),
        subscribes: AtomicUsize::new(0),
    });
    let observer = Observer::from_arc(provider.clone());
    let a = object_a();
    let b = object_b();
    let c = object_a();

    let result = observer.observe_latest(
        &[(Some(&a), "x"), (Some(&b), "y"), (Some(&c), "x")],
        fixed(|_: usize, _: &[Slot<Val>; 2]| {}),
    );

    assert_eq!(
        result.unwrap_err(),
        ObserveError::ArityMismatch {
            expected: 2,
            actual: 3
        }
    );
    assert_eq!(provider.subscribes.load(Ordering::SeqCst), 0);
    assert_eq!(a.observer_count("x"), 0);
}

#[test]
fn invalid_path_rolls_back_earlier_pairs() {
    let observer = observer();
    let a = object_a();
    let b = object_b();

    let result = observer.observe_latest(
        &[(Some(&a), "x"), (Some(&b), "missing")],
        fixed(|_: usize, _: &[Slot<Val>; 2]| {}),
    );

    assert_eq!(
        result.unwrap_err(),
        ObserveError::invalid_path("B", "missing")
    );
    assert_eq!(a.observer_count("x"), 0);
    assert_eq!(b.observer_count("y"), 0);
}

#[test]
fn null_target_slot_starts_dead() {
    let observer = observer();
    let a = object_a();
    let calls = recorder();

    let calls_clone = calls.clone();
    let observation = observer
        .observe_latest(
            &[(Some(&a), "x"), (None, "y")],
            fixed(move |index: usize, values: &[Slot<Val>; 2]| {
                calls_clone.lock().push((index, values.to_vec()));
            }),
        )
        .unwrap();

    assert!(observation.handle(1).unwrap().is_null());
    assert_eq!(observation.snapshot(), vec![Slot::Unknown, Slot::Dead]);

    a.set("x", Val::Int(1)).unwrap();
    assert_eq!(
        *calls.lock(),
        vec![(0, vec![Slot::Value(Val::Int(1)), Slot::Dead])]
    );
}

#[test]
fn cancelled_slot_keeps_last_value() {
    let observer = observer();
    let a = object_a();
    let b = object_b();
    let calls = recorder();

    let calls_clone = calls.clone();
    let observation = observer
        .observe_latest(
            &[(Some(&a), "x"), (Some(&b), "y")],
            fixed(move |index: usize, values: &[Slot<Val>; 2]| {
                calls_clone.lock().push((index, values.to_vec()));
            }),
        )
        .unwrap();

    b.set("y", text("kept")).unwrap();
    observation.handles()[1].cancel();
    assert_eq!(b.observer_count("y"), 0);
    assert_eq!(observation.active_count(), 1);

    b.set("y", text("ignored")).unwrap();
    a.set("x", Val::Int(2)).unwrap();

    let calls = calls.lock();
    assert_eq!(calls.len(), 2);
    assert_eq!(
        calls[1],
        (0, vec![Slot::Value(Val::Int(2)), Slot::Value(text("kept"))])
    );
}

#[test]
fn cancel_all_stops_every_callback() {
    let observer = observer();
    let a = object_a();
    let b = object_b();
    let count = Arc::new(AtomicUsize::new(0));

    let count_clone = count.clone();
    let observation = observer
        .observe_latest(
            &[(Some(&a), "x"), (Some(&b), "y")],
            fixed(move |_: usize, _: &[Slot<Val>; 2]| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    a.set("x", Val::Int(1)).unwrap();
    cancel_all(observation.handles());
    cancel_all(observation.handles());

    a.set("x", Val::Int(2)).unwrap();
    b.set("y", text("q")).unwrap();

    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(observation.active_count(), 0);
    assert_eq!(a.observer_count("x"), 0);
}

#[test]
fn reentrant_change_is_queued_until_callback_returns() {
    let observer = observer();
    let a = object_a();
    let b = object_b();
    let log = Arc::new(Mutex::new(Vec::new()));

    let log_clone = log.clone();
    let weak_b = Arc::downgrade(&b);
    let _observation = observer
        .observe_latest(
            &[(Some(&a), "x"), (Some(&b), "y")],
            fixed(move |index: usize, values: &[Slot<Val>; 2]| {
                log_clone.lock().push(format!("enter {index}"));
                if index == 0 {
                    if let Some(b) = weak_b.upgrade() {
                        b.set("y", text("from callback")).unwrap();
                        b.set("y", text("again")).unwrap();
                    }
                }
                log_clone.lock().push(format!("exit {index} {:?}", values[1]));
            }),
        )
        .unwrap();

    a.set("x", Val::Int(1)).unwrap();

    assert_eq!(
        *log.lock(),
        vec![
            "enter 0".to_string(),
            "exit 0 Unknown".to_string(),
            "enter 1".to_string(),
            format!("exit 1 {:?}", Slot::Value(text("from callback"))),
            "enter 1".to_string(),
            format!("exit 1 {:?}", Slot::Value(text("again"))),
        ]
    );
}

#[test]
fn combined_callback_never_runs_concurrently() {
    const THREADS: usize = 4;
    const SETS: usize = 200;

    let observer = observer();
    let objects: Vec<_> = (0..THREADS).map(|_| object_a()).collect();
    let inside = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));

    let pairs: Vec<_> = objects.iter().map(|o| (Some(o), "x")).collect();
    let (inside_clone, overlaps_clone, calls_clone) =
        (inside.clone(), overlaps.clone(), calls.clone());
    let observation = observer
        .observe_latest(
            &pairs,
            dynamic(THREADS, move |_: usize, values: &[Slot<Val>]| {
                if inside_clone.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlaps_clone.fetch_add(1, Ordering::SeqCst);
                }
                assert_eq!(values.len(), THREADS);
                thread::yield_now();
                calls_clone.fetch_add(1, Ordering::SeqCst);
                inside_clone.fetch_sub(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    let barrier = Barrier::new(THREADS);
    thread::scope(|scope| {
        for object in &objects {
            let barrier = &barrier;
            scope.spawn(move || {
                barrier.wait();
                for i in 0..SETS {
                    object.set("x", Val::Int(i as i64)).unwrap();
                }
            });
        }
    });

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    assert_eq!(calls.load(Ordering::SeqCst), THREADS * SETS);
    let expected = Slot::Value(Val::Int(SETS as i64 - 1));
    assert!(observation.snapshot().iter().all(|slot| *slot == expected));
}

#[test]
fn cancel_from_another_thread_stops_delivery() {
    let observer = observer();
    let a = object_a();
    let count = Arc::new(AtomicUsize::new(0));

    let count_clone = count.clone();
    let observation = observer
        .observe_latest(
            &[(Some(&a), "x")],
            fixed(move |_: usize, _: &[Slot<Val>; 1]| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
    let handle = observation.handle(0).unwrap();

    let barrier = Barrier::new(2);
    let at_cancel = thread::scope(|scope| {
        scope.spawn(|| {
            barrier.wait();
            for i in 0..1_000 {
                a.set("x", Val::Int(i)).unwrap();
            }
        });
        barrier.wait();
        thread::yield_now();
        handle.cancel();
        count.load(Ordering::SeqCst)
    });

    // At most one invocation that was already dequeued may finish afterwards
    assert!(count.load(Ordering::SeqCst) <= at_cancel + 1);
    assert!(!handle.is_active());
}

#[test]
fn teardown_marks_only_its_own_slot() {
    let observer = observer();
    let a = object_a();
    let b = object_b();
    let c = object_a();

    let observation = observer
        .observe_latest(
            &[(Some(&a), "x"), (Some(&b), "y"), (Some(&c), "x")],
            dynamic(3, |_: usize, _: &[Slot<Val>]| {}),
        )
        .unwrap();

    a.set("x", Val::Int(1)).unwrap();
    b.set("y", text("b")).unwrap();
    c.set("x", Val::Int(3)).unwrap();
    drop(b);

    assert_eq!(
        observation.snapshot(),
        vec![
            Slot::Value(Val::Int(1)),
            Slot::Dead,
            Slot::Value(Val::Int(3)),
        ]
    );
    assert_eq!(observation.active_count(), 2);
}

#[test]
fn large_pair_counts_are_supported() {
    const PAIRS: usize = 32;

    let observer = observer();
    let objects: Vec<_> = (0..PAIRS).map(|_| object_a()).collect();
    let pairs: Vec<_> = objects.iter().map(|o| (Some(o), "x")).collect();
    let last = Arc::new(Mutex::new(None));

    let last_clone = last.clone();
    let observation = observer
        .observe_latest(
            &pairs,
            fixed(move |index: usize, values: &[Slot<Val>; PAIRS]| {
                *last_clone.lock() = Some((index, values[index].clone()));
            }),
        )
        .unwrap();

    objects[20].set("x", Val::Int(20)).unwrap();
    assert_eq!(*last.lock(), Some((20, Slot::Value(Val::Int(20)))));
    assert_eq!(observation.len(), PAIRS);
}

#[test]
fn single_and_latest_observers_share_a_target() {
    let observer = observer();
    let a = object_a();
    let single = Arc::new(Mutex::new(Vec::new()));
    let combined = recorder();

    let single_clone = single.clone();
    let handle = observer
        .observe_with(
            Some(&a),
            "x",
            ObserveOptions::new().fire_immediately(false),
            move |v: &Val| single_clone.lock().push(v.clone()),
        )
        .unwrap();
    let combined_clone = combined.clone();
    let _observation = observer
        .observe_latest_with(
            &[(Some(&a), "x")],
            LatestOptions::new().receive_initial(true),
            fixed(move |index: usize, values: &[Slot<Val>; 1]| {
                combined_clone.lock().push((index, values.to_vec()));
            }),
        )
        .unwrap();

    assert_eq!(a.observer_count("x"), 2);
    a.set("x", Val::Int(7)).unwrap();

    assert_eq!(*single.lock(), vec![Val::Int(7)]);
    assert_eq!(
        *combined.lock(),
        vec![(0, vec![Slot::Value(Val::Int(7))])]
    );
    assert_eq!(handle.options().map(|o| o.fire_immediately), Some(false));
}

#[test]
fn observation_does_not_keep_targets_alive() {
    let observer = observer();
    let a = object_a();
    let weak_a = Arc::downgrade(&a);

    let single = observer.observe(Some(&a), "x", |_| {}).unwrap();
    let observation = observer
        .observe_latest(&[(Some(&a), "x")], fixed(|_: usize, _: &[Slot<Val>; 1]| {}))
        .unwrap();

    drop(a);
    assert!(weak_a.upgrade().is_none());
    assert!(!single.is_active());
    assert_eq!(observation.snapshot(), vec![Slot::Dead]);
}

#[test]
fn change_queued_before_teardown_is_still_delivered() {
    let observer = observer();
    let a = object_a();
    let b = object_b();
    let calls = recorder();

    let pairs = [(Some(&a), "x"), (Some(&b), "y")];
    let holder = Arc::new(Mutex::new(None::<Arc<PropertyObject<Val>>>));
    let (calls_clone, holder_clone) = (calls.clone(), holder.clone());
    let observation = observer
        .observe_latest(
            &pairs,
            fixed(move |index: usize, values: &[Slot<Val>; 2]| {
                calls_clone.lock().push((index, values.to_vec()));
                if index == 0 {
                    let b = holder_clone.lock().take();
                    if let Some(b) = b {
                        b.set("y", text("queued")).unwrap();
                        drop(b);
                    }
                }
            }),
        )
        .unwrap();
    *holder.lock() = Some(b);

    a.set("x", Val::Int(1)).unwrap();

    assert_eq!(
        *calls.lock(),
        vec![
            (0, vec![Slot::Value(Val::Int(1)), Slot::Unknown]),
            (1, vec![Slot::Value(Val::Int(1)), Slot::Value(text("queued"))]),
        ]
    );
    assert_eq!(
        observation.snapshot(),
        vec![Slot::Value(Val::Int(1)), Slot::Dead]
    );
}

#[test]
fn cancel_all_drops_entries_queued_for_torn_down_slots() {
    let observer = observer();
    let a = object_a();
    let b = object_b();
    let calls = recorder();
    let after_cancel = Arc::new(AtomicUsize::new(0));
    let cancelled = Arc::new(AtomicBool::new(false));

    let pairs = [(Some(&a), "x"), (Some(&b), "y")];
    let holder = Arc::new(Mutex::new(None::<Arc<PropertyObject<Val>>>));
    let handles: Arc<Mutex<Vec<Handle>>> = Arc::new(Mutex::new(Vec::new()));
    let (calls_clone, holder_clone, handles_clone) =
        (calls.clone(), holder.clone(), handles.clone());
    let (after_cancel_clone, cancelled_clone) = (after_cancel.clone(), cancelled.clone());
    let observation = observer
        .observe_latest(
            &pairs,
            fixed(move |index: usize, values: &[Slot<Val>; 2]| {
                if cancelled_clone.load(Ordering::SeqCst) {
                    after_cancel_clone.fetch_add(1, Ordering::SeqCst);
                }
                calls_clone.lock().push((index, values.to_vec()));
                if index == 0 {
                    let b = holder_clone.lock().take();
                    if let Some(b) = b {
                        b.set("y", text("queued")).unwrap();
                        drop(b);
                    }
                    let handles = handles_clone.lock().clone();
                    cancel_all(&handles);
                    cancelled_clone.store(true, Ordering::SeqCst);
                }
            }),
        )
        .unwrap();
    *holder.lock() = Some(b);
    *handles.lock() = observation.handles().to_vec();

    a.set("x", Val::Int(1)).unwrap();
    a.set("x", Val::Int(2)).unwrap();

    assert_eq!(after_cancel.load(Ordering::SeqCst), 0);
    assert_eq!(
        *calls.lock(),
        vec![(0, vec![Slot::Value(Val::Int(1)), Slot::Unknown])]
    );
    // The torn-down slot keeps its teardown state
    assert_eq!(
        observation.handle(1).unwrap().state(),
        Some(SubscriptionState::TargetGone)
    );
}

#[test]
fn cancel_drops_entries_already_queued_for_that_index() {
    let observer = observer();
    let a = object_a();
    let b = object_b();
    let calls = recorder();

    let handles: Arc<Mutex<Vec<Handle>>> = Arc::new(Mutex::new(Vec::new()));
    let weak_b = Arc::downgrade(&b);
    let (calls_clone, handles_clone) = (calls.clone(), handles.clone());
    let observation = observer
        .observe_latest(
            &[(Some(&a), "x"), (Some(&b), "y")],
            fixed(move |index: usize, values: &[Slot<Val>; 2]| {
                calls_clone.lock().push((index, values.to_vec()));
                if index == 0 {
                    if let Some(b) = weak_b.upgrade() {
                        b.set("y", text("queued")).unwrap();
                    }
                    let handle = handles_clone.lock()[1];
                    handle.cancel();
                }
            }),
        )
        .unwrap();
    *handles.lock() = observation.handles().to_vec();

    a.set("x", Val::Int(1)).unwrap();
    a.set("x", Val::Int(2)).unwrap();

    // The slot keeps the value it accepted before the cancel, without a callback
    assert_eq!(
        *calls.lock(),
        vec![
            (0, vec![Slot::Value(Val::Int(1)), Slot::Unknown]),
            (0, vec![Slot::Value(Val::Int(2)), Slot::Value(text("queued"))]),
        ]
    );
}

#[test]
fn changes_from_other_threads_during_registration_are_delivered() {
    let a = object_a();
    let b = object_b();
    let a_clone = a.clone();
    let set_a: Box<dyn FnOnce() + Send> = Box::new(move || {
        a_clone.set("x", Val::Int(5)).unwrap();
    });
    let provider = InterleavingProvider {
        inner: MemoryProvider::new(),
        path: "y",
        during_subscribe: Mutex::new(Some(set_a)),
    };
    let observer = Observer::new(provider);
    let calls = recorder();

    let calls_clone = calls.clone();
    let _observation = observer
        .observe_latest(
            &[(Some(&a), "x"), (Some(&b), "y")],
            fixed(move |index: usize, values: &[Slot<Val>; 2]| {
                calls_clone.lock().push((index, values.to_vec()));
            }),
        )
        .unwrap();

    assert_eq!(
        *calls.lock(),
        vec![(0, vec![Slot::Value(Val::Int(5)), Slot::Unknown])]
    );
}
