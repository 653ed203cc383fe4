//! In-memory property objects and the provider that observes them.
//!
//! [`PropertyObject`] is a named bag of declared properties. Setting a
//! property notifies every registered sink for that key; dropping the object
//! delivers one teardown to every live registration. [`MemoryProvider`]
//! implements [`NotificationProvider`] on top of it.
//!
//! Sinks are always invoked after the object's lock is released, so callbacks
//! may read, set, observe or cancel freely.

use crate::error::{ObserveError, Result};
use crate::provider::{EventSink, NotificationProvider};
use indexmap::IndexMap;
use parking_lot::Mutex;
use slab::Slab;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

/// A registered observer of one property.
struct Registration<V> {
    key: String,
    serial: u64,
    sink: EventSink<V>,
}

struct ObjectState<V> {
    properties: IndexMap<String, V>,
    observers: Slab<Registration<V>>,
    next_serial: u64,
}

impl<V: Clone> ObjectState<V> {
    fn sinks_for(&self, key: &str) -> Vec<EventSink<V>> {
        self.observers
            .iter()
            .filter(|(_, registration)| registration.key == key)
            .map(|(_, registration)| registration.sink.clone())
            .collect()
    }
}

/// An observable object with a fixed set of named properties.
pub struct PropertyObject<V> {
    type_name: String,
    state: Mutex<ObjectState<V>>,
}

impl<V: Clone + Send + Sync + 'static> PropertyObject<V> {
    /// Create an object of kind `type_name` with the given properties, in
    /// declaration order.
    pub fn new<K, I>(type_name: impl Into<String>, properties: I) -> Arc<Self>
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Arc::new(Self {
            type_name: type_name.into(),
            state: Mutex::new(ObjectState {
                properties: properties
                    .into_iter()
                    .map(|(key, value)| (key.into(), value))
                    .collect(),
                observers: Slab::new(),
                next_serial: 0,
            }),
        })
    }

    /// Object kind, used in error messages.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Current value of `key`.
    pub fn get(&self, key: &str) -> Option<V> {
        self.state.lock().properties.get(key).cloned()
    }

    /// Declared property names, in declaration order.
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().properties.keys().cloned().collect()
    }

    /// Set `key` and notify its observers on the calling thread.
    pub fn set(&self, key: &str, value: V) -> Result<()> {
        self.update(key, move |current| *current = value)
    }

    /// Mutate `key` in place, then notify its observers with the old and new
    /// values.
    pub fn update<F>(&self, key: &str, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut V),
    {
        let (old, new, sinks) = {
            let mut state = self.state.lock();
            let Some(current) = state.properties.get_mut(key) else {
                return Err(ObserveError::invalid_path(&self.type_name, key));
            };
            let old = current.clone();
            mutate(current);
            let new = current.clone();
            (old, new, state.sinks_for(key))
        };

        for sink in sinks {
            sink.change(Some(old.clone()), new.clone());
        }
        Ok(())
    }

    /// Remove `key` from the object. Its observers receive an
    /// [`ObserveError::InvalidPath`] delivery error and are dropped.
    pub fn retract(&self, key: &str) -> Option<V> {
        let (value, registrations) = {
            let mut state = self.state.lock();
            let value = state.properties.shift_remove(key)?;
            let keys: Vec<usize> = state
                .observers
                .iter()
                .filter(|(_, registration)| registration.key == key)
                .map(|(slot, _)| slot)
                .collect();
            let registrations: Vec<_> = keys
                .into_iter()
                .map(|slot| state.observers.remove(slot))
                .collect();
            (value, registrations)
        };

        for registration in registrations {
            registration
                .sink
                .fail(ObserveError::invalid_path(&self.type_name, key));
        }
        Some(value)
    }

    /// Number of live registrations for `key`.
    pub fn observer_count(&self, key: &str) -> usize {
        self.state
            .lock()
            .observers
            .iter()
            .filter(|(_, registration)| registration.key == key)
            .count()
    }

    fn register(&self, key: &str, sink: EventSink<V>) -> Result<(usize, u64, V)> {
        let mut state = self.state.lock();
        let Some(current) = state.properties.get(key).cloned() else {
            return Err(ObserveError::invalid_path(&self.type_name, key));
        };
        let serial = state.next_serial;
        state.next_serial += 1;
        let slot = state.observers.insert(Registration {
            key: key.to_owned(),
            serial,
            sink,
        });
        Ok((slot, serial, current))
    }

    fn deregister(&self, slot: usize, serial: u64) {
        let removed = {
            let mut state = self.state.lock();
            match state.observers.get(slot) {
                Some(registration) if registration.serial == serial => {
                    Some(state.observers.remove(slot))
                }
                _ => None,
            }
        };
        // Dropped outside the lock: the sink owns user callbacks
        drop(removed);
    }
}

impl<V> Drop for PropertyObject<V> {
    fn drop(&mut self) {
        let registrations: Vec<_> = self.state.get_mut().observers.drain().collect();
        for registration in registrations {
            registration.sink.teardown();
        }
    }
}

impl<V: fmt::Debug> fmt::Debug for PropertyObject<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PropertyObject")
            .field("type_name", &self.type_name)
            .field("properties", &state.properties)
            .field("observers", &state.observers.len())
            .finish()
    }
}

/// Registration token issued by [`MemoryProvider`].
pub struct MemoryToken<V> {
    object: Weak<PropertyObject<V>>,
    slot: usize,
    serial: u64,
}

impl<V> fmt::Debug for MemoryToken<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryToken")
            .field("slot", &self.slot)
            .field("serial", &self.serial)
            .finish()
    }
}

/// [`NotificationProvider`] for [`PropertyObject`]s.
///
/// Changes are delivered synchronously on the thread that sets the property.
pub struct MemoryProvider<V> {
    _marker: PhantomData<fn() -> V>,
}

impl<V> MemoryProvider<V> {
    /// Create a provider.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<V> Default for MemoryProvider<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> fmt::Debug for MemoryProvider<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryProvider").finish()
    }
}

impl<V: Clone + Send + Sync + 'static> NotificationProvider for MemoryProvider<V> {
    type Target = PropertyObject<V>;
    type Value = V;
    type Token = MemoryToken<V>;

    fn subscribe(
        &self,
        target: &Arc<PropertyObject<V>>,
        path: &str,
        wants_initial: bool,
        sink: EventSink<V>,
    ) -> Result<MemoryToken<V>> {
        let initial_sink = wants_initial.then(|| sink.clone());
        let (slot, serial, current) = target.register(path, sink)?;

        if let Some(sink) = initial_sink {
            sink.change(None, current);
        }

        Ok(MemoryToken {
            object: Arc::downgrade(target),
            slot,
            serial,
        })
    }

    fn unsubscribe(&self, token: &MemoryToken<V>) {
        if let Some(object) = token.object.upgrade() {
            object.deregister(token.slot, token.serial);
        }
    }
}
