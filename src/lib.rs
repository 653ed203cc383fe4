#![deny(missing_docs)]

//! Callback-based observation of named properties.
//!
//! Two modes are provided: observing a single property of one object, and
//! observing a fixed list of (object, property) pairs with one combined
//! callback that receives the index of the value that changed plus a snapshot
//! of the latest value of every pair.
//!
//! Change detection itself comes from a [`NotificationProvider`]. The crate
//! ships [`MemoryProvider`] over [`PropertyObject`]; hosts with their own
//! object model implement the trait for it.
//!
//! # Quick Start
//!
//! ```ignore
//! use propwatch::{MemoryProvider, Observer, PropertyObject, Slot, fixed};
//!
//! let observer = Observer::new(MemoryProvider::new());
//! let button = PropertyObject::new("Button", [("title", "OK".to_string())]);
//! let field = PropertyObject::new("TextField", [("text", String::new())]);
//!
//! // Fires once right away with "OK", then on every change
//! let handle = observer.observe(Some(&button), "title", |title| {
//!     println!("title: {title}");
//! })?;
//!
//! // One callback for both values
//! let latest = observer.observe_latest(
//!     &[(Some(&button), "title"), (Some(&field), "text")],
//!     fixed(|index: usize, [title, text]: &[Slot<String>; 2]| {
//!         println!("{index} changed: {title:?} {text:?}");
//!     }),
//! )?;
//!
//! field.set("text", "hello".into())?;   // (1, [Unknown, Value("hello")])
//!
//! handle.cancel();
//! latest.cancel_all();
//! ```
//!
//! # Single observation
//!
//! ```ignore
//! // New values only, no immediate fire
//! observer.observe_with(Some(&obj), "x", ObserveOptions::new().fire_immediately(false), |v| { ... })?;
//!
//! // Previous and new value; the previous one is None when unknown
//! observer.observe_old_and_new(Some(&obj), "x", ObserveOptions::default(), |old, new| { ... })?;
//! ```
//!
//! # Latest values
//!
//! - Slots start [`Slot::Unknown`], hold [`Slot::Value`] after the first change
//!   and turn [`Slot::Dead`] when their target is destroyed.
//! - A cancelled handle freezes its slot at the last value.
//! - The callback never runs concurrently with itself. Changes arriving while
//!   it runs, from any thread or from inside the callback, are queued and
//!   delivered in order afterwards.
//! - The callback's arity must equal the number of pairs; [`fixed`] takes the
//!   arity from an array length, [`dynamic`] from a runtime value.
//!
//! # Lifetimes
//!
//! Targets are only held weakly. Callbacks should capture what they need by
//! value or as `Weak`: a callback that owns its own target keeps it alive
//! for as long as the observation lasts.

mod error;
mod latest;
mod observer;
mod provider;
mod registry;
mod store;
mod subscription;

// Core types
pub use latest::{CombinedCallback, Dynamic, Fixed, LatestObservation, LatestOptions, Slot};
pub use observer::{ObserveOptions, Observer};
pub use registry::{Handle, HandleGuard};
pub use subscription::{SubscriptionId, SubscriptionOptions, SubscriptionState};

// Key functions
pub use latest::{dynamic, fixed};
pub use registry::{cancel_all, live_subscriptions};

// Provider integration
pub use provider::{EventSink, NotificationProvider};
pub use store::{MemoryProvider, MemoryToken, PropertyObject};

pub use error::{ObserveError, Result};

#[cfg(test)]
mod tests;
