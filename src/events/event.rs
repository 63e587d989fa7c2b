//! # The event object.
//!
//! [`Event`] is the short-lived value passed to every listener of one
//! dispatch call. It carries the originating source, the listener kind it
//! targets (as a type parameter), the mutable `handled` flag that aborts
//! delegation, an optional property bag, and — while being dispatched — a
//! back-reference to the source that supplied its listeners plus the list of
//! events suppressed on its behalf by the cascade guard.
//!
//! ## Lifecycle
//! Create the event immediately before dispatch, wrap it in an `Arc`, pass
//! it to `dispatch`, and discard it when the call returns. An event instance
//! is used for exactly one top-level dispatch call; reuse is undefined
//! behavior by design.
//!
//! ## Threading
//! All mutation goes through atomics or internal locks, so a shared
//! `Arc<Event>` is safe to hand to parallel dispatch tasks. Note that the
//! `handled` flag is only a reliable delegation abort on sequential engines.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::error::EngineError;
use crate::events::stack::{ActiveEvent, SuppressedEvent};
use crate::listeners::{ListenerEntry, ListenerKind, ListenerSource, Tag};

type PropertyBag = Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>;

/// One dispatchable event targeting listeners of kind `K`.
pub struct Event<S, K: ListenerKind> {
    source: Option<S>,
    handled: AtomicBool,
    prevented: AtomicBool,
    properties: OnceLock<PropertyBag>,
    dispatching: OnceLock<Arc<dyn ListenerSource>>,
    suppressed: Mutex<Vec<SuppressedEvent>>,
    _kind: PhantomData<fn() -> K>,
}

impl<S, K> Event<S, K>
where
    S: Send + Sync + 'static,
    K: ListenerKind,
{
    /// Creates a new event with the given source.
    pub fn new(source: S) -> Self {
        Self {
            source: Some(source),
            handled: AtomicBool::new(false),
            prevented: AtomicBool::new(false),
            properties: OnceLock::new(),
            dispatching: OnceLock::new(),
            suppressed: Mutex::new(Vec::new()),
            _kind: PhantomData,
        }
    }

    /// Creates a new event without a source.
    pub fn without_source() -> Self {
        Self {
            source: None,
            handled: AtomicBool::new(false),
            prevented: AtomicBool::new(false),
            properties: OnceLock::new(),
            dispatching: OnceLock::new(),
            suppressed: Mutex::new(Vec::new()),
            _kind: PhantomData,
        }
    }

    /// The source of this event, if any.
    pub fn source(&self) -> Option<&S> {
        self.source.as_ref()
    }

    /// The tag of the listener kind this event targets.
    pub fn tag(&self) -> Tag {
        Tag::of::<K>()
    }

    /// Whether this event was already handled. Once `true`, no further
    /// listeners are notified in the current dispatch call.
    pub fn is_handled(&self) -> bool {
        self.handled.load(Ordering::SeqCst)
    }

    /// Marks this event handled. On sequential engines, remaining listeners
    /// are skipped; on non-sequential engines the effect is best-effort.
    pub fn set_handled(&self, handled: bool) {
        self.handled.store(handled, Ordering::SeqCst);
    }

    /// Whether the cascade guard prevented this event the last time it was
    /// passed to a dispatch method.
    pub fn is_prevented(&self) -> bool {
        self.prevented.load(Ordering::SeqCst)
    }

    pub(crate) fn set_prevented(&self, prevented: bool) {
        self.prevented.store(prevented, Ordering::SeqCst);
    }

    /// Stores a key/value pair on this event.
    ///
    /// Explicit typed fields on a dedicated event type are preferred; the
    /// bag exists for attaching data to events whose type you cannot change.
    pub fn set_value(&self, key: impl Into<String>, value: impl Any + Send + Sync) {
        self.properties
            .get_or_init(Default::default)
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), Box::new(value));
    }

    /// Retrieves a clone of a value stored via [`Event::set_value`].
    pub fn value<T: Any + Clone>(&self, key: &str) -> Option<T> {
        let bag = self.properties.get()?;
        let bag = bag.lock().unwrap_or_else(PoisonError::into_inner);
        bag.get(key).and_then(|v| v.downcast_ref::<T>()).cloned()
    }

    /// The source from which the currently notified listeners were supplied.
    ///
    /// Only valid while the event is being dispatched; otherwise
    /// [`EngineError::IllegalState`].
    pub fn dispatching_source(&self) -> Result<Arc<dyn ListenerSource>, EngineError> {
        self.dispatching
            .get()
            .cloned()
            .ok_or(EngineError::IllegalState("event is not currently dispatched"))
    }

    /// Removes `listener` from the source that supplied this dispatch round,
    /// so it is no longer notified on subsequent rounds. Has no effect on the
    /// round already in progress — the engine iterates a snapshot.
    pub fn stop_notifying(&self, listener: &Arc<K::Listener>) -> Result<(), EngineError> {
        let source = self.dispatching_source()?;
        source.remove_entry(self.tag(), ListenerEntry::address::<K>(listener));
        Ok(())
    }

    /// Binds the dispatching source. Set-once: the first writer wins, so a
    /// wrapping engine's source is not overridden by an inner one.
    pub(crate) fn bind_source(&self, source: Arc<dyn ListenerSource>) {
        let _ = self.dispatching.set(source);
    }

    /// Drains the events suppressed on behalf of this one, in suppression
    /// order. Called once, after the outermost frame for the tag popped.
    pub(crate) fn take_suppressed(&self) -> Vec<SuppressedEvent> {
        std::mem::take(&mut *self.suppressed.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl<S, K> ActiveEvent for Event<S, K>
where
    S: Send + Sync + 'static,
    K: ListenerKind,
{
    fn push_suppressed(&self, suppressed: SuppressedEvent) {
        self.suppressed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(suppressed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listeners::{Listener, ListenerRegistry};

    struct Ping;
    impl ListenerKind for Ping {
        type Listener = dyn Listener + Send + Sync;
    }

    #[test]
    fn starts_unhandled_and_unprevented() {
        let event: Event<(), Ping> = Event::without_source();
        assert!(!event.is_handled());
        assert!(!event.is_prevented());
        event.set_handled(true);
        assert!(event.is_handled());
    }

    #[test]
    fn property_bag_round_trip() {
        let event: Event<(), Ping> = Event::without_source();
        assert_eq!(event.value::<u32>("count"), None);
        event.set_value("count", 7u32);
        assert_eq!(event.value::<u32>("count"), Some(7));
        // Wrong type yields None, not a panic.
        assert_eq!(event.value::<String>("count"), None);
    }

    #[test]
    fn dispatching_source_is_set_once() {
        let event: Event<(), Ping> = Event::without_source();
        assert!(matches!(
            event.dispatching_source(),
            Err(EngineError::IllegalState(_))
        ));

        let first = ListenerRegistry::new();
        let second = ListenerRegistry::new();
        event.bind_source(first.clone());
        event.bind_source(second);

        let bound = event.dispatching_source().expect("bound");
        assert!(Arc::ptr_eq(&bound, &(first as Arc<dyn ListenerSource>)));
    }

    #[test]
    fn source_is_exposed() {
        let event: Event<String, Ping> = Event::new("origin".to_string());
        assert_eq!(event.source().map(String::as_str), Some("origin"));
    }
}
