//! # Listener supply abstraction.
//!
//! [`ListenerSource`] is the seam between the dispatch engine and listener
//! storage: the engine only ever asks a source for a snapshot of the entries
//! registered under one [`Tag`]. Sources must be safe to mutate while a
//! snapshot is being iterated; the snapshot itself is immutable.
//!
//! ## The cast boundary
//! Storage is type-erased. [`ListenerEntry`] holds the registered
//! `Arc<K::Listener>` behind `dyn Any`; [`ListenerEntry::downcast`] is the
//! single unchecked-cast point of the crate, guarded by the invariant that
//! every entry stored under tag `K` was inserted through a method generic
//! over the same `K`.

use std::any::Any;
use std::sync::Arc;

use crate::error::ListenerError;
use crate::listeners::listener::{Listener, ListenerKind, Tag};

/// Carries registration details to the [`Listener::on_register`] and
/// [`Listener::on_unregister`] lifecycle hooks.
#[derive(Clone, Copy, Debug)]
pub struct RegistrationEvent {
    tag: Tag,
}

impl RegistrationEvent {
    pub(crate) fn new(tag: Tag) -> Self {
        Self { tag }
    }

    /// The tag the listener was registered under.
    pub fn tag(&self) -> Tag {
        self.tag
    }
}

/// One registered listener, type-erased for storage.
///
/// Invariant: an entry stored under tag `K` always downcasts to
/// `Arc<K::Listener>`.
#[derive(Clone)]
pub struct ListenerEntry {
    /// The registered `Arc<K::Listener>` behind `dyn Any`.
    cast: Arc<dyn Any + Send + Sync>,
    /// Address of the listener allocation; identity for removal.
    addr: usize,
    /// Captured unregistration hook, typed at insertion time.
    unregister: Arc<dyn Fn(&RegistrationEvent) -> Result<(), ListenerError> + Send + Sync>,
}

impl ListenerEntry {
    /// Wraps a listener for storage under kind `K`.
    pub fn new<K: ListenerKind>(listener: Arc<K::Listener>) -> Self {
        let addr = Self::address::<K>(&listener);
        let hook = Arc::clone(&listener);
        Self {
            cast: Arc::new(listener),
            addr,
            unregister: Arc::new(move |ev| hook.on_unregister(ev)),
        }
    }

    /// Stable identity of a listener: the address of its allocation.
    pub fn address<K: ListenerKind>(listener: &Arc<K::Listener>) -> usize {
        Arc::as_ptr(listener).cast::<()>() as usize
    }

    /// Recovers the typed listener. Returns `None` only if the storage
    /// invariant was violated, which is a bug in the source implementation.
    pub fn downcast<K: ListenerKind>(&self) -> Option<Arc<K::Listener>> {
        self.cast.downcast_ref::<Arc<K::Listener>>().cloned()
    }

    pub(crate) fn addr(&self) -> usize {
        self.addr
    }

    /// The stored listener in its erased form, for failure reports.
    pub(crate) fn erased(&self) -> Arc<dyn Any + Send + Sync> {
        Arc::clone(&self.cast)
    }

    pub(crate) fn fire_unregister(&self, event: &RegistrationEvent) -> Result<(), ListenerError> {
        (self.unregister)(event)
    }
}

/// Supplies listeners to a dispatch engine.
///
/// Implementations must tolerate concurrent mutation during notification:
/// [`ListenerSource::snapshot`] returns a copy that stays valid for one
/// notification round regardless of later `add`/`remove` calls.
pub trait ListenerSource: Send + Sync {
    /// Snapshot of the entries registered under `tag`, in notification order.
    fn snapshot(&self, tag: Tag) -> Vec<ListenerEntry>;

    /// Whether snapshots preserve registration order. Sources that reorder
    /// (e.g. by priority) return `false`, which disables the engine's
    /// sequential guarantee.
    fn is_sequential(&self) -> bool;

    /// Thread-safe view backed by the same state. Natively thread-safe
    /// sources return themselves; repeated calls return the same instance.
    fn synchronized_view(self: Arc<Self>) -> Arc<dyn ListenerSource>;

    /// Removes the first entry under `tag` whose listener allocation sits at
    /// `addr`; no-op if absent. Fires the unregistration hook best-effort.
    ///
    /// This is the erased backend of `Event::stop_notifying`.
    fn remove_entry(&self, tag: Tag, addr: usize);
}
