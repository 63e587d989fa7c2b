//! # Priority-ordered listener source.
//!
//! [`PriorityRegistry`] notifies listeners with a lower priority value first;
//! within one priority, insertion order is preserved. Because snapshots do
//! not follow registration order, this source reports
//! `is_sequential() == false` and any engine using it loses its sequential
//! guarantee.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

use crate::callbacks::{ExceptionCallback, FailedInvocation, FailureSite, LogCallback};
use crate::error::ListenerError;
use crate::listeners::listener::{Listener as _, ListenerKind, Tag};
use crate::listeners::source::{ListenerEntry, ListenerSource, RegistrationEvent};

/// Priority assigned when none is given explicitly.
pub const DEFAULT_PRIORITY: u32 = 100;

struct Ranked {
    priority: u32,
    seq: u64,
    entry: ListenerEntry,
}

/// Listener storage ordered by explicit priority, then insertion.
pub struct PriorityRegistry {
    listeners: RwLock<HashMap<Tag, Vec<Ranked>>>,
    next_seq: RwLock<u64>,
    callback: RwLock<Arc<dyn ExceptionCallback>>,
}

impl PriorityRegistry {
    /// Creates an empty priority registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: RwLock::new(HashMap::new()),
            next_seq: RwLock::new(0),
            callback: RwLock::new(Arc::new(LogCallback)),
        })
    }

    /// Appends `listener` under kind `K` with [`DEFAULT_PRIORITY`].
    pub fn add<K: ListenerKind>(&self, listener: Arc<K::Listener>) {
        self.add_with_priority::<K>(listener, DEFAULT_PRIORITY);
    }

    /// Appends `listener` under kind `K`; lower `priority` is notified first.
    pub fn add_with_priority<K: ListenerKind>(&self, listener: Arc<K::Listener>, priority: u32) {
        let tag = Tag::of::<K>();
        let entry = ListenerEntry::new::<K>(Arc::clone(&listener));
        let seq = {
            let mut seq = self.next_seq.write().unwrap_or_else(PoisonError::into_inner);
            *seq += 1;
            *seq
        };
        {
            let mut map = self.write();
            let entries = map.entry(tag).or_default();
            let at = entries
                .iter()
                .position(|r| (r.priority, r.seq) > (priority, seq))
                .unwrap_or(entries.len());
            entries.insert(at, Ranked { priority, seq, entry });
        }

        let event = RegistrationEvent::new(tag);
        let erased: Arc<dyn Any + Send + Sync> = Arc::new(Arc::clone(&listener));
        self.route_hook(tag, FailureSite::RegisterHook, erased, || listener.on_register(&event));
    }

    /// Removes the first occurrence of `listener` under kind `K`.
    pub fn remove<K: ListenerKind>(&self, listener: &Arc<K::Listener>) {
        self.remove_entry(Tag::of::<K>(), ListenerEntry::address::<K>(listener));
    }

    /// Snapshot of the listeners under kind `K`, in priority order.
    pub fn get<K: ListenerKind>(&self) -> Vec<Arc<K::Listener>> {
        self.snapshot(Tag::of::<K>())
            .iter()
            .filter_map(ListenerEntry::downcast::<K>)
            .collect()
    }

    /// Installs the callback that receives lifecycle hook failures.
    pub fn set_exception_callback(&self, callback: Option<Arc<dyn ExceptionCallback>>) {
        let cb = callback.unwrap_or_else(|| Arc::new(LogCallback));
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = cb;
    }

    fn route_hook(
        &self,
        tag: Tag,
        site: FailureSite,
        listener: Arc<dyn Any + Send + Sync>,
        hook: impl FnOnce() -> Result<(), ListenerError>,
    ) {
        let error = match panic::catch_unwind(AssertUnwindSafe(hook)) {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err,
            Err(payload) => ListenerError::Panicked { message: crate::panic_message(&payload) },
        };
        let callback = Arc::clone(&self.callback.read().unwrap_or_else(PoisonError::into_inner));
        let failure = FailedInvocation::hook(tag, site, listener, error);
        if let Ok(Err(err)) | Err(err) =
            panic::catch_unwind(AssertUnwindSafe(|| callback.exception(&failure)))
                .map_err(|p| ListenerError::Panicked { message: crate::panic_message(&p) })
        {
            warn!(tag = %tag, error = %err, "exception callback failed during hook routing");
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Tag, Vec<Ranked>>> {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Tag, Vec<Ranked>>> {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ListenerSource for PriorityRegistry {
    fn snapshot(&self, tag: Tag) -> Vec<ListenerEntry> {
        self.read()
            .get(&tag)
            .map(|entries| entries.iter().map(|r| r.entry.clone()).collect())
            .unwrap_or_default()
    }

    /// Priority order is deterministic but not registration order.
    fn is_sequential(&self) -> bool {
        false
    }

    fn synchronized_view(self: Arc<Self>) -> Arc<dyn ListenerSource> {
        self
    }

    fn remove_entry(&self, tag: Tag, addr: usize) {
        let removed = {
            let mut map = self.write();
            match map.get_mut(&tag) {
                Some(entries) => match entries.iter().position(|r| r.entry.addr() == addr) {
                    Some(index) => Some(entries.remove(index)),
                    None => None,
                },
                None => None,
            }
        };
        if let Some(ranked) = removed {
            let event = RegistrationEvent::new(tag);
            self.route_hook(tag, FailureSite::UnregisterHook, ranked.entry.erased(), || {
                ranked.entry.fire_unregister(&event)
            });
        }
    }
}
