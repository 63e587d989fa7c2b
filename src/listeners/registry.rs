//! # Default listener registry.
//!
//! [`ListenerRegistry`] stores listener instances keyed by [`Tag`], in
//! insertion order. All mutation methods are safe under concurrent use and
//! safe to call from within a listener during its own notification: the
//! engine iterates a snapshot taken at dispatch start, so changes take
//! effect on the next round.
//!
//! ## Rules
//! - `add` appends; the same listener may be registered multiple times.
//! - `remove` drops the first occurrence; no-op if absent.
//! - Lifecycle hooks are best-effort: failures are routed to the registry's
//!   exception callback and never propagate to the caller.
//! - The registry is natively thread-safe; `synchronized_view` returns the
//!   same handle.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::warn;

use crate::callbacks::{ExceptionCallback, FailedInvocation, FailureSite, LogCallback};
use crate::error::ListenerError;
use crate::listeners::listener::{Listener as _, ListenerKind, Tag};
use crate::listeners::source::{ListenerEntry, ListenerSource, RegistrationEvent};

/// Insertion-ordered, thread-safe listener storage.
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<Tag, Vec<ListenerEntry>>>,
    callback: RwLock<Arc<dyn ExceptionCallback>>,
}

impl ListenerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            listeners: RwLock::new(HashMap::new()),
            callback: RwLock::new(Arc::new(LogCallback)),
        })
    }

    /// Appends `listener` under kind `K` and fires its registration hook.
    pub fn add<K: ListenerKind>(&self, listener: Arc<K::Listener>) {
        let tag = Tag::of::<K>();
        let entry = ListenerEntry::new::<K>(Arc::clone(&listener));
        self.write().entry(tag).or_default().push(entry);

        let event = RegistrationEvent::new(tag);
        let erased: Arc<dyn Any + Send + Sync> = Arc::new(Arc::clone(&listener));
        self.route_hook(tag, FailureSite::RegisterHook, erased, || listener.on_register(&event));
    }

    /// Removes the first occurrence of `listener` under kind `K`; no-op if
    /// absent. Fires the unregistration hook when an entry was removed.
    pub fn remove<K: ListenerKind>(&self, listener: &Arc<K::Listener>) {
        self.remove_entry(Tag::of::<K>(), ListenerEntry::address::<K>(listener));
    }

    /// Snapshot of the listeners registered under kind `K`, in registration
    /// order. Safe to iterate while the registry is mutated elsewhere.
    pub fn get<K: ListenerKind>(&self) -> Vec<Arc<K::Listener>> {
        self.snapshot(Tag::of::<K>())
            .iter()
            .filter_map(ListenerEntry::downcast::<K>)
            .collect()
    }

    /// Removes every listener registered under kind `K`, firing hooks.
    pub fn clear<K: ListenerKind>(&self) {
        self.clear_tag(Tag::of::<K>());
    }

    /// Removes every listener of every kind, firing hooks.
    pub fn clear_all(&self) {
        let drained: Vec<(Tag, Vec<ListenerEntry>)> = self.write().drain().collect();
        for (tag, entries) in drained {
            self.fire_unregister_hooks(tag, entries);
        }
    }

    /// Installs the callback that receives lifecycle hook failures. `None`
    /// resets to the logging default.
    pub fn set_exception_callback(&self, callback: Option<Arc<dyn ExceptionCallback>>) {
        let cb = callback.unwrap_or_else(|| Arc::new(LogCallback));
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = cb;
    }

    fn clear_tag(&self, tag: Tag) {
        let entries = self.write().remove(&tag).unwrap_or_default();
        self.fire_unregister_hooks(tag, entries);
    }

    fn fire_unregister_hooks(&self, tag: Tag, entries: Vec<ListenerEntry>) {
        let event = RegistrationEvent::new(tag);
        for entry in entries {
            self.route_hook(tag, FailureSite::UnregisterHook, entry.erased(), || {
                entry.fire_unregister(&event)
            });
        }
    }

    /// Runs a lifecycle hook; failures (and panics, and anything the
    /// callback itself does) stay inside the registry.
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
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback.exception(&failure)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                // Aborts cannot cross add/remove; callers of registration
                // methods are not dispatching.
                warn!(tag = %tag, error = %err, "exception callback failed during hook routing");
            }
            Err(payload) => {
                warn!(
                    tag = %tag,
                    panic = %crate::panic_message(&payload),
                    "exception callback panicked during hook routing",
                );
            }
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<Tag, Vec<ListenerEntry>>> {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<Tag, Vec<ListenerEntry>>> {
        self.listeners.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ListenerSource for ListenerRegistry {
    fn snapshot(&self, tag: Tag) -> Vec<ListenerEntry> {
        self.read().get(&tag).cloned().unwrap_or_default()
    }

    fn is_sequential(&self) -> bool {
        true
    }

    fn synchronized_view(self: Arc<Self>) -> Arc<dyn ListenerSource> {
        self
    }

    fn remove_entry(&self, tag: Tag, addr: usize) {
        let removed = {
            let mut map = self.write();
            match map.get_mut(&tag) {
                Some(entries) => match entries.iter().position(|e| e.addr() == addr) {
                    Some(index) => Some(entries.remove(index)),
                    None => None,
                },
                None => None,
            }
        };
        if let Some(entry) = removed {
            self.fire_unregister_hooks(tag, vec![entry]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listeners::listener::Listener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Ping;
    impl ListenerKind for Ping {
        type Listener = dyn Listener + Send + Sync;
    }

    #[derive(Default)]
    struct HookCounter {
        registered: AtomicUsize,
        unregistered: AtomicUsize,
    }

    impl Listener for HookCounter {
        fn on_register(&self, _: &RegistrationEvent) -> Result<(), ListenerError> {
            self.registered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn on_unregister(&self, _: &RegistrationEvent) -> Result<(), ListenerError> {
            self.unregistered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingHook;
    impl Listener for FailingHook {
        fn on_register(&self, _: &RegistrationEvent) -> Result<(), ListenerError> {
            Err(ListenerError::failed("hook boom"))
        }
    }

    fn as_dyn(counter: &Arc<HookCounter>) -> Arc<dyn Listener + Send + Sync> {
        Arc::clone(counter) as Arc<dyn Listener + Send + Sync>
    }

    #[test]
    fn add_then_remove_leaves_no_trace() {
        let registry = ListenerRegistry::new();
        let counter = Arc::new(HookCounter::default());
        let listener = as_dyn(&counter);

        registry.add::<Ping>(Arc::clone(&listener));
        assert_eq!(registry.get::<Ping>().len(), 1);

        registry.remove::<Ping>(&listener);
        assert!(registry.get::<Ping>().is_empty());
        assert_eq!(counter.registered.load(Ordering::SeqCst), 1);
        assert_eq!(counter.unregistered.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_absent_is_noop() {
        let registry = ListenerRegistry::new();
        let listener = as_dyn(&Arc::new(HookCounter::default()));
        registry.remove::<Ping>(&listener);
        assert!(registry.get::<Ping>().is_empty());
    }

    #[test]
    fn get_preserves_registration_order() {
        let registry = ListenerRegistry::new();
        let first = as_dyn(&Arc::new(HookCounter::default()));
        let second = as_dyn(&Arc::new(HookCounter::default()));

        registry.add::<Ping>(Arc::clone(&first));
        registry.add::<Ping>(Arc::clone(&second));

        let got = registry.get::<Ping>();
        assert_eq!(got.len(), 2);
        assert!(Arc::ptr_eq(&got[0], &first));
        assert!(Arc::ptr_eq(&got[1], &second));
    }

    #[test]
    fn snapshot_is_stable_under_mutation() {
        let registry = ListenerRegistry::new();
        let first = as_dyn(&Arc::new(HookCounter::default()));
        registry.add::<Ping>(Arc::clone(&first));

        let snapshot = registry.snapshot(Tag::of::<Ping>());
        registry.clear_all();

        assert_eq!(snapshot.len(), 1);
        assert!(registry.get::<Ping>().is_empty());
    }

    #[test]
    fn hook_failure_routes_to_callback() {
        let registry = ListenerRegistry::new();
        let seen: Arc<Mutex<Vec<(String, bool)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let failing = Arc::new(FailingHook) as Arc<dyn Listener + Send + Sync>;
        let expected = Arc::clone(&failing);
        registry.set_exception_callback(Some(Arc::new(
            move |failure: &FailedInvocation| -> Result<(), ListenerError> {
                let same = failure
                    .listener::<Ping>()
                    .map(|l| Arc::ptr_eq(&l, &expected))
                    .unwrap_or(false);
                sink.lock().unwrap().push((failure.error.to_string(), same));
                Ok(())
            },
        )));

        registry.add::<Ping>(failing);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].0.contains("hook boom"));
        // The report carries the listener whose hook failed.
        assert!(seen[0].1);
        // The listener is registered even though its hook failed.
        assert_eq!(registry.get::<Ping>().len(), 1);
    }

    #[test]
    fn clear_all_fires_unregister_hooks() {
        let registry = ListenerRegistry::new();
        let counter = Arc::new(HookCounter::default());
        registry.add::<Ping>(as_dyn(&counter));
        registry.add::<Ping>(as_dyn(&counter));

        registry.clear_all();
        assert_eq!(counter.unregistered.load(Ordering::SeqCst), 2);
    }
}
