//! # Exception callback contract.
//!
//! Event delegation must never be interrupted unintentionally: when a
//! listener fails, the notify loop recovers, reports the failure to the
//! exception callback and continues with the next listener. The callback is
//! the application's one hook into those failures.
//!
//! ## Contract
//! - Called on the thread that attempted the listener invocation.
//! - Returning `Err(ListenerError::Abort { .. })` terminates the current
//!   dispatch call; the caller of `dispatch` receives the abort.
//! - Any other error (or panic) raised by the callback itself is swallowed
//!   and logged — a broken callback cannot break delegation.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::ListenerError;
use crate::events::Event;
use crate::listeners::{ListenerKind, Tag};

/// Where a reported failure occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureSite {
    /// A listener invocation; `index` is the position in the snapshot taken
    /// for the current round.
    Listener {
        /// Position of the listener in the notification snapshot.
        index: usize,
    },
    /// A registration hook fired by `add`.
    RegisterHook,
    /// An unregistration hook fired by `remove`/`clear`.
    UnregisterHook,
    /// The scheduling layer rejected a dispatch task (pool closed, queue
    /// full). Treated as a notification failure, never surfaced as a crash.
    Submission,
}

/// Describes one failed invocation, passed to [`ExceptionCallback`].
///
/// Besides the tag, site and error, the report carries the failing listener
/// and the event that was being dispatched, type-erased. Recover them with
/// [`FailedInvocation::listener`] and [`FailedInvocation::event`] when the
/// callback knows which kinds flow through its engine.
pub struct FailedInvocation {
    /// Tag of the listener kind being notified.
    pub tag: Tag,
    /// Where the failure occurred.
    pub site: FailureSite,
    /// The failure itself. Never the abort kind — aborts bypass the callback.
    pub error: ListenerError,
    listener: Option<Arc<dyn Any + Send + Sync>>,
    event: Option<Arc<dyn Any + Send + Sync>>,
}

impl FailedInvocation {
    pub(crate) fn invocation(
        tag: Tag,
        index: usize,
        listener: Arc<dyn Any + Send + Sync>,
        event: Arc<dyn Any + Send + Sync>,
        error: ListenerError,
    ) -> Self {
        Self {
            tag,
            site: FailureSite::Listener { index },
            error,
            listener: Some(listener),
            event: Some(event),
        }
    }

    pub(crate) fn hook(
        tag: Tag,
        site: FailureSite,
        listener: Arc<dyn Any + Send + Sync>,
        error: ListenerError,
    ) -> Self {
        Self { tag, site, error, listener: Some(listener), event: None }
    }

    pub(crate) fn submission(tag: Tag, error: ListenerError) -> Self {
        Self { tag, site: FailureSite::Submission, error, listener: None, event: None }
    }

    /// The listener whose invocation or lifecycle hook failed.
    ///
    /// `None` for [`FailureSite::Submission`] failures, or when `K` is not
    /// the kind that was being notified (compare [`FailedInvocation::tag`]
    /// against `Tag::of::<K>()` first when several kinds share a callback).
    pub fn listener<K: ListenerKind>(&self) -> Option<Arc<K::Listener>> {
        self.listener.as_ref()?.downcast_ref::<Arc<K::Listener>>().cloned()
    }

    /// The event that was being dispatched when the failure occurred.
    ///
    /// `None` for hook and submission failures, or under mismatched type
    /// parameters.
    pub fn event<S, K>(&self) -> Option<Arc<Event<S, K>>>
    where
        S: Send + Sync + 'static,
        K: ListenerKind,
    {
        Arc::clone(self.event.as_ref()?).downcast::<Event<S, K>>().ok()
    }
}

impl fmt::Debug for FailedInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FailedInvocation")
            .field("tag", &self.tag)
            .field("site", &self.site)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Receives failures that occur during event dispatching.
///
/// Install a default per engine with `set_exception_callback`, or pass one
/// per call via `dispatch_with`. The default implementation installed when
/// none is given logs and continues ([`LogCallback`](super::LogCallback)).
pub trait ExceptionCallback: Send + Sync {
    /// Reports one failed invocation.
    ///
    /// Return `Err(ListenerError::Abort { .. })` to terminate the current
    /// dispatch call; any other error is swallowed and logged.
    fn exception(&self, failure: &FailedInvocation) -> Result<(), ListenerError>;
}

impl<F> ExceptionCallback for F
where
    F: Fn(&FailedInvocation) -> Result<(), ListenerError> + Send + Sync,
{
    fn exception(&self, failure: &FailedInvocation) -> Result<(), ListenerError> {
        self(failure)
    }
}
