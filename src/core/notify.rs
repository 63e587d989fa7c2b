//! # The notify loop.
//!
//! [`EngineCore`] runs one round of event delegation: take a snapshot of the
//! listeners for the event's tag, invoke the delegate for each one, recover
//! from non-abort failures via the exception callback, and honor the
//! `handled` flag between invocations. Every dispatch strategy funnels into
//! this loop; the strategies only decide *where and when* it runs.
//!
//! ## Rules
//! - A dispatch for a tag that is already active on the calling thread's
//!   chain is *suppressed*: recorded on the ancestor event and replayed after
//!   the outer round for that tag completes.
//! - `ListenerError::Abort` is never recovered. It stops the round, skips
//!   the replay of suppressed events, and reaches the dispatch caller as
//!   [`EngineError::Aborted`].
//! - Listener panics are contained per invocation and reported like any
//!   other listener failure.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::callbacks::{ExceptionCallback, FailedInvocation, LogCallback};
use crate::error::{EngineError, ListenerError};
use crate::events::stack::{ActiveEvent, EventStack, SuppressedEvent};
use crate::events::Event;
use crate::listeners::{ListenerEntry, ListenerKind, ListenerSource};

/// How one listener invocation is performed: the bridge from the erased
/// notify loop to the user's typed listener method.
pub(crate) type Delegate<S, K> = Arc<
    dyn Fn(&<K as ListenerKind>::Listener, &Event<S, K>) -> Result<(), ListenerError>
        + Send
        + Sync,
>;

/// Strategy-independent dispatch state shared by all clones of one engine.
pub(crate) struct EngineCore {
    source: Arc<dyn ListenerSource>,
    stack: EventStack,
    callback: RwLock<Arc<dyn ExceptionCallback>>,
    cancel: CancellationToken,
    interrupt_aware: bool,
}

impl EngineCore {
    pub(crate) fn new(
        source: Arc<dyn ListenerSource>,
        callback: Arc<dyn ExceptionCallback>,
        cancel: CancellationToken,
        interrupt_aware: bool,
    ) -> Self {
        Self {
            source,
            stack: EventStack::new(),
            callback: RwLock::new(callback),
            cancel,
            interrupt_aware,
        }
    }

    pub(crate) fn source(&self) -> &Arc<dyn ListenerSource> {
        &self.source
    }

    pub(crate) fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    /// True when interrupt awareness is on and the engine token is cancelled.
    pub(crate) fn interrupted(&self) -> bool {
        self.interrupt_aware && self.cancel.is_cancelled()
    }

    /// The engine-level default callback, used when a dispatch call does not
    /// carry its own.
    pub(crate) fn default_callback(&self) -> Arc<dyn ExceptionCallback> {
        Arc::clone(&self.callback.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn set_exception_callback(&self, callback: Option<Arc<dyn ExceptionCallback>>) {
        let cb = callback.unwrap_or_else(|| Arc::new(LogCallback));
        *self.callback.write().unwrap_or_else(PoisonError::into_inner) = cb;
    }

    /// Runs one full delegation round for `event`, including the replay of
    /// any same-tag dispatches suppressed while the round was active.
    pub(crate) fn notify_listeners<S, K>(
        &self,
        event: Arc<Event<S, K>>,
        delegate: Delegate<S, K>,
        callback: Arc<dyn ExceptionCallback>,
    ) -> Result<(), EngineError>
    where
        S: Send + Sync + 'static,
        K: ListenerKind,
    {
        let tag = event.tag();

        // Cascade guard: a listener dispatching the tag it is currently
        // being notified for defers the new event instead of recursing.
        if let Some(ancestor) = self.stack.active_for(tag) {
            event.set_prevented(true);
            let deferred = Arc::clone(&event);
            ancestor.push_suppressed(SuppressedEvent::new(Box::new(
                move |core: &EngineCore| core.notify_listeners(deferred, delegate, callback),
            )));
            return Ok(());
        }

        event.set_prevented(false);
        event.bind_source(Arc::clone(&self.source));

        {
            let guard = self
                .stack
                .push(tag, Arc::clone(&event) as Arc<dyn ActiveEvent>);

            let snapshot = self.source.snapshot(tag);
            for (index, entry) in snapshot.iter().enumerate() {
                if self.interrupted() {
                    break;
                }
                if event.is_handled() {
                    break;
                }
                let Some(listener) = ListenerEntry::downcast::<K>(entry) else {
                    continue;
                };
                self.notify_single(&event, &listener, index, &delegate, &callback)?;
            }

            drop(guard);
        }

        for suppressed in event.take_suppressed() {
            suppressed.redispatch(self)?;
        }
        Ok(())
    }

    /// One listener invocation. Non-abort failures (including panics) are
    /// routed to `callback`; only aborts escape.
    fn notify_single<S, K>(
        &self,
        event: &Arc<Event<S, K>>,
        listener: &Arc<K::Listener>,
        index: usize,
        delegate: &Delegate<S, K>,
        callback: &Arc<dyn ExceptionCallback>,
    ) -> Result<(), EngineError>
    where
        S: Send + Sync + 'static,
        K: ListenerKind,
    {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| delegate(listener, event)));
        let error = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(ListenerError::Abort { reason })) => {
                return Err(EngineError::Aborted { reason });
            }
            Ok(Err(err)) => err,
            Err(payload) => ListenerError::Panicked { message: crate::panic_message(&payload) },
        };
        self.handle_exception(
            callback,
            FailedInvocation::invocation(
                event.tag(),
                index,
                Arc::new(Arc::clone(listener)),
                Arc::clone(event) as Arc<dyn std::any::Any + Send + Sync>,
                error,
            ),
        )
    }

    /// One listener invocation on a detached task. There is no caller left
    /// to receive an abort, so aborts are logged and swallowed here.
    pub(crate) fn notify_detached<S, K>(
        &self,
        event: &Arc<Event<S, K>>,
        listener: &Arc<K::Listener>,
        index: usize,
        delegate: &Delegate<S, K>,
        callback: &Arc<dyn ExceptionCallback>,
    ) where
        S: Send + Sync + 'static,
        K: ListenerKind,
    {
        if let Err(err) = self.notify_single(event, listener, index, delegate, callback) {
            warn!(tag = %event.tag(), error = %err, "aborted a detached listener invocation");
        }
    }

    /// Reports a failure to `callback`. The callback may abort the dispatch
    /// by returning `ListenerError::Abort`; its own failures and panics are
    /// contained here.
    pub(crate) fn handle_exception(
        &self,
        callback: &Arc<dyn ExceptionCallback>,
        failure: FailedInvocation,
    ) -> Result<(), EngineError> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback.exception(&failure)));
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(ListenerError::Abort { reason })) => Err(EngineError::Aborted { reason }),
            Ok(Err(err)) => {
                warn!(tag = %failure.tag, error = %err, "exception callback failed");
                Ok(())
            }
            Err(payload) => {
                warn!(
                    tag = %failure.tag,
                    panic = %crate::panic_message(&payload),
                    "exception callback panicked",
                );
                Ok(())
            }
        }
    }
}
