//! # Re-entrancy tracking for in-flight dispatches.
//!
//! [`EventStack`] records which tags are currently being dispatched, scoped
//! to the thread that runs the notify loop. When a listener triggers a new
//! dispatch for a tag that is already active on its own call chain (a
//! *cascade*), the new event is not notified inline: it is recorded on the
//! active ancestor event as a [`SuppressedEvent`] and replayed after the
//! outer dispatch for that tag completes.
//!
//! ## Rules
//! - Frames are keyed by `(ThreadId, Tag)`: concurrent dispatches of the
//!   same tag from unrelated threads never suppress each other.
//! - Pop is guaranteed on every exit path (including aborts) by
//!   [`StackGuard`]'s `Drop`.

use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, ThreadId};

use crate::core::notify::EngineCore;
use crate::error::EngineError;
use crate::listeners::Tag;

/// Internal view of an event that is currently on the stack: the ancestor a
/// cascading dispatch attaches its suppressed event to.
pub(crate) trait ActiveEvent: Send + Sync {
    fn push_suppressed(&self, suppressed: SuppressedEvent);
}

/// A dispatch call that was deferred by the cascade guard: the event, its
/// delegate and its exception callback, captured for later replay.
pub(crate) struct SuppressedEvent {
    redispatch: Box<dyn FnOnce(&EngineCore) -> Result<(), EngineError> + Send>,
}

impl SuppressedEvent {
    pub(crate) fn new(
        redispatch: Box<dyn FnOnce(&EngineCore) -> Result<(), EngineError> + Send>,
    ) -> Self {
        Self { redispatch }
    }

    /// Replays the deferred dispatch through the core notify loop. The
    /// replay is subject to the same rules and may be suppressed again.
    pub(crate) fn redispatch(self, core: &EngineCore) -> Result<(), EngineError> {
        (self.redispatch)(core)
    }
}

struct Frame {
    thread: ThreadId,
    tag: Tag,
    event: Arc<dyn ActiveEvent>,
}

/// Per-engine stack of in-flight dispatch frames.
#[derive(Default)]
pub(crate) struct EventStack {
    frames: Mutex<Vec<Frame>>,
}

impl EventStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// The topmost event for `tag` on the calling thread's chain, if any.
    /// A `Some` result means a dispatch for `tag` must be suppressed.
    pub(crate) fn active_for(&self, tag: Tag) -> Option<Arc<dyn ActiveEvent>> {
        let thread = thread::current().id();
        let frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        frames
            .iter()
            .rev()
            .find(|f| f.thread == thread && f.tag == tag)
            .map(|f| Arc::clone(&f.event))
    }

    /// Pushes a frame for the calling thread; popped when the guard drops.
    pub(crate) fn push(&self, tag: Tag, event: Arc<dyn ActiveEvent>) -> StackGuard<'_> {
        let thread = thread::current().id();
        self.frames
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Frame { thread, tag, event });
        StackGuard { stack: self, tag, thread }
    }

    fn pop(&self, tag: Tag, thread: ThreadId) {
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(index) = frames.iter().rposition(|f| f.thread == thread && f.tag == tag) {
            frames.remove(index);
        }
    }
}

/// Scoped release of one stack frame.
pub(crate) struct StackGuard<'a> {
    stack: &'a EventStack,
    tag: Tag,
    thread: ThreadId,
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        self.stack.pop(self.tag, self.thread);
    }
}
