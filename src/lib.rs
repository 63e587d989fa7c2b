//! # herald
//!
//! **Herald** is a typed, in-process event notification library for Rust.
//!
//! It provides primitives to register listeners, dispatch events to them
//! under configurable execution strategies, and recover from listener
//! failures without breaking delegation. The crate is designed as a
//! building block for applications that need an internal event system
//! rather than a message broker.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//!     │   Listener   │   │   Listener   │   │   Listener   │
//!     │  (user #1)   │   │  (user #2)   │   │  (user #3)   │
//!     └──────┬───────┘   └──────┬───────┘   └──────┬───────┘
//!            │ add::<K>()       │                  │
//!            ▼                  ▼                  ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  ListenerSource (ListenerRegistry / PriorityRegistry)             │
//! │  - stores listeners per Tag, snapshot() per dispatch round        │
//! └─────────────────────────────────┬─────────────────────────────────┘
//!                                   │ snapshot(tag)
//!                                   ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  DispatchEngine                                                   │
//! │  - strategy state: Immediate │ Queuing │ Parallel │ Asynchronous  │
//! │  - EngineCore: notify loop, cascade guard, failure routing        │
//! └──────┬──────────────────────────────────────────────────────┬─────┘
//!        │ delegate(listener, event)                            │
//!        ▼                                                      ▼
//!   listener.on_xyz(event)                             ExceptionCallback
//!   (handled flag short-circuits)                      (recover or abort)
//! ```
//!
//! ### One dispatch call (sequential strategies)
//! ```text
//! dispatch(event, delegate)
//!   ├─► same tag already active on this call chain?
//!   │     └─ yes ─► suppress: replay after the outer round   (cascade guard)
//!   ├─► bind source, push stack frame
//!   ├─► for listener in snapshot {
//!   │     ├─ engine cancelled && interrupt_aware ─► stop
//!   │     ├─ event.is_handled()                  ─► stop
//!   │     └─ delegate(listener, event)
//!   │          ├─ Ok                ─► next
//!   │          ├─ Err(Abort)        ─► EngineError::Aborted to caller
//!   │          ├─ Err(other)/panic  ─► ExceptionCallback
//!   │          │     ├─ Ok / Err(other) ─► next listener
//!   │          │     └─ Err(Abort)      ─► EngineError::Aborted to caller
//!   │   }
//!   ├─► pop stack frame
//!   └─► replay suppressed events, in order
//! ```
//!
//! ## Features
//! | Area            | Description                                               | Key types / traits                           |
//! |-----------------|-----------------------------------------------------------|----------------------------------------------|
//! | **Listeners**   | Typed listener kinds, lifecycle hooks, priority ordering. | [`Listener`], [`ListenerKind`], [`Tag`]      |
//! | **Sources**     | Thread-safe listener storage with stable snapshots.       | [`ListenerRegistry`], [`PriorityRegistry`]   |
//! | **Dispatch**    | Inline, queued, parallel and background execution.        | [`DispatchEngine`], [`DispatchStrategy`]     |
//! | **Events**      | Handled flag, property bag, in-dispatch source access.    | [`Event`]                                    |
//! | **Failures**    | Per-listener recovery, abort escalation.                  | [`ExceptionCallback`], [`FailedInvocation`]  |
//! | **Errors**      | Typed errors for engine use and listener outcomes.        | [`EngineError`], [`ListenerError`]           |
//! | **Configuration** | Centralize engine settings.                             | [`EngineConfig`], [`EngineBuilder`]          |
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use herald::{
//!     DispatchEngine, Event, Listener, ListenerError, ListenerKind, ListenerRegistry,
//! };
//!
//! // One listener interface, one kind marker.
//! trait UserListener: Listener {
//!     fn user_added(&self, event: &Event<String, UserEvents>) -> Result<(), ListenerError>;
//! }
//!
//! struct UserEvents;
//! impl ListenerKind for UserEvents {
//!     type Listener = dyn UserListener + Send + Sync;
//! }
//!
//! struct Greeter;
//! impl Listener for Greeter {}
//! impl UserListener for Greeter {
//!     fn user_added(&self, event: &Event<String, UserEvents>) -> Result<(), ListenerError> {
//!         let name = event.source().map(String::as_str).unwrap_or("someone");
//!         println!("welcome, {name}");
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> Result<(), herald::EngineError> {
//!     let registry = ListenerRegistry::new();
//!     registry.add::<UserEvents>(Arc::new(Greeter) as Arc<dyn UserListener + Send + Sync>);
//!
//!     let engine = DispatchEngine::immediate(registry);
//!     let event = Arc::new(Event::new("alice".to_string()));
//!     engine.dispatch(
//!         event,
//!         |listener: &(dyn UserListener + Send + Sync + 'static), event: &Event<String, UserEvents>| {
//!             listener.user_added(event)
//!         },
//!     )
//! }
//! ```
mod callbacks;
mod core;
mod error;
mod events;
mod listeners;

// ---- Public re-exports ----

pub use callbacks::{ExceptionCallback, FailedInvocation, FailureSite, LogCallback};
pub use core::{DispatchEngine, DispatchStrategy, EngineBuilder, EngineConfig};
pub use error::{EngineError, ListenerError};
pub use events::Event;
pub use listeners::{
    Listener, ListenerEntry, ListenerKind, ListenerRegistry, ListenerSource, PriorityRegistry,
    RegistrationEvent, Tag, DEFAULT_PRIORITY,
};

/// Best-effort extraction of a panic payload for logs and failure reports.
pub(crate) fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
