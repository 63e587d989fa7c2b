//! Listener identity, storage and supply.

mod listener;
mod priority;
mod registry;
mod source;

pub use listener::{Listener, ListenerKind, Tag};
pub use priority::{PriorityRegistry, DEFAULT_PRIORITY};
pub use registry::ListenerRegistry;
pub use source::{ListenerEntry, ListenerSource, RegistrationEvent};
