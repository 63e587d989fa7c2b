//! # Listener identity and lifecycle.
//!
//! Listeners are grouped by a zero-sized *kind* type implementing
//! [`ListenerKind`]; the kind names the listener trait object that every
//! instance registered under it must implement. [`Tag`] is the runtime
//! descriptor of a kind, used to key registries and re-entrancy tracking.
//!
//! ## Declaring a listener kind
//! ```rust
//! use herald::{Event, Listener, ListenerKind, ListenerError};
//!
//! pub trait UserListener: Listener {
//!     fn user_added(&self, event: &Event<String, UserAdded>) -> Result<(), ListenerError>;
//! }
//!
//! pub struct UserAdded;
//!
//! impl ListenerKind for UserAdded {
//!     type Listener = dyn UserListener + Send + Sync;
//! }
//! ```

use std::any::TypeId;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::ListenerError;
use crate::listeners::source::RegistrationEvent;

/// Base contract for event listeners.
///
/// Listener traits extend this to get the registration lifecycle hooks. Both
/// hooks default to doing nothing; failures returned from them are routed to
/// the owning registry's exception callback and never propagate to the caller
/// of `add`/`remove`.
pub trait Listener: Send + Sync {
    /// Called right after this listener has been registered.
    fn on_register(&self, event: &RegistrationEvent) -> Result<(), ListenerError> {
        let _ = event;
        Ok(())
    }

    /// Called right after this listener has been removed.
    fn on_unregister(&self, event: &RegistrationEvent) -> Result<(), ListenerError> {
        let _ = event;
        Ok(())
    }
}

/// Type-tag under which listener instances are grouped.
///
/// Implementors are zero-sized marker types; `Listener` names the trait
/// object every instance registered under this kind must implement. The
/// `Send + Sync` bounds must appear in the object type itself
/// (`dyn MyListener + Send + Sync`) so snapshots can cross threads.
pub trait ListenerKind: 'static {
    /// The listener trait object this kind groups.
    type Listener: Listener + ?Sized + Send + Sync + 'static;

    /// Human-readable name of the kind (for logs).
    fn name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Runtime descriptor of a [`ListenerKind`].
///
/// Equality and hashing consider the `TypeId` only; the name rides along for
/// diagnostics.
#[derive(Clone, Copy, Debug)]
pub struct Tag {
    id: TypeId,
    name: &'static str,
}

impl Tag {
    /// The tag of the given listener kind.
    pub fn of<K: ListenerKind>() -> Self {
        Self { id: TypeId::of::<K>(), name: K::name() }
    }

    /// The kind's type name.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Tag {}

impl Hash for Tag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
