//! Event data model and re-entrancy tracking.
//!
//! ## Contents
//! - [`Event`] the value passed through one dispatch call
//! - `stack` (crate-internal) cascade detection for nested dispatches

mod event;
pub(crate) mod stack;

pub use event::Event;
