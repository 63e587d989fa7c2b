//! Engine core: construction and the notify loop.
//!
//! The only public API from this module is [`DispatchEngine`] (plus its
//! builder and configuration); the delegation semantics live in the
//! internal `notify` module.
//!
//! Internal modules:
//! - [`notify`]: one delegation round, cascade guard, failure routing;
//! - [`engine`]: the strategy states and the public dispatch surface;
//! - [`builder`]: engine construction and validation.

mod builder;
mod config;
mod engine;
pub(crate) mod notify;

pub use builder::EngineBuilder;
pub use config::{DispatchStrategy, EngineConfig};
pub use engine::DispatchEngine;
