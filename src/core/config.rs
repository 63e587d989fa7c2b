//! # Engine configuration.
//!
//! Provides [`EngineConfig`] centralized settings for a dispatch engine, and
//! [`DispatchStrategy`] the execution model selector.
//!
//! Config is consumed by `EngineBuilder::build()`; every field can also be
//! set through a dedicated builder method.

use std::time::Duration;

/// How a dispatch call is executed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchStrategy {
    /// Run the notify loop inline on the calling thread. `dispatch` returns
    /// after every listener was invoked.
    #[default]
    Immediate,
    /// Run the notify loop inline, but defer dispatches made while another
    /// dispatch is already running on this engine: they are queued and run
    /// in FIFO order after the active one finishes.
    Queuing,
    /// Spawn one runtime task per listener. Invocation order across
    /// listeners is unspecified; `dispatch` returns after submission.
    Parallel,
    /// Hand the whole notify loop to a single background worker. Calls keep
    /// their submission order; `dispatch` returns after enqueueing.
    Asynchronous,
}

impl DispatchStrategy {
    /// Whether this strategy notifies listeners one at a time, in snapshot
    /// order, within one dispatch call.
    pub fn is_sequential(&self) -> bool {
        !matches!(self, DispatchStrategy::Parallel)
    }
}

/// Configuration for a dispatch engine.
///
/// ## Field semantics
/// - `strategy`: execution model, see [`DispatchStrategy`]
/// - `queue_capacity`: bound of the background worker queue
///   (`Asynchronous` only; must be at least 1)
/// - `grace`: maximum wait in `close()` for in-flight work to finish
/// - `interrupt_aware`: when set, a cancelled engine token stops sequential
///   rounds between listener invocations
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Execution model for dispatch calls.
    pub strategy: DispatchStrategy,

    /// Capacity of the `Asynchronous` worker queue. A full queue rejects
    /// the dispatch and reports it to the exception callback.
    pub queue_capacity: usize,

    /// Maximum time `close()` waits for in-flight dispatches before
    /// returning `EngineError::GraceExceeded`.
    pub grace: Duration,

    /// Check the engine's cancellation token between listener invocations.
    pub interrupt_aware: bool,
}

impl Default for EngineConfig {
    /// Default configuration:
    ///
    /// - `strategy = Immediate`
    /// - `queue_capacity = 1024`
    /// - `grace = 2s`
    /// - `interrupt_aware = false`
    fn default() -> Self {
        Self {
            strategy: DispatchStrategy::default(),
            queue_capacity: 1024,
            grace: Duration::from_secs(2),
            interrupt_aware: false,
        }
    }
}
