//! Error types used by the dispatch engine and by listeners.
//!
//! This module defines two main error enums:
//!
//! - [`EngineError`] — errors raised by the dispatch machinery itself.
//! - [`ListenerError`] — failures raised by individual listener invocations.
//!
//! Both types provide an `as_label` helper for logs/metrics. The abort kind
//! ([`ListenerError::Abort`], surfaced as [`EngineError::Aborted`]) is the one
//! failure the engine never recovers from: it propagates to the caller of
//! `dispatch`, skipping remaining listeners. Every other listener failure is
//! reported to the exception callback and delegation continues.

use std::time::Duration;
use thiserror::Error;

/// # Errors produced by the dispatch engine.
///
/// These surface synchronously to the caller of the engine's public methods.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum EngineError {
    /// A constructive argument was rejected (e.g. a zero queue capacity).
    ///
    /// Always surfaced to the immediate caller, never recovered internally.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A listener or exception callback deliberately terminated the current
    /// dispatch call. Remaining listeners and suppressed-event drains for
    /// that call are skipped.
    #[error("dispatch aborted: {reason}")]
    Aborted {
        /// Reason supplied by the aborting listener or callback.
        reason: String,
    },

    /// An operation was invoked outside its valid window, such as querying
    /// the dispatching source of an event that is not being dispatched.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// `close()` exceeded its grace period; remaining dispatch tasks were
    /// abandoned.
    #[error("close grace {grace:?} exceeded; abandoning in-flight dispatch tasks")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
    },
}

impl EngineError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            EngineError::InvalidArgument(_) => "engine_invalid_argument",
            EngineError::Aborted { .. } => "engine_aborted",
            EngineError::IllegalState(_) => "engine_illegal_state",
            EngineError::GraceExceeded { .. } => "engine_grace_exceeded",
        }
    }

    /// Whether this error is the distinguished abort kind.
    pub fn is_abort(&self) -> bool {
        matches!(self, EngineError::Aborted { .. })
    }
}

/// # Failures raised by listener invocations.
///
/// Returned by delegates, registration hooks and exception callbacks. Panics
/// inside a listener are caught by the notify loop and reported as
/// [`ListenerError::Panicked`].
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum ListenerError {
    /// The listener failed; delegation continues with the next listener.
    #[error("listener failed: {message}")]
    Failed {
        /// Human-readable failure message.
        message: String,
    },

    /// The listener panicked; the panic was caught and delegation continues.
    #[error("listener panicked: {message}")]
    Panicked {
        /// Downcast panic payload, or `"unknown panic"`.
        message: String,
    },

    /// Deliberate request to terminate the whole dispatch call. Never passed
    /// to the exception callback; propagates to the caller of `dispatch` as
    /// [`EngineError::Aborted`].
    #[error("abort requested: {reason}")]
    Abort {
        /// Reason for aborting.
        reason: String,
    },
}

impl ListenerError {
    /// Creates a recoverable failure with the given message.
    pub fn failed(message: impl Into<String>) -> Self {
        ListenerError::Failed { message: message.into() }
    }

    /// Creates an abort request with the given reason.
    pub fn abort(reason: impl Into<String>) -> Self {
        ListenerError::Abort { reason: reason.into() }
    }

    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            ListenerError::Failed { .. } => "listener_failed",
            ListenerError::Panicked { .. } => "listener_panicked",
            ListenerError::Abort { .. } => "listener_abort",
        }
    }

    /// Whether this failure is the distinguished abort kind.
    pub fn is_abort(&self) -> bool {
        matches!(self, ListenerError::Abort { .. })
    }
}

impl From<ListenerError> for EngineError {
    /// Converts an abort request into the engine-level abort error. Other
    /// listener failures never cross this boundary; they are routed to the
    /// exception callback instead.
    fn from(err: ListenerError) -> Self {
        match err {
            ListenerError::Abort { reason } => EngineError::Aborted { reason },
            other => EngineError::Aborted { reason: other.to_string() },
        }
    }
}
