//! Exception callbacks: the pluggable sink for listener failures.

mod callback;
mod log;

pub use callback::{ExceptionCallback, FailedInvocation, FailureSite};
pub use log::LogCallback;
