//! # Default logging exception callback.
//!
//! [`LogCallback`] is the callback installed when an engine or registry is
//! given none (or reset with `None`): it records the failure through
//! `tracing` and lets delegation continue. Not intended as an application
//! error strategy — implement a custom [`ExceptionCallback`] to collect
//! metrics or surface failures.

use tracing::error;

use crate::callbacks::callback::{ExceptionCallback, FailedInvocation, FailureSite};
use crate::error::ListenerError;

/// Logs failures and continues; never aborts.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogCallback;

impl ExceptionCallback for LogCallback {
    fn exception(&self, failure: &FailedInvocation) -> Result<(), ListenerError> {
        match failure.site {
            FailureSite::Listener { index } => error!(
                tag = %failure.tag,
                index,
                label = failure.error.as_label(),
                error = %failure.error,
                "listener threw while being notified",
            ),
            FailureSite::RegisterHook | FailureSite::UnregisterHook => error!(
                tag = %failure.tag,
                label = failure.error.as_label(),
                error = %failure.error,
                "listener lifecycle hook failed",
            ),
            FailureSite::Submission => error!(
                tag = %failure.tag,
                label = failure.error.as_label(),
                error = %failure.error,
                "dispatch task could not be submitted",
            ),
        }
        Ok(())
    }
}
