//! Thread-scoped last-error slot.
//!
//! Failure paths record a structured code and a human-readable message here
//! before returning, so callers that only see a coarse failure (an error
//! readiness event, a wait timeout) can ask what actually happened. The slot
//! is thread-local rather than process-global, which keeps concurrent
//! schedulers from clobbering each other's state.

use std::cell::RefCell;
use std::fmt;

/// Structured error codes reported through the last-error slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// No error has been recorded since the slot was last cleared.
    Success,
    /// A wait elapsed with no ready endpoint; the caller may try again.
    Timeout,
    /// A wait was attempted on a registry with no subscriptions.
    EmptySet,
    /// Malformed call parameters, or an operation on a released registry.
    InvalidArgument,
    /// Resource allocation failed.
    Resource,
    /// Connection setup failed.
    ConnSetup,
    /// The peer rejected or refused the connection.
    ConnRefused,
    /// An established connection was broken.
    ConnLost,
    /// The endpoint is not connected.
    NotConnected,
    /// The endpoint has been closed.
    Closed,
    /// A system-level socket call failed.
    SockFail,
    /// The failure could not be classified.
    Unknown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The most recent failure recorded on this thread.
#[derive(Debug, Clone)]
pub struct LastError {
    pub code: ErrorCode,
    pub message: String,
}

impl LastError {
    fn success() -> Self {
        LastError {
            code: ErrorCode::Success,
            message: String::new(),
        }
    }
}

thread_local! {
    static LAST_ERROR: RefCell<LastError> = RefCell::new(LastError::success());
}

/// Records a failure into this thread's slot, replacing the previous one.
pub fn record_error(code: ErrorCode, message: impl Into<String>) {
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = LastError {
            code,
            message: message.into(),
        };
    });
}

/// Returns the most recent failure recorded on this thread.
pub fn last_error() -> LastError {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// Resets this thread's slot to [`ErrorCode::Success`].
pub fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = LastError::success());
}
