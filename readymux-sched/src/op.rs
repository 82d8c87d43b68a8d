//! Pending operations: errors, handles, cancellation.

use crate::cancel::CancelToken;
use crate::completion::Completion;
use parking_lot::Mutex;
use readymux_net::NetError;
use readymux_poll::{ErrorCode, PollError, Registry};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// I/O direction of a pending operation. At most one operation per direction
/// may be outstanding on an endpoint at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub(crate) fn index(self) -> usize {
        match self {
            Direction::Read => 0,
            Direction::Write => 1,
        }
    }
}

/// Operation-level errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource allocation failed: {0}")]
    Resource(String),

    #[error("transport failure ({code}): {message}")]
    Transport { code: ErrorCode, message: String },

    /// The caller-supplied overall deadline elapsed. Distinct from the
    /// internal poll-slice timeout, which never surfaces here.
    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    /// Readiness was reported but the failure could not be classified.
    #[error("unclassified readiness failure")]
    Unknown,
}

impl From<PollError> for OpError {
    fn from(e: PollError) -> Self {
        match e {
            PollError::InvalidState => OpError::InvalidArgument(e.to_string()),
            PollError::InvalidArgument(msg) => OpError::InvalidArgument(msg),
            PollError::Resource(msg) => OpError::Resource(msg),
            // Subscriptions vanished or a slice elapsed outside the poll
            // loop's own handling; neither has a better classification.
            PollError::EmptySet | PollError::Timeout => OpError::Unknown,
        }
    }
}

impl From<NetError> for OpError {
    fn from(e: NetError) -> Self {
        match e {
            NetError::Transport { code, message } => OpError::Transport { code, message },
            NetError::InvalidState => {
                OpError::InvalidArgument("endpoint is not in a valid state".into())
            }
            NetError::InvalidArgument(msg) => OpError::InvalidArgument(msg),
            NetError::Io(e) => OpError::Transport {
                code: ErrorCode::SockFail,
                message: e.to_string(),
            },
        }
    }
}

/// Cancellation side of a pending operation, shared between the caller-facing
/// handle and the scheduler's in-flight table.
#[derive(Clone)]
pub(crate) struct OpCanceller {
    pub(crate) op_id: u64,
    pub(crate) token: CancelToken,
    /// The operation's registry, published while its poll loop is live so
    /// cancellation can clear subscriptions immediately.
    pub(crate) registry: Arc<Mutex<Option<Arc<Registry>>>>,
    /// Direction slot this operation holds; releasing stores 0, guarded by
    /// the op id so a stale release never clobbers a newer operation.
    pub(crate) busy: Arc<AtomicU64>,
    pub(crate) completion: Arc<dyn Fn(OpError) -> bool + Send + Sync>,
}

impl OpCanceller {
    /// Fails the operation: sets the token, clears the registry subscriptions
    /// before the promise unwinds, releases the direction slot, and resolves.
    pub(crate) fn fail_with(&self, error: OpError) {
        self.token.cancel();
        let registry = self.registry.lock().clone();
        if let Some(registry) = registry {
            let _ = registry.clear_all();
        }
        self.release_slot();
        (self.completion)(error);
    }

    pub(crate) fn release_slot(&self) {
        let _ = self
            .busy
            .compare_exchange(self.op_id, 0, Ordering::SeqCst, Ordering::SeqCst);
    }
}

/// Caller-facing handle for one pending operation.
///
/// Exactly one of success, failure or cancellation resolves the operation;
/// [`OpHandle::join`] observes whichever happened.
pub struct OpHandle<T> {
    pub(crate) completion: Arc<Completion<Result<T, OpError>>>,
    pub(crate) canceller: OpCanceller,
}

impl<T> OpHandle<T> {
    /// Requests cancellation. If the operation has already resolved, this is
    /// a no-op; otherwise it resolves as [`OpError::Cancelled`] without
    /// invoking the underlying call.
    pub fn cancel(&self) {
        self.canceller.fail_with(OpError::Cancelled);
    }

    /// True once the operation has resolved.
    pub fn is_done(&self) -> bool {
        self.completion.is_resolved()
    }

    /// Blocks until the operation resolves and returns the outcome.
    pub fn join(self) -> Result<T, OpError> {
        match self.completion.take_wait() {
            Some(result) => result,
            // Unreachable through this API: join consumes the only taker.
            None => Err(OpError::Unknown),
        }
    }
}
