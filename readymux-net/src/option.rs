//! Typed socket options.
//!
//! Options are a tagged variant keyed by [`SocketOptionKey`], so each option
//! carries exactly the value type it is defined with. There is deliberately
//! no key for blocking mode: endpoints are non-blocking by construction and
//! cannot be switched back.

use std::time::Duration;

/// Option identifiers, used to query a value with
/// [`Endpoint::get_option`](crate::Endpoint::get_option).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOptionKey {
    /// Overall deadline applied to asynchronous receive operations.
    ReceiveTimeout,
    /// Overall deadline applied to asynchronous send operations.
    SendTimeout,
    /// Kernel receive buffer size in bytes.
    ReceiveBuffer,
    /// Kernel send buffer size in bytes.
    SendBuffer,
    /// Allow rebinding an address already in use.
    ReuseAddress,
    /// Linger-on-close duration.
    Linger,
}

/// An option identifier together with its statically typed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    /// `None` means asynchronous receives wait indefinitely.
    ReceiveTimeout(Option<Duration>),
    /// `None` means asynchronous sends wait indefinitely.
    SendTimeout(Option<Duration>),
    ReceiveBuffer(usize),
    SendBuffer(usize),
    ReuseAddress(bool),
    Linger(Option<Duration>),
}

impl SocketOption {
    /// The key this value belongs to.
    pub fn key(&self) -> SocketOptionKey {
        match self {
            SocketOption::ReceiveTimeout(_) => SocketOptionKey::ReceiveTimeout,
            SocketOption::SendTimeout(_) => SocketOptionKey::SendTimeout,
            SocketOption::ReceiveBuffer(_) => SocketOptionKey::ReceiveBuffer,
            SocketOption::SendBuffer(_) => SocketOptionKey::SendBuffer,
            SocketOption::ReuseAddress(_) => SocketOptionKey::ReuseAddress,
            SocketOption::Linger(_) => SocketOptionKey::Linger,
        }
    }
}

/// Engine-level option values that have no kernel-side storage.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct OptionStore {
    pub receive_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
}
