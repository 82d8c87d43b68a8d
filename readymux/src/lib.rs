//! readymux - async I/O readiness multiplexer
//!
//! High-level Rust API for driving non-blocking endpoints through a
//! readiness registry with single-resolution asynchronous operations.

pub use readymux_poll as poll;
pub use readymux_net as net;
pub use readymux_sched as sched;

// Re-export commonly used types
pub use poll::{EndpointId, ErrorCode, Interest, PollError, ReadyEvent, Registry, RegistryFlags};
pub use net::{Endpoint, EndpointState, NetError, Progress, SocketOption, SocketOptionKey};
pub use sched::{AsyncEndpoint, CancelToken, Completion, Direction, OpError, OpHandle};
