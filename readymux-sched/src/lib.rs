//! Async operation scheduler.
//!
//! Turns the three-way progress contract of a non-blocking endpoint into
//! single-resolution asynchronous operations, using the readiness registry as
//! the suspension mechanism: each operation registers interest, polls with a
//! bounded slice, interprets readiness and error events, runs the underlying
//! call when ready, and resolves exactly one pending completion.

pub mod cancel;
pub mod completion;
pub mod endpoint;
pub mod op;

pub use cancel::CancelToken;
pub use completion::Completion;
pub use endpoint::AsyncEndpoint;
pub use op::{Direction, OpError, OpHandle};
