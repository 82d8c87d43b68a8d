//! Readiness polling for non-blocking endpoints.
//!
//! This crate provides the leaf layer of the async readiness engine: a
//! registry of endpoint subscriptions with a blocking multiplexed wait,
//! interest masks and readiness events, and a thread-scoped last-error slot.

pub mod interest;
pub mod last_error;
pub mod registry;

pub use interest::Interest;
pub use last_error::{clear_last_error, last_error, record_error, ErrorCode, LastError};
pub use registry::{EndpointId, PollError, ReadyEvent, Registry, RegistryFlags, RegistryGuard};
