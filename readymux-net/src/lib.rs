//! Connection-oriented endpoint facade.
//!
//! This crate provides the non-blocking socket handle the async scheduler
//! drives through the readiness registry: a state-tracked TCP endpoint with
//! a three-way progress contract, typed socket options, and a
//! connection-loss notification channel.

pub mod endpoint;
pub mod option;

pub use endpoint::{Endpoint, EndpointState, LossEvent, NetError, Progress};
pub use option::{SocketOption, SocketOptionKey};
