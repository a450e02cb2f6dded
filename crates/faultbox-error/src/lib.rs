//! Common error types for `faultbox`.
//!
//! Fault injection shares one error domain across every crate: an attack
//! either fails because the caller asked for something invalid, because the
//! target disappeared underneath us, or because a privileged subprocess
//! reported a failure. This crate provides the unified [`FaultError`] enum
//! that the orchestrator-facing layer maps onto protocol error kinds.

mod fault;

pub use fault::{FaultError, EXIT_CODE_SIGKILL};

/// Result type alias using [`FaultError`].
pub type Result<T> = std::result::Result<T, FaultError>;
