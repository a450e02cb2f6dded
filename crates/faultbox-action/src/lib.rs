//! # faultbox-action
//!
//! The action lifecycle layer: parse orchestrator configuration, resolve
//! the target, build the attack, and drive it through the
//! Preparing -> Running -> Stopping -> Stopped/Failed state machine. One
//! coordinator owns every in-flight action; actions own their sidecars and
//! shaping plans; everything reverts on stop, deadline expiry, or agent
//! shutdown.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod coordinator;
pub mod instance;

pub use config::{ActionKind, ActionRequest, ExecutionContext};
pub use coordinator::{Coordinator, CoordinatorDeps};
pub use instance::{ActionState, StatusReport, StopReport};

pub use faultbox_error::{FaultError, Result};
