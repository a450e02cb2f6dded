//! # faultbox-stress
//!
//! CPU, memory, and I/O pressure against a target container, produced by
//! `stress-ng` running in a sidecar that joins the target's cgroup, mount,
//! and PID namespaces. The cgroup join is the whole point: the workload is
//! bounded by the target's own limits, so the pressure is realistic and
//! scoped.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]

pub mod opts;
pub mod runner;

pub use opts::{IoMode, StressOpts};
pub use runner::{RunningStress, StressRunner};

pub use faultbox_error::{FaultError, Result};
