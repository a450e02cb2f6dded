//! # faultbox-engine
//!
//! A uniform view over the container engines faultbox can attack through:
//! Docker, containerd, and CRI-O. Each engine exposes the same narrow
//! client surface (list, inspect, pause, unpause, stop, version), the
//! resolver turns an inspected container into live `/proc` namespace paths
//! with PID-reuse detection, and the discovery poller periodically reports
//! attackable targets to the orchestrator.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]

pub mod client;
pub mod containerd;
pub mod crio;
pub mod discovery;
pub mod docker;
pub mod resolver;
pub mod sidecar;
pub mod types;

pub use client::{detect, EngineClient, EngineConfig};
pub use discovery::{Discovery, DiscoveryConfig, Target};
pub use sidecar::{SidecarExecutor, SidecarKill, SidecarSpec, SpawnedSidecar};
pub use types::{ContainerDescriptor, ContainerSummary, EngineKind, NamespaceEntry, TargetConfig};

pub use faultbox_error::{FaultError, Result};
