//! # faultbox-runc
//!
//! Subprocess driver for the OCI runtime and sidecar bundle management.
//!
//! Every privileged operation faultbox performs inside a target container
//! is carried out by a short-lived helper container (a *sidecar*) launched
//! through the OCI runtime binary. This crate provides:
//!
//! - **Driver**: `spec`, `state`, `run`, `delete` as subprocess calls with
//!   captured stderr and surfaced exit codes
//! - **Spec edits**: a partial model of `config.json` that mutates only the
//!   fields faultbox cares about and preserves everything else
//! - **Bundles**: scratch-directory bundles extracted from the embedded
//!   sidecar rootfs, with guaranteed cleanup
//!
//! The driver never retries; policy for non-zero exits (for example exit
//! 137 under memory stress) lives with the caller.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]

pub mod bundle;
pub mod image;
pub mod runc;
pub mod spec;

pub use bundle::{next_sidecar_id, Bundle};
pub use image::SidecarImage;
pub use runc::{IoStreams, Runc, RuncConfig, RuncState};
pub use spec::{Mount, Namespace, NamespaceKind, Spec};

pub use faultbox_error::{FaultError, Result};
