//! # faultbox-net
//!
//! The network attack pipeline: normalize user-supplied traffic filters,
//! resolve hostnames and enumerate interfaces from inside the target's
//! network namespace, compile a deterministic shaping plan (`tc` batch
//! input plus `iptables-restore` rule sets), and apply or revert it through
//! `CAP_NET_ADMIN` sidecars.
//!
//! The compiler is a pure function: equal inputs produce byte-equal
//! batches. All host `tc`/netfilter state created here carries a per-action
//! tag (class ids from a reserved handle range, firewall comment matches),
//! and revert only ever matches on that tag.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]

pub mod compile;
pub mod filter;
pub mod iface;
pub mod ops;
pub mod plan;

pub use compile::{compile, CompileInput, FirewallEffect, InterfaceAssignment};
pub use filter::{CidrWithPorts, NetworkFilter, PortRange, RestrictedEndpoint};
pub use iface::Interface;
pub use ops::{ClassAllocator, NetworkOps};
pub use plan::{FirewallRule, QdiscEffect, ShapingPlan};

pub use faultbox_error::{FaultError, Result};
