//! # faultbox-api
//!
//! The orchestrator-facing HTTP surface: the action protocol
//! (`GET /` manifest, `POST /<action>/{prepare,start,status,stop}`), the
//! discovery endpoint, and the health listener served on its own port.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::uninlined_format_args)]

pub mod error;
pub mod handlers;
pub mod server;

pub use error::ApiError;
pub use server::{create_router, health_router, AppState};
