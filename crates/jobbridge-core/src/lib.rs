//! # jobbridge-core
//!
//! Shared vocabulary for the jobbridge crates:
//!
//! - **Branded IDs**: [`JobId`] and [`ConnectionId`] newtypes so a job
//!   identifier can never be passed where a connection identifier is expected
//! - **Logging**: [`logging::init_subscriber`] for the process-wide `tracing` subscriber

#![deny(unsafe_code)]

pub mod ids;
pub mod logging;

pub use ids::{ConnectionId, JobId};
