//! # jobbridge-server
//!
//! Axum `WebSocket` gateway that accepts job requests, acknowledges them at
//! once and pushes progress and results back later.
//!
//! - [`websocket`]: connection registry, per-connection state, heartbeat, sessions
//! - [`correlation`]: job id to waiting connections, timeouts and pruning
//! - [`router`]: per-job pub/sub channels feeding the correlation table
//! - [`protocol`]: validation and dispatch of client frames
//! - [`backend`]: job queue and pub/sub traits with memory and Redis implementations
//! - [`server`]: HTTP routes (`/ws`, `/health`, `/metrics`) and lifecycle

#![deny(unsafe_code)]

pub mod auth;
pub mod backend;
pub mod config;
pub mod correlation;
pub mod events;
pub mod health;
pub mod metrics;
pub mod protocol;
pub mod router;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::{ServerConfig, method_registry};
pub use events::{EventPublisher, JobEvent};
pub use server::{Backends, GatewayServer, ServerError, ServerHandle};
