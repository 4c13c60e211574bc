//! WebSocket connection management, heartbeat, and session handling.

pub mod connection;
pub mod heartbeat;
pub mod registry;
pub mod session;
