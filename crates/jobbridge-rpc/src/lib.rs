//! # jobbridge-rpc
//!
//! The client-facing protocol of the gateway:
//!
//! - [`types`]: request, ack, result, progress and control frames
//! - [`errors`]: [`RpcError`] and the integer error codes carried on the wire
//! - [`validation`]: turning raw text frames into validated [`RpcRequest`]s
//! - [`registry`]: the method capability table resolved at startup

#![deny(unsafe_code)]

pub mod errors;
pub mod registry;
pub mod types;
pub mod validation;

pub use errors::RpcError;
pub use registry::{Capability, JobMethod, MethodRegistry, ParamRules, Passthrough};
pub use types::{
    AckFrame, AuthFrame, ConnectedFrame, JSONRPC_VERSION, ProgressFrame, ResultFrame,
    RpcErrorBody, RpcRequest,
};
pub use validation::{FrameError, parse_request};
