//! Registered-capability table.
//!
//! Job methods are forwarded to the queue; the control methods (`watch`,
//! `unwatch`, `cancel`, `ping`) are handled by the gateway itself. Anything
//! else resolves to [`RpcError::UnknownMethod`] before reaching the queue.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::warn;

use crate::errors::RpcError;
use crate::validation::{DEFAULT_MAX_PARAMS_BYTES, validate_params_size};

/// Names handled by the gateway and never forwarded to the queue.
pub const BUILTIN_METHODS: [&str; 4] = ["watch", "unwatch", "cancel", "ping"];

/// A method whose calls are submitted to the job queue.
pub trait JobMethod: Send + Sync {
    /// Check parameters before submission.
    fn validate(&self, _params: &Map<String, Value>) -> Result<(), RpcError> {
        Ok(())
    }
}

/// Forwards any parameters unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct Passthrough;

impl JobMethod for Passthrough {}

/// Required-parameter and size rules for a configured method.
#[derive(Clone, Debug)]
pub struct ParamRules {
    /// Parameters that must be present and non-null.
    pub required: Vec<String>,
    /// Cap on the serialized size of `params`.
    pub max_params_bytes: usize,
}

impl Default for ParamRules {
    fn default() -> Self {
        Self {
            required: Vec::new(),
            max_params_bytes: DEFAULT_MAX_PARAMS_BYTES,
        }
    }
}

impl JobMethod for ParamRules {
    fn validate(&self, params: &Map<String, Value>) -> Result<(), RpcError> {
        for name in &self.required {
            match params.get(name) {
                None | Some(Value::Null) => {
                    return Err(RpcError::InvalidParams {
                        message: format!("Missing required parameter '{name}'"),
                    });
                }
                Some(_) => {}
            }
        }
        validate_params_size(params, self.max_params_bytes)
    }
}

/// What a method name resolves to.
#[derive(Clone)]
pub enum Capability {
    /// Submit a new job.
    Job(Arc<dyn JobMethod>),
    /// Watch an existing job.
    Watch,
    /// Stop watching a job.
    Unwatch,
    /// Ask the backend to cancel a job.
    Cancel,
    /// Application-level liveness check.
    Ping,
}

impl std::fmt::Debug for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Job(_) => f.write_str("Job"),
            Self::Watch => f.write_str("Watch"),
            Self::Unwatch => f.write_str("Unwatch"),
            Self::Cancel => f.write_str("Cancel"),
            Self::Ping => f.write_str("Ping"),
        }
    }
}

/// Registry mapping method names to capabilities.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    jobs: HashMap<String, Arc<dyn JobMethod>>,
}

impl MethodRegistry {
    /// Create a registry with no job methods (control methods are always
    /// available).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job method. Builtin control names cannot be shadowed.
    pub fn register(&mut self, method: &str, handler: impl JobMethod + 'static) {
        if BUILTIN_METHODS.contains(&method) {
            warn!(method, "refusing to register job method over builtin name");
            return;
        }
        let _ = self.jobs.insert(method.to_owned(), Arc::new(handler));
    }

    /// Resolve a method name.
    pub fn resolve(&self, method: &str) -> Result<Capability, RpcError> {
        match method {
            "watch" => Ok(Capability::Watch),
            "unwatch" => Ok(Capability::Unwatch),
            "cancel" => Ok(Capability::Cancel),
            "ping" => Ok(Capability::Ping),
            _ => self
                .jobs
                .get(method)
                .map(|h| Capability::Job(Arc::clone(h)))
                .ok_or_else(|| RpcError::UnknownMethod {
                    method: method.to_owned(),
                }),
        }
    }

    /// List registered job method names (sorted).
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check whether a job method is registered.
    pub fn has_method(&self, method: &str) -> bool {
        self.jobs.contains_key(method)
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.methods())
            .finish()
    }
}
