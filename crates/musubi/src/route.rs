//! Sequences triggered by inbound requests.

use crate::continuation::Continuation;
use crate::sequence::StepSequence;
use musubi_core::{value, Value, WorkflowError};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Value name of the inbound request.
pub const REQUEST: &str = "req";
/// Value name of the response handle.
pub const RESPONSE: &str = "res";
/// Value name of the [`Next`] error-forwarding callback.
pub const NEXT: &str = "next";

/// HTTP method a route sequence answers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    /// `GET`
    Get,
    /// `POST`
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "get"),
            Method::Post => write!(f, "post"),
        }
    }
}

/// The error-forwarding callback handed in by the routing layer.
#[derive(Clone)]
pub struct Next(Arc<dyn Fn(WorkflowError) + Send + Sync>);

impl Next {
    /// Wraps `f`.
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(WorkflowError) + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    /// Forwards `error` to the routing layer.
    pub fn call(&self, error: WorkflowError) {
        (self.0)(error)
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Next")
    }
}

/// A sequence mounted on a route.
///
/// The path is not fixed at declaration time: it is read from the module's
/// configurable named by the path alias, so a submodule can mount the same
/// sequence elsewhere.
#[derive(Debug, Clone)]
pub struct RouteTriggeredSequence {
    sequence: StepSequence,
    method: Method,
    alias: String,
}

impl RouteTriggeredSequence {
    pub(crate) fn new(sequence: StepSequence, method: Method, alias: impl Into<String>) -> Self {
        Self {
            sequence,
            method,
            alias: alias.into(),
        }
    }

    /// The HTTP method.
    pub fn method(&self) -> Method {
        self.method
    }

    /// The configurable holding the path.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// The mounted sequence.
    pub fn sequence(&self) -> &StepSequence {
        &self.sequence
    }

    /// Resolves the path from the module configuration.
    pub fn path(&self) -> Result<String, WorkflowError> {
        self.sequence.module().get::<String>(&self.alias)
    }

    fn first_step_args(&self, req: &Value, res: &Value, next: &Next) -> Vec<Value> {
        let Some(first) = self
            .sequence
            .step_names()
            .first()
            .and_then(|name| self.sequence.module().step(name.as_str()))
        else {
            return Vec::new();
        };
        first
            .contract()
            .accepted()
            .iter()
            .filter_map(|name| match name.as_str() {
                REQUEST => Some(req.clone()),
                RESPONSE => Some(res.clone()),
                NEXT => Some(value(next.clone())),
                _ => None,
            })
            .collect()
    }

    /// Runs a fresh instance of the sequence for one request.
    ///
    /// `req`, `res` and `next` are stored under [`REQUEST`], [`RESPONSE`] and
    /// [`NEXT`]. The first step receives whichever of them it accepts, in the
    /// order it accepts them.
    ///
    /// # Errors
    ///
    /// Returns the configuration error that prevented the start. The error
    /// has already been forwarded to `next` as well.
    pub fn trigger(&self, req: Value, res: Value, next: Next) -> Result<Continuation, WorkflowError> {
        let instance = self.sequence.materialize();
        let values = instance.values();
        values.insert_value(REQUEST, req.clone());
        values.insert_value(RESPONSE, res.clone());
        values.insert(NEXT, next.clone());

        let args = self.first_step_args(&req, &res, &next);
        instance
            .start(args)
            .map_err(|error| {
                warn!(
                    sequence = %self.sequence.name(),
                    method = %self.method,
                    %error,
                    "route sequence failed to start"
                );
                next.call(error.clone());
                error
            })
    }
}
