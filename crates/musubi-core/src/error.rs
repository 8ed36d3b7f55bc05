//! Workflow error types.

use crate::step::StepName;
use thiserror::Error;

/// Errors raised while declaring or running step sequences.
///
/// Configuration errors (see [`WorkflowError::is_configuration`]) point at a
/// wiring mistake and are never retried. Everything else travels through a
/// step's failure path at run time.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum WorkflowError {
    /// A handler reported a failure.
    #[error("Step failed: {step_name}, details: {details}")]
    StepError {
        /// The name of the step that failed.
        step_name: StepName,
        /// Details about the failure.
        details: String,
    },

    /// A failure carrying only a message, usually coerced from a string.
    #[error("{0}")]
    Failed(String),

    /// A step did not settle within its timeout.
    #[error("Step {step_name} of module {module} timed out")]
    Timeout {
        /// The name of the step that timed out.
        step_name: StepName,
        /// The module owning the step.
        module: String,
    },

    /// A structured error payload received from a remote service.
    #[error("Remote error payload: {0}")]
    Payload(serde_json::Value),

    /// A step name was referenced but never declared.
    #[error("Step not found: {0}")]
    StepNotFound(StepName),

    /// No handler is registered for a declared step.
    #[error("No handler registered for step: {0}")]
    HandlerNotFound(StepName),

    /// A sequence name was referenced but never declared.
    #[error("Sequence not found: {0}")]
    SequenceNotFound(String),

    /// A step accepts names that no earlier step promises.
    #[error("Step '{step}' in sequence '{sequence}' accepts {missing:?}, which no earlier step promises")]
    MissingInputs {
        /// The sequence being validated.
        sequence: String,
        /// The offending step.
        step: StepName,
        /// The accepted names that were never promised.
        missing: Vec<String>,
    },

    /// A handler produced a different number of values than promised.
    #[error("Step '{step}' promised {expected} value(s) but produced {actual}")]
    ContractViolation {
        /// The offending step.
        step: StepName,
        /// Number of promised output names.
        expected: usize,
        /// Number of values actually produced.
        actual: usize,
    },

    /// A configurable property was read before being set.
    #[error("Configurable '{0}' has not been set")]
    Unconfigured(String),

    /// The declaration is otherwise invalid.
    #[error("Invalid workflow configuration: {0}")]
    Configuration(String),
}

impl WorkflowError {
    /// Creates a [`WorkflowError::StepError`].
    pub fn step(step_name: impl Into<StepName>, details: impl Into<String>) -> Self {
        Self::StepError {
            step_name: step_name.into(),
            details: details.into(),
        }
    }

    /// Returns `true` for errors caused by a wiring mistake rather than a run-time condition.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::StepNotFound(_)
                | Self::HandlerNotFound(_)
                | Self::SequenceNotFound(_)
                | Self::MissingInputs { .. }
                | Self::ContractViolation { .. }
                | Self::Unconfigured(_)
                | Self::Configuration(_)
        )
    }

    /// Returns `true` for [`WorkflowError::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<&str> for WorkflowError {
    fn from(s: &str) -> Self {
        Self::Failed(s.to_string())
    }
}

impl From<String> for WorkflowError {
    fn from(s: String) -> Self {
        Self::Failed(s)
    }
}

impl From<serde_json::Value> for WorkflowError {
    fn from(payload: serde_json::Value) -> Self {
        Self::Payload(payload)
    }
}
