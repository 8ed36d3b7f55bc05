//! Module-level settings.

use musubi_core::WorkflowError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default step timeout, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Settings a [`Module`](crate::Module) applies to its steps.
///
/// # Examples
///
/// ```
/// use musubi::ModuleConfig;
/// use std::time::Duration;
///
/// let config = ModuleConfig::from_json_str(r#"{ "timeout_ms": 2500, "debug": true }"#).unwrap();
/// assert_eq!(config.timeout(), Some(Duration::from_millis(2500)));
/// assert!(config.debug);
///
/// // An explicit null disables the timeout.
/// let never = ModuleConfig::from_json_str(r#"{ "timeout_ms": null }"#).unwrap();
/// assert_eq!(never.timeout(), None);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Default per-step timeout in milliseconds. `None` means never.
    pub timeout_ms: Option<u64>,
    /// Log every executed step at `info` level.
    pub debug: bool,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            timeout_ms: Some(DEFAULT_TIMEOUT_MS),
            debug: false,
        }
    }
}

impl ModuleConfig {
    /// Parses a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, WorkflowError> {
        serde_json::from_str(json)
            .map_err(|e| WorkflowError::Configuration(format!("invalid module config: {e}")))
    }

    /// The default step timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}
