//! Runtime configuration.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Settings for a [`Runtime`](crate::reactive::Runtime).
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```rust
/// use trellis_core::RuntimeConfig;
///
/// let config = RuntimeConfig::from_json(r#"{ "name": "editor" }"#).unwrap();
/// assert_eq!(config.name, "editor");
/// assert!(config.isolate_panics);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Name attached to log events emitted by this runtime.
    pub name: String,

    /// Catch panics raised by subscriber callbacks and finalizers, so the
    /// rest of a flush or finalization still runs. Failures are reported
    /// afterwards either way.
    pub isolate_panics: bool,

    /// Maximum number of flush passes [`Runtime::settle`] performs before
    /// giving up on a queue that keeps refilling.
    ///
    /// [`Runtime::settle`]: crate::reactive::Runtime::settle
    pub settle_limit: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "trellis".to_string(),
            isolate_panics: true,
            settle_limit: 64,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the runtime name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Enable or disable panic isolation.
    pub fn with_isolate_panics(mut self, isolate: bool) -> Self {
        self.isolate_panics = isolate;
        self
    }

    /// Set the settle pass limit.
    pub fn with_settle_limit(mut self, limit: usize) -> Self {
        self.settle_limit = limit;
        self
    }
}
