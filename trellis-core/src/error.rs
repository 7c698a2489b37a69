//! Error types for the reactive runtime.
//!
//! Writes to frozen cells and failing formula bodies are reported
//! synchronously to the caller that triggered them. Subscriber callback
//! failures are collected during a flush so that one failing subscriber
//! never prevents the rest of the batch from being delivered.

use thiserror::Error;

use crate::reactive::SubscriptionId;

/// Boxed error returned by fallible subscriber callbacks.
pub type BoxError = Box<dyn std::error::Error + 'static>;

/// A write was attempted on a cell that has been frozen.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot write to frozen cell `{description}`")]
pub struct FrozenWriteError {
    description: String,
}

impl FrozenWriteError {
    pub(crate) fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
        }
    }

    /// Description of the frozen cell.
    pub fn description(&self) -> &str {
        &self.description
    }
}

/// A formula or resource body returned an error.
///
/// The formula keeps its last valid value and dependencies, so reading it
/// again retries the body.
#[derive(Debug, Error)]
#[error("evaluation of `{description}` failed: {source}")]
pub struct EvaluationError<E> {
    description: String,
    #[source]
    source: E,
}

impl<E> EvaluationError<E> {
    pub(crate) fn new(description: impl Into<String>, source: E) -> Self {
        Self {
            description: description.into(),
            source,
        }
    }

    /// Description of the formula whose body failed.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The error produced by the body.
    pub fn inner(&self) -> &E {
        &self.source
    }

    /// Consume the wrapper and return the body's error.
    pub fn into_inner(self) -> E {
        self.source
    }
}

/// One subscriber callback that failed (returned an error or panicked)
/// while a notification batch was being delivered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("subscriber {subscription} on `{description}` failed: {message}")]
pub struct CallbackFailure {
    /// The failing subscription.
    pub subscription: SubscriptionId,
    /// Description of the tag the subscription watches.
    pub description: String,
    /// Error or panic message.
    pub message: String,
}

/// Umbrella error for runtime-level operations.
#[derive(Debug, Error)]
pub enum ReactiveError {
    /// Writing to a frozen cell.
    #[error(transparent)]
    FrozenWrite(#[from] FrozenWriteError),

    /// One or more subscriber callbacks failed during a flush. Every other
    /// callback in the batch still ran.
    #[error("{} subscriber callback(s) failed during flush ({fired} fired)", .failures.len())]
    Callbacks {
        /// Number of callbacks invoked, including the failing ones.
        fired: usize,
        /// Every failure, in delivery order.
        failures: Vec<CallbackFailure>,
    },

    /// The notification queue kept refilling (callbacks writing cells they
    /// observe) and did not drain within the configured number of passes.
    #[error("notification queue did not settle after {passes} flush passes")]
    SettleLimit {
        /// Passes performed before giving up.
        passes: usize,
    },

    /// A runtime configuration document could not be parsed.
    #[error("invalid runtime configuration: {0}")]
    Config(#[from] serde_json::Error),
}

/// Result type for runtime operations.
pub type Result<T, E = ReactiveError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_write_message_names_cell() {
        let err = FrozenWriteError::new("settings.theme");
        assert_eq!(err.to_string(), "cannot write to frozen cell `settings.theme`");
        assert_eq!(err.description(), "settings.theme");
    }

    #[test]
    fn evaluation_error_exposes_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err = EvaluationError::new("loader", io);
        assert!(err.to_string().contains("loader"));
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.into_inner().kind(), std::io::ErrorKind::NotFound);
    }

    #[test]
    fn callbacks_error_counts_failures() {
        let err = ReactiveError::Callbacks {
            fired: 3,
            failures: vec![CallbackFailure {
                subscription: SubscriptionId::from_raw(7),
                description: "total".into(),
                message: "boom".into(),
            }],
        };
        assert_eq!(
            err.to_string(),
            "1 subscriber callback(s) failed during flush (3 fired)"
        );
    }
}
