//! Top-level error and retry-policy types for the ContentWorks pipeline domain.
//!
//! [`PipelineError`] covers conditions that halt the executor or reject an
//! operator request. Collaborator failures have their own types:
//! [`ProducerError`] for stage producers, [`PublishError`] for destination
//! platforms, and [`StoreError`] for persistence.
//!
//! [`RetryPolicy`] is a cross-cutting concern: any error type that participates
//! in retry decisions must be able to produce a [`RetryPolicy`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{DestinationId, ItemId, LifecycleState, StageId};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// Returned by infrastructure error types to let the orchestrator decide
/// whether to re-invoke an operation without escalating.
///
/// - `Retryable` errors: transient rate-limit responses.
/// - `NonRetryable` errors: authorization failures, malformed requests, any
///   other rejection by the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    ///
    /// `after` optionally specifies the minimum delay before retrying (e.g.
    /// derived from a `Retry-After` response header).
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried automatically.
    NonRetryable,
}

// ---------------------------------------------------------------------------
// Pipeline-level errors
// ---------------------------------------------------------------------------

/// Errors that halt the executor or reject an operator request.
///
/// Stage FAIL verdicts are *not* errors: they are recorded in the item's
/// history and fed to the escalation tracker.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The pipeline configuration is invalid.
    ///
    /// Produced at load time; the executor never starts with an invalid config.
    #[error("Configuration error: {message}")]
    ConfigurationError {
        /// Description of the configuration problem.
        message: String,
    },

    /// An operator directive could not be applied to the tier's stage plan.
    #[error("Invalid directive: {message}")]
    InvalidDirective {
        /// Description of what was wrong with the directive.
        message: String,
    },

    /// No item with this identifier exists in the state store.
    #[error("Item {item} not found")]
    ItemNotFound {
        /// The identifier that was looked up.
        item: ItemId,
    },

    /// A lifecycle transition that the state machine does not allow.
    ///
    /// Terminal items (PUBLISHED, TERMINATED) reject every transition.
    #[error("Item {item}: transition {from:?} -> {to:?} is not allowed")]
    InvalidTransition {
        /// Item whose transition was rejected.
        item: ItemId,
        /// State the item is currently in.
        from: LifecycleState,
        /// State that was requested.
        to: LifecycleState,
    },

    /// A stage-level mutation was attempted on an item that is not running.
    #[error("Item {item} is {state:?}, not IN_PROGRESS")]
    NotInProgress {
        /// Item that rejected the mutation.
        item: ItemId,
        /// State the item is currently in.
        state: LifecycleState,
    },

    /// A stage in the plan has no registered producer.
    #[error("No producer registered for stage '{stage}'")]
    MissingProducer {
        /// Stage without a producer.
        stage: StageId,
    },

    /// A configured destination has no registered publisher.
    #[error("No publisher registered for destination '{destination}'")]
    MissingPublisher {
        /// Destination without a publisher.
        destination: DestinationId,
    },

    /// The state store failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PipelineError {
    /// Convenience constructor for [`PipelineError::ConfigurationError`].
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Collaborator errors
// ---------------------------------------------------------------------------

/// A stage producer failed to produce an artifact at all.
///
/// Distinct from a FAIL verdict (which implies an artifact existed but did not
/// meet the rubric); treated as a stage FAIL for escalation purposes.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum ProducerError {
    /// The producer ran but reported failure.
    #[error("producer failed: {message}")]
    Failed {
        /// Producer-supplied description.
        message: String,
    },

    /// The producer returned output the orchestrator could not interpret.
    #[error("producer returned malformed output: {message}")]
    MalformedOutput {
        /// Parse error description.
        message: String,
    },

    /// The producer did not answer within its configured time limit.
    #[error("producer timed out after {after:?}")]
    Timeout {
        /// The time limit that elapsed.
        after: Duration,
    },
}

/// A destination platform rejected an upload or post.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum PublishError {
    /// The platform signalled a rate limit. The only retryable subtype.
    #[error("rate limited by platform")]
    RateLimited {
        /// Platform-suggested delay, if it sent one.
        retry_after: Option<Duration>,
    },

    /// The platform rejected the request (authorization, malformed request, ...).
    #[error("rejected by platform (status {status:?}): {message}")]
    Rejected {
        /// HTTP status code, when the transport has one.
        status: Option<u16>,
        /// Platform-supplied description.
        message: String,
    },

    /// The request never reached the platform or its answer was unreadable.
    #[error("transport failure: {message}")]
    Transport {
        /// Transport-level description.
        message: String,
    },

    /// The asset blob to upload could not be read from the state store.
    #[error("asset unavailable: {message}")]
    AssetUnavailable {
        /// Store-level description.
        message: String,
    },

    /// The publish record or address cache could not be read or written.
    #[error("publish state unavailable: {message}")]
    Storage {
        /// Store-level description.
        message: String,
    },

    /// The publish was interrupted by an operator cancellation.
    #[error("publish cancelled")]
    Cancelled,
}

impl From<StoreError> for PublishError {
    fn from(e: StoreError) -> Self {
        Self::Storage {
            message: e.to_string(),
        }
    }
}

impl PublishError {
    /// Only rate limits are retried automatically.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::RateLimited { retry_after } => RetryPolicy::Retryable {
                after: *retry_after,
            },
            _ => RetryPolicy::NonRetryable,
        }
    }

    /// Returns `true` for the rate-limit subtype.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// The state store failed to read or write.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum StoreError {
    /// Filesystem or backend I/O failure.
    #[error("storage I/O failure: {message}")]
    Io {
        /// Underlying error description.
        message: String,
    },

    /// A stored document could not be encoded or decoded.
    #[error("storage serialisation failure: {message}")]
    Serialization {
        /// Underlying error description.
        message: String,
    },

    /// A content-addressed blob is missing.
    #[error("blob {fingerprint} not found")]
    BlobNotFound {
        /// Fingerprint that was looked up.
        fingerprint: String,
    },
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rate_limits_are_retryable() {
        let limited = PublishError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(
            limited.retry_policy(),
            RetryPolicy::Retryable {
                after: Some(Duration::from_secs(3))
            }
        );
        let rejected = PublishError::Rejected {
            status: Some(401),
            message: "bad token".into(),
        };
        assert_eq!(rejected.retry_policy(), RetryPolicy::NonRetryable);
        assert!(!rejected.is_rate_limited());
    }
}
