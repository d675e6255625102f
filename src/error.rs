//! Error taxonomy for the note pipeline
//!
//! Every per-item failure in the pipeline maps onto one of these variants.
//! Consumers decide whether to ack, retry or drop based on
//! [`PipelineError::is_transient`].

use std::time::Duration;
use thiserror::Error;

/// Result type alias using the pipeline's error type.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors raised by pipeline components.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Referenced note no longer exists. Benign, the item is skipped.
    #[error("note not found: {0}")]
    NotFound(String),

    /// A store, queue or topic call failed.
    #[error("transient I/O error: {0}")]
    TransientIo(String),

    /// A downstream call exceeded its per-call timeout.
    #[error("{op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// A record or message is missing required fields or is not valid JSON.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Type mismatch while evaluating a routing predicate.
    #[error("predicate evaluation error: {0}")]
    PredicateEvaluation(String),

    /// Invalid rule, subscription or configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether the failure should be left to the upstream redelivery mechanism
    /// (or a bounded local retry) rather than dropped.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_) | Self::Timeout { .. })
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        Self::MalformedInput(err.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        Self::TransientIo(err.to_string())
    }
}

/// Run `fut` under `after`, mapping an elapsed deadline to [`PipelineError::Timeout`].
pub async fn with_timeout<T, F>(op: &'static str, after: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(res) => res,
        Err(_) => Err(PipelineError::Timeout { op, after }),
    }
}
