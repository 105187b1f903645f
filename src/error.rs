//! Error types for the research pipeline.
//!
//! Every failure that crosses a module boundary is one of these typed
//! errors. The [`Classify`] trait tells the retry helper and the
//! orchestrator whether an error is worth another attempt.

use crate::models::SourceKind;
use std::time::Duration;
use thiserror::Error;

/// Broad class of a failure, used for retry decisions and for the
/// completeness section of the report.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Rate limits, timeouts, temporary outages.
    Transient,
    /// Auth failures, malformed payloads, invalid model output.
    Permanent,
    /// Work abandoned because the stage or run deadline passed.
    Deadline,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Permanent => write!(f, "permanent"),
            ErrorClass::Deadline => write!(f, "deadline"),
        }
    }
}

/// Classification shared by all retryable errors.
pub trait Classify {
    fn class(&self) -> ErrorClass;

    /// Server-provided hint for how long to wait before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Failure of a single External Source Gateway call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    #[error(
        "rate limited{}",
        .retry_after.map(|d| format!(" (retry after {}s)", d.as_secs())).unwrap_or_default()
    )]
    RateLimited { retry_after: Option<Duration> },

    #[error("request timed out")]
    Timeout,

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("source unavailable: {0}")]
    Unavailable(String),
}

impl Classify for SourceError {
    fn class(&self) -> ErrorClass {
        match self {
            SourceError::RateLimited { .. }
            | SourceError::Timeout
            | SourceError::Unavailable(_) => ErrorClass::Transient,
            SourceError::AuthFailure(_) | SourceError::Malformed(_) => ErrorClass::Permanent,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Failure of a Capability Model inference.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CapabilityError {
    #[error("model request timed out")]
    Timeout,

    #[error("model quota exceeded")]
    QuotaExceeded,

    #[error("invalid model response: {0}")]
    InvalidResponse(String),

    #[error("model unavailable: {0}")]
    Unavailable(String),
}

impl Classify for CapabilityError {
    fn class(&self) -> ErrorClass {
        match self {
            CapabilityError::Timeout
            | CapabilityError::QuotaExceeded
            | CapabilityError::Unavailable(_) => ErrorClass::Transient,
            CapabilityError::InvalidResponse(_) => ErrorClass::Permanent,
        }
    }
}

/// Missing or invalid configuration, detected before any stage runs.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("no source kinds are enabled")]
    NoSourcesEnabled,

    #[error("source `{source_kind}` is enabled but has no endpoint configured")]
    MissingEndpoint { source_kind: SourceKind },

    #[error("source `{source_kind}` requires credential in environment variable `{var}`")]
    MissingCredential { source_kind: SourceKind, var: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Stage-level failure, reported to the orchestrator once the stage's
/// own recovery options are exhausted.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StageError {
    #[error("stage failed (transient): {0}")]
    Transient(String),

    #[error("stage failed: {0}")]
    Permanent(String),

    #[error("stage exceeded its deadline")]
    TimedOut,
}

impl Classify for StageError {
    fn class(&self) -> ErrorClass {
        match self {
            StageError::Transient(_) => ErrorClass::Transient,
            StageError::Permanent(_) => ErrorClass::Permanent,
            StageError::TimedOut => ErrorClass::Deadline,
        }
    }
}

/// Errors raised by the orchestrator itself.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("illegal run status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}
