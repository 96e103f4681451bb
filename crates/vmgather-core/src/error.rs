//! Error kinds shared across every core module.
//!
//! One flat enum rather than per-module error types: callers (the Job
//! Manager, the Pipeline, and eventually an HTTP layer) all need to map the
//! *same* vocabulary of kinds onto behavior (retry, surface to operator, map
//! to a status code), so splitting them per module would just push that
//! mapping logic back up to every caller.

use std::path::PathBuf;

/// The kinds of failure a core operation can surface.
#[derive(Debug, thiserror::Error)]
pub enum GatherError {
    /// Credentials were rejected or missing.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// The VM endpoint does not expose the requested route (e.g. no
    /// streaming export endpoint).
    #[error("route missing: {0}")]
    RouteMissing(String),

    /// A retryable failure: timeouts, 5xx, connection resets.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The VM endpoint responded with malformed JSON or a non-success
    /// `status` field.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// A record in an export stream could not be decoded.
    #[error("decode error: {0}")]
    DecodeError(String),

    /// A record could not be re-serialized for staging.
    #[error("marshal error: {0}")]
    MarshalError(String),

    /// The configured (or recommended) staging directory is not usable.
    #[error("staging directory unavailable: {0}")]
    StagingUnavailable(String),

    /// The caller's context was canceled.
    #[error("canceled")]
    Canceled,

    /// The Job Manager is at its concurrency limit.
    #[error("at capacity: {running}/{max} jobs running")]
    AtCapacity {
        /// Jobs currently running.
        running: usize,
        /// Configured concurrency cap.
        max: usize,
    },

    /// No such job, component, or path.
    #[error("not found: {0}")]
    NotFound(String),

    /// `Resume` was called on a job that is not eligible for resumption.
    #[error("not resumable: {0}")]
    NotResumable(String),

    /// A requested path escapes its confinement root.
    #[error("forbidden: path {path} is outside the allowed directory")]
    Forbidden {
        /// The offending resolved path.
        path: PathBuf,
    },

    /// A job is already in a terminal state and cannot transition again.
    #[error("already terminal: job is already {0}")]
    AlreadyTerminal(String),
}

/// Convenience alias used throughout the core.
pub type Result<T> = std::result::Result<T, GatherError>;
