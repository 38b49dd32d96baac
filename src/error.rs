//! Error taxonomy shared across the cache stack, the control-plane client,
//! and the refresher.

use thiserror::Error;

/// Errors surfaced by the K/V store adapter and everything layered on it.
///
/// `Clone` so the single-flight coalescing primitive (`cache::singleflight`)
/// can hand the same outcome to every waiting caller without re-running the
/// underlying fetch.
#[derive(Debug, Error, Clone)]
pub enum CacheError {
    /// Logical absence of a key. Not logged as an error and not counted as
    /// one in metrics (see `cache::metrics_cache`).
    #[error("not found")]
    NotFound,

    /// Transport or decoding failure.
    #[error("internal cache error: {0}")]
    Internal(String),

    /// The store is unreachable (health check fails).
    #[error("cache connection refused: {0}")]
    ConnRefused(String),
}

impl CacheError {
    /// Whether this error kind counts as an "error" for metrics purposes.
    /// `NotFound` is a normal outcome, not a failure.
    pub fn is_metrics_error(&self) -> bool {
        !matches!(self, CacheError::NotFound)
    }
}

/// Errors surfaced by the control-plane HTTP client.
#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal control-plane error: {0}")]
    Internal(String),
}

impl ControlPlaneError {
    /// Map an HTTP status code to a `ControlPlaneError` kind.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        match status {
            400 => ControlPlaneError::BadRequest(body),
            401 | 403 => ControlPlaneError::Unauthorized(body),
            404 => ControlPlaneError::NotFound(body),
            _ => ControlPlaneError::Internal(format!("status {status}: {body}")),
        }
    }
}

/// Errors from the refresher's message dispatch.
#[derive(Debug, Error)]
pub enum RefresherError {
    #[error("unexpected message domain: {0}")]
    UnexpectedMessageDomain(String),

    #[error("unexpected event type {event} for domain {domain}")]
    UnexpectedEventType { domain: String, event: String },

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
}
