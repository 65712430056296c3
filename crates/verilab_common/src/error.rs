//! Error taxonomy for the API layer and resolvers.
//!
//! Transient errors are retried inside the API client and stay invisible to
//! callers unless the retry budget runs out. Configuration errors (TLS,
//! missing resources) fail fast and carry the specific remediation.

use thiserror::Error;

/// Transport and protocol errors surfaced by the API layer.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// HTTP 4xx other than 429. Never retried.
    #[error("API rejected request with HTTP {status}: {detail}")]
    Client { status: u16, detail: String },

    /// HTTP 429. Retryable; the server may supply an explicit Retry-After.
    #[error("API rate-limited the request (HTTP 429)")]
    RateLimited { retry_after_secs: Option<u64> },

    /// HTTP 5xx. Retryable.
    #[error("API server error (HTTP {status}): {detail}")]
    Server { status: u16, detail: String },

    /// Connection-level failure (reset, refused, unreachable). Retryable.
    #[error("connection error: {0}")]
    Connection(String),

    /// The transport-level timeout elapsed. Retryable.
    #[error("request timed out after {0}s")]
    Timeout(u64),

    /// TLS/certificate failure. A configuration error, never retried.
    #[error("TLS verification failed: {0}. If the endpoint uses a self-signed \
             certificate, set api.insecure_tls = true (lab use only)")]
    Tls(String),

    /// The response body did not match the shape its generation promises.
    #[error("malformed API response: {0}")]
    Malformed(String),

    /// Retry budget exhausted; carries the final attempt's error.
    #[error("giving up after {attempts} attempt(s): {last}")]
    RetriesExhausted { attempts: u32, last: Box<ApiError> },
}

impl ApiError {
    /// Whether the retry loop may attempt this call again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimited { .. }
                | ApiError::Server { .. }
                | ApiError::Connection(_)
                | ApiError::Timeout(_)
        )
    }
}

/// Errors from async-task and power-state waits.
#[derive(Debug, Clone, Error)]
pub enum WaitError {
    /// The server reported the operation failed.
    #[error("operation {handle} failed: {detail}")]
    Failed { handle: String, detail: String },

    /// The deadline passed before the operation reached a terminal state.
    /// Carries the handle so the stuck operation can be inspected.
    #[error("timed out after {timeout_secs}s waiting on {handle}")]
    Timeout { handle: String, timeout_secs: u64 },
}

/// Resolution failures for required resources.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("no {kind} named '{name}' found")]
    NotFound { kind: &'static str, name: String },

    #[error("{count} {kind}s match '{name}'; narrow the filter or use an explicit id")]
    Ambiguous {
        kind: &'static str,
        name: String,
        count: usize,
    },

    #[error("no isolated network detected; create a network whose name contains \
             'isolated', 'sandbox' or 'lab', or set recovery.isolated_network_id")]
    NoIsolatedNetwork,

    #[error("{count} networks look isolated; set recovery.isolated_network_name \
             to pick one explicitly")]
    AmbiguousIsolatedNetwork { count: usize },
}
