//! Per-call request context: correlation id, target generation, and the
//! conditional tokens one generation requires.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The two supported (and incompatible) wire conventions of the management
/// API. Callers above the adapter never observe which one served a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiGeneration {
    /// POST `/list` pagination (length/offset), version counter inside the
    /// resource body, no separate concurrency token.
    V3,
    /// GET paging (`$page`/`$limit`), ETag concurrency tokens via If-Match,
    /// idempotency keys on non-idempotent mutations.
    V4,
}

/// Context for one logical API call. Created per call and discarded after
/// the call completes or exhausts its retries.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Logged with every attempt so a failure can be traced end to end.
    pub correlation_id: Uuid,
    pub generation: ApiGeneration,
    /// ETag-style token echoed back as If-Match on V4 mutations.
    pub concurrency_token: Option<String>,
    /// Dedup key for non-idempotent V4 mutations. Constant across retries
    /// of one logical attempt; a new logical attempt mints a new key.
    pub idempotency_key: Option<Uuid>,
}

impl RequestContext {
    pub fn new(generation: ApiGeneration) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            generation,
            concurrency_token: None,
            idempotency_key: None,
        }
    }

    /// Mint a fresh idempotency key for a new logical mutation.
    pub fn with_idempotency_key(mut self) -> Self {
        self.idempotency_key = Some(Uuid::new_v4());
        self
    }

    pub fn with_concurrency_token(mut self, token: impl Into<String>) -> Self {
        self.concurrency_token = Some(token.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_context_has_correlation_id_only() {
        let ctx = RequestContext::new(ApiGeneration::V4);
        assert!(ctx.concurrency_token.is_none());
        assert!(ctx.idempotency_key.is_none());
    }

    #[test]
    fn test_each_logical_attempt_gets_a_fresh_key() {
        let a = RequestContext::new(ApiGeneration::V4).with_idempotency_key();
        let b = RequestContext::new(ApiGeneration::V4).with_idempotency_key();
        assert_ne!(a.idempotency_key, b.idempotency_key);
        assert_ne!(a.correlation_id, b.correlation_id);
    }
}
