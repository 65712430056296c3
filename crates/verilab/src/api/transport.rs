//! Single-call HTTP transport and the retrying API client.
//!
//! `Transport` performs exactly one round trip and classifies the outcome
//! into the error taxonomy; `ApiClient` drives the retry loop on top of it.
//! `FakeTransport` provides scripted responses for deterministic tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use verilab_common::ApiError;

use super::context::RequestContext;
use super::retry::RetryPolicy;

/// HTTP method subset the adapter uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

/// One request in canonical form, independent of generation.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path joined onto the configured base URL.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl ApiRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self { method: Method::Get, path: path.into(), query: Vec::new(), body: None }
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self { method: Method::Post, path: path.into(), query: Vec::new(), body: Some(body) }
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self { method: Method::Put, path: path.into(), query: Vec::new(), body: Some(body) }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self { method: Method::Delete, path: path.into(), query: Vec::new(), body: None }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Successful (2xx) response. Non-2xx statuses become `ApiError`s in the
/// transport so classification lives in one place.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
    /// ETag concurrency token, when the generation supplies one.
    pub etag: Option<String>,
}

impl ApiResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body, etag: None }
    }

    pub fn ok_with_etag(body: Value, etag: impl Into<String>) -> Self {
        Self { status: 200, body, etag: Some(etag.into()) }
    }
}

/// One HTTP round trip. No retries, no business logic.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, ctx: &RequestContext, req: &ApiRequest) -> Result<ApiResponse, ApiError>;
}

// ============================================================================
// Production transport (reqwest)
// ============================================================================

/// Credentials for the management endpoint.
#[derive(Debug, Clone)]
pub enum Auth {
    Basic { username: String, password: String },
    Bearer { token: String },
    None,
}

pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    auth: Auth,
    timeout_secs: u64,
}

impl HttpTransport {
    /// Build the transport. TLS verification stays on unless `insecure_tls`
    /// was set explicitly.
    pub fn new(
        base_url: &str,
        auth: Auth,
        timeout_secs: u64,
        insecure_tls: bool,
    ) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(timeout_secs));
        if insecure_tls {
            warn!("TLS certificate verification is DISABLED (api.insecure_tls = true)");
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            timeout_secs,
        })
    }

    fn classify(&self, err: &reqwest::Error) -> ApiError {
        if err.is_timeout() {
            return ApiError::Timeout(self.timeout_secs);
        }
        let text = err.to_string();
        if err.is_connect() || err.is_request() {
            if text.contains("tls") || text.contains("certificate") || text.contains("Ssl") {
                return ApiError::Tls(text);
            }
            return ApiError::Connection(text);
        }
        ApiError::Connection(text)
    }
}

/// Keep error payloads readable in logs and messages.
fn truncate_detail(mut s: String) -> String {
    const MAX: usize = 512;
    if s.len() > MAX {
        s.truncate(MAX);
        s.push_str("...");
    }
    s
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, ctx: &RequestContext, req: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let url = format!("{}{}", self.base_url, req.path);

        let mut builder = match req.method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
            Method::Delete => self.client.delete(&url),
        };

        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        builder = builder.header("X-Correlation-Id", ctx.correlation_id.to_string());
        if let Some(token) = &ctx.concurrency_token {
            builder = builder.header(reqwest::header::IF_MATCH, token);
        }
        if let Some(key) = &ctx.idempotency_key {
            builder = builder.header("Idempotency-Key", key.to_string());
        }
        builder = match &self.auth {
            Auth::Basic { username, password } => builder.basic_auth(username, Some(password)),
            Auth::Bearer { token } => builder.bearer_auth(token),
            Auth::None => builder,
        };
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| self.classify(&e))?;
        let status = response.status();
        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let retry_after = parse_retry_after(response.headers());

        if status.as_u16() == 429 {
            return Err(ApiError::RateLimited { retry_after_secs: retry_after });
        }
        if status.is_client_error() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ApiError::Client {
                status: status.as_u16(),
                detail: truncate_detail(detail),
            });
        }
        if status.is_server_error() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ApiError::Server {
                status: status.as_u16(),
                detail: truncate_detail(detail),
            });
        }

        let body = if status == reqwest::StatusCode::NO_CONTENT {
            Value::Null
        } else {
            response
                .json()
                .await
                .map_err(|e| ApiError::Malformed(format!("body was not JSON: {}", e)))?
        };

        Ok(ApiResponse { status: status.as_u16(), body, etag })
    }
}

// ============================================================================
// Retrying client
// ============================================================================

/// Executes requests under a retry policy. Every attempt is logged with the
/// call's correlation id; callers only see the final outcome.
pub struct ApiClient {
    transport: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { transport, policy }
    }

    pub async fn call(
        &self,
        ctx: &RequestContext,
        req: &ApiRequest,
    ) -> Result<ApiResponse, ApiError> {
        let max = self.policy.max_attempts();
        let mut last = ApiError::Connection("request was never attempted".to_string());

        for attempt in 0..max {
            debug!(
                "[{}] {} {} (attempt {}/{})",
                ctx.correlation_id,
                req.method.as_str(),
                req.path,
                attempt + 1,
                max
            );

            match self.transport.execute(ctx, req).await {
                Ok(response) => {
                    debug!("[{}] HTTP {}", ctx.correlation_id, response.status);
                    return Ok(response);
                }
                Err(e) if !e.is_retryable() => {
                    warn!("[{}] non-retryable: {}", ctx.correlation_id, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "[{}] attempt {}/{} failed: {}",
                        ctx.correlation_id,
                        attempt + 1,
                        max,
                        e
                    );
                    let retry_after = match &e {
                        ApiError::RateLimited { retry_after_secs } => *retry_after_secs,
                        _ => None,
                    };
                    last = e;
                    if attempt + 1 < max {
                        let delay = self.policy.delay_for(attempt, retry_after);
                        debug!("[{}] backing off {:?}", ctx.correlation_id, delay);
                        sleep(delay).await;
                    }
                }
            }
        }

        Err(ApiError::RetriesExhausted { attempts: max, last: Box::new(last) })
    }
}

// ============================================================================
// Fake transport (testing)
// ============================================================================

/// One observed call, for test assertions.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub method: String,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub correlation_id: Uuid,
    pub if_match: Option<String>,
    pub idempotency_key: Option<Uuid>,
}

/// Scripted transport for deterministic tests: an ordered response queue,
/// persistent path routes, and a call log.
#[derive(Default)]
pub struct FakeTransport {
    /// Consumed first, in order, when non-empty.
    queue: Mutex<VecDeque<Result<ApiResponse, ApiError>>>,
    /// (method, path substring) routes checked after the queue drains.
    routes: Mutex<Vec<(Method, String, Result<ApiResponse, ApiError>)>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue the next response regardless of what is requested.
    pub fn push(&self, response: Result<ApiResponse, ApiError>) {
        self.queue.lock().unwrap().push_back(response);
    }

    /// Answer every `method` request whose path contains `pattern`.
    pub fn route(
        &self,
        method: Method,
        pattern: impl Into<String>,
        response: Result<ApiResponse, ApiError>,
    ) {
        self.routes.lock().unwrap().push((method, pattern.into(), response));
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Calls whose path contains `pattern`, optionally limited to a method.
    pub fn calls_matching(&self, method: Option<Method>, pattern: &str) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.path.contains(pattern))
            .filter(|c| method.map(|m| c.method == m.as_str()).unwrap_or(true))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn execute(&self, ctx: &RequestContext, req: &ApiRequest) -> Result<ApiResponse, ApiError> {
        self.calls.lock().unwrap().push(RecordedCall {
            method: req.method.as_str().to_string(),
            path: req.path.clone(),
            query: req.query.clone(),
            body: req.body.clone(),
            correlation_id: ctx.correlation_id,
            if_match: ctx.concurrency_token.clone(),
            idempotency_key: ctx.idempotency_key,
        });

        if let Some(next) = self.queue.lock().unwrap().pop_front() {
            return next;
        }
        let routes = self.routes.lock().unwrap();
        for (method, pattern, response) in routes.iter() {
            if *method == req.method && req.path.contains(pattern.as_str()) {
                return response.clone();
            }
        }
        Err(ApiError::Client {
            status: 404,
            detail: format!("no scripted response for {} {}", req.method.as_str(), req.path),
        })
    }
}
