use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::future::try_join_all;
use paralon_contracts::constraints::RemoteParams;
use paralon_contracts::requests::RemoteOperation;
use reqwest::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::{Client as HttpClient, RequestBuilder, Response as HttpResponse, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_API_BASE: &str = "https://paraloncloud.com/v1";
const ERROR_BODY_MAX_CHARS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base, 2x base, 4x base...
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let doublings = retry.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }
}

#[derive(Clone)]
pub struct RemoteConfig {
    pub api_base: String,
    pub api_key: String,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// Forwarded as `response_format` when set (`url` or `b64_json`).
    pub response_format: Option<String>,
}

impl RemoteConfig {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        let api_base: String = api_base.into();
        let api_base = api_base.trim().trim_end_matches('/');
        Self {
            api_base: if api_base.is_empty() {
                DEFAULT_API_BASE.to_string()
            } else {
                api_base.to_string()
            },
            api_key: api_key.into(),
            request_timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            response_format: None,
        }
    }

    pub fn endpoint(&self, operation: RemoteOperation) -> String {
        format!("{}{}", self.api_base, operation.path())
    }
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("api_base", &self.api_base)
            .field("api_key", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .field("retry", &self.retry)
            .field("response_format", &self.response_format)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    BadRequest,
    Unauthorized,
    NotFound,
    RateLimited,
    Other,
}

impl RejectionKind {
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                RejectionKind::BadRequest
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RejectionKind::Unauthorized,
            StatusCode::NOT_FOUND => RejectionKind::NotFound,
            StatusCode::TOO_MANY_REQUESTS => RejectionKind::RateLimited,
            _ => RejectionKind::Other,
        }
    }

    fn hint(&self) -> Option<&'static str> {
        match self {
            RejectionKind::Unauthorized => Some("check PARALONCLOUD_API_KEY"),
            RejectionKind::NotFound => Some("check PARALONCLOUD_API_BASE"),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote {operation} rejected ({status}): {message}")]
    Rejected {
        operation: &'static str,
        status: u16,
        kind: RejectionKind,
        message: String,
    },
    #[error("remote {operation} failed ({status}) after {attempts} attempt(s): {message}")]
    Server {
        operation: &'static str,
        status: u16,
        message: String,
        attempts: u32,
    },
    #[error("remote {operation} transport failure after {attempts} attempt(s): {message}")]
    Transport {
        operation: &'static str,
        message: String,
        attempts: u32,
    },
    #[error("remote {operation} timed out after {attempts} attempt(s)")]
    Timeout {
        operation: &'static str,
        attempts: u32,
    },
    #[error("remote {operation} returned an invalid response: {message}")]
    InvalidResponse {
        operation: &'static str,
        message: String,
    },
    #[error("remote {operation} request could not be built: {message}")]
    Build {
        operation: &'static str,
        message: String,
    },
}

impl RemoteError {
    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Rejected { status, .. } | RemoteError::Server { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Whether the fault class is one the client retries internally.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RemoteError::Server { .. } | RemoteError::Transport { .. } | RemoteError::Timeout { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub file_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteInputs {
    pub image: Option<InputImage>,
    pub mask: Option<InputImage>,
}

/// One result entry as the remote returned it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImagePayload {
    Inline(Vec<u8>),
    Remote(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteImage {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

#[async_trait]
pub trait RemoteImages: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        params: &RemoteParams,
        inputs: &RemoteInputs,
    ) -> Result<Vec<RemoteImage>, RemoteError>;
}

/// HTTP client for the OpenAI-compatible image endpoints. Cheap to clone;
/// clones share the connection pool and the config snapshot.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: HttpClient,
    config: Arc<RemoteConfig>,
}

impl RemoteClient {
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            http: HttpClient::new(),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn build_request(
        &self,
        params: &RemoteParams,
        inputs: &RemoteInputs,
    ) -> Result<RequestBuilder, RemoteError> {
        let builder = self
            .http
            .post(self.config.endpoint(params.operation))
            .bearer_auth(&self.config.api_key);
        match params.operation {
            RemoteOperation::Generation => Ok(builder.json(&Value::Object(
                generation_payload(params, self.config.response_format.as_deref()),
            ))),
            RemoteOperation::Edit | RemoteOperation::Variation => {
                Ok(builder.multipart(self.multipart_form(params, inputs)?))
            }
        }
    }

    fn multipart_form(
        &self,
        params: &RemoteParams,
        inputs: &RemoteInputs,
    ) -> Result<MultipartForm, RemoteError> {
        let operation = params.operation.label();
        let image = inputs.image.as_ref().ok_or_else(|| RemoteError::Build {
            operation,
            message: "an input image is required".to_string(),
        })?;
        let mut form = MultipartForm::new()
            .text("model", params.model.clone())
            .text("size", params.size.clone())
            .text("n", params.n.to_string())
            .part("image", file_part(operation, image)?);

        if params.operation == RemoteOperation::Edit {
            form = form.text("prompt", params.prompt.clone().unwrap_or_default());
            if let Some(mask) = inputs.mask.as_ref() {
                form = form.part("mask", file_part(operation, mask)?);
            }
        }
        if let Some(format) = self.config.response_format.as_deref() {
            form = form.text("response_format", format.to_string());
        }
        Ok(form)
    }

    /// Sends with bounded retries. Each attempt covers the request and the
    /// full body read under one deadline, so a stalled body counts as a
    /// timeout. 5xx, timeouts and connection faults are retried with
    /// exponential backoff; any other non-success status is returned
    /// immediately as a rejection.
    async fn send_with_retry<F>(
        &self,
        operation: &'static str,
        build: F,
    ) -> Result<RemoteBody, RemoteError>
    where
        F: Fn() -> Result<RequestBuilder, RemoteError>,
    {
        let policy = self.config.retry;
        let max_attempts = policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let request = build()?;
            let outcome = tokio::time::timeout(
                self.config.request_timeout,
                execute(operation, request, attempt),
            )
            .await;
            let failure = match outcome {
                Ok(Ok(body)) => return Ok(body),
                Ok(Err(err)) if err.is_retryable() => err,
                Ok(Err(err)) => return Err(err),
                Err(_) => RemoteError::Timeout {
                    operation,
                    attempts: attempt,
                },
            };

            if attempt >= max_attempts {
                return Err(failure);
            }
            let delay = policy.delay_before_retry(attempt);
            warn!(
                operation,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "retrying remote call after transient failure"
            );
            tokio::time::sleep(delay).await;
        }

        unreachable!("remote retry loop should always return a response or error")
    }

    pub async fn resolve_payload(
        &self,
        operation: &'static str,
        payload: ImagePayload,
    ) -> Result<RemoteImage, RemoteError> {
        match payload {
            ImagePayload::Inline(bytes) => Ok(RemoteImage {
                bytes,
                mime_type: None,
            }),
            ImagePayload::Remote(url) => self.download_image(operation, &url).await,
        }
    }

    async fn download_image(
        &self,
        operation: &'static str,
        url: &str,
    ) -> Result<RemoteImage, RemoteError> {
        debug!(operation, url, "fetching remote image result");
        let body = self
            .send_with_retry(operation, || Ok(self.http.get(url)))
            .await?;
        Ok(RemoteImage {
            bytes: body.bytes,
            mime_type: body.content_type,
        })
    }
}

#[async_trait]
impl RemoteImages for RemoteClient {
    fn name(&self) -> &str {
        "remote"
    }

    async fn invoke(
        &self,
        params: &RemoteParams,
        inputs: &RemoteInputs,
    ) -> Result<Vec<RemoteImage>, RemoteError> {
        let operation = params.operation.label();
        info!(
            operation,
            model = %params.model,
            size = %params.size,
            n = params.n,
            "dispatching remote image request"
        );

        let body = self
            .send_with_retry(operation, || self.build_request(params, inputs))
            .await?;
        let payloads = parse_images_response(operation, &body.bytes)?;
        let images = try_join_all(
            payloads
                .into_iter()
                .map(|payload| self.resolve_payload(operation, payload)),
        )
        .await?;

        info!(operation, images = images.len(), "remote image request completed");
        Ok(images)
    }
}

/// A successful response, fully read.
#[derive(Debug)]
struct RemoteBody {
    bytes: Vec<u8>,
    content_type: Option<String>,
}

/// One attempt: send, classify the status, read the body. Retryability is
/// decided by the caller from the returned error.
async fn execute(
    operation: &'static str,
    request: RequestBuilder,
    attempt: u32,
) -> Result<RemoteBody, RemoteError> {
    let response = request
        .send()
        .await
        .map_err(|err| transport_failure(operation, "request failed", err, attempt))?;
    let status = response.status();

    if status.is_server_error() {
        return Err(RemoteError::Server {
            operation,
            status: status.as_u16(),
            message: error_message(response).await,
            attempts: attempt,
        });
    }
    if !status.is_success() {
        let kind = RejectionKind::from_status(status);
        let mut message = error_message(response).await;
        if let Some(hint) = kind.hint() {
            message = format!("{message} ({hint})");
        }
        return Err(RemoteError::Rejected {
            operation,
            status: status.as_u16(),
            kind,
            message,
        });
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let bytes = response.bytes().await.map_err(|err| {
        transport_failure(operation, "failed reading response body", err, attempt)
    })?;
    Ok(RemoteBody {
        bytes: bytes.to_vec(),
        content_type,
    })
}

/// Timeouts and connection faults stay retryable; anything else about the
/// request itself is reported as a build failure and not retried.
fn transport_failure(
    operation: &'static str,
    context: &str,
    err: reqwest::Error,
    attempt: u32,
) -> RemoteError {
    if err.is_timeout() {
        return RemoteError::Timeout {
            operation,
            attempts: attempt,
        };
    }
    if err.is_body() || err.is_decode() || is_retryable_transport_error(&err) {
        return RemoteError::Transport {
            operation,
            message: format!("{context}: {err}"),
            attempts: attempt,
        };
    }
    RemoteError::Build {
        operation,
        message: format!("{context}: {err}"),
    }
}

#[derive(Debug, Deserialize)]
struct ImagesResponse {
    #[serde(default)]
    data: Vec<ImageDatum>,
}

#[derive(Debug, Deserialize)]
struct ImageDatum {
    b64_json: Option<String>,
    url: Option<String>,
}

/// Normalizes the `data` array into tagged payloads, decoding inline base64
/// on the way. An empty array is an error: callers never get zero images.
pub fn parse_images_response(
    operation: &'static str,
    body: &[u8],
) -> Result<Vec<ImagePayload>, RemoteError> {
    let invalid = |message: String| RemoteError::InvalidResponse { operation, message };
    let parsed: ImagesResponse = serde_json::from_slice(body)
        .map_err(|err| invalid(format!("malformed JSON payload: {err}")))?;
    if parsed.data.is_empty() {
        return Err(invalid("response contained no images".to_string()));
    }

    parsed
        .data
        .into_iter()
        .enumerate()
        .map(|(idx, datum)| {
            if let Some(b64) = datum.b64_json.filter(|value| !value.is_empty()) {
                return BASE64
                    .decode(b64.as_bytes())
                    .map(ImagePayload::Inline)
                    .map_err(|err| invalid(format!("image {idx} base64 decode failed: {err}")));
            }
            if let Some(url) = datum.url.filter(|value| !value.is_empty()) {
                return Ok(ImagePayload::Remote(url));
            }
            Err(invalid(format!("image {idx} carried neither b64_json nor url")))
        })
        .collect()
}

fn generation_payload(params: &RemoteParams, response_format: Option<&str>) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("model".to_string(), json!(params.model));
    payload.insert(
        "prompt".to_string(),
        json!(params.prompt.clone().unwrap_or_default()),
    );
    payload.insert("size".to_string(), json!(params.size));
    payload.insert("n".to_string(), json!(params.n));
    if let Some(quality) = params.quality.as_ref() {
        payload.insert("quality".to_string(), Value::String(quality.clone()));
    }
    if let Some(format) = response_format {
        payload.insert(
            "response_format".to_string(),
            Value::String(format.to_string()),
        );
    }
    payload
}

fn file_part(operation: &'static str, image: &InputImage) -> Result<MultipartPart, RemoteError> {
    MultipartPart::bytes(image.bytes.clone())
        .file_name(image.file_name.clone())
        .mime_str(&image.mime_type)
        .map_err(|err| RemoteError::Build {
            operation,
            message: format!("invalid mime '{}': {err}", image.mime_type),
        })
}

async fn error_message(response: HttpResponse) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let from_json = serde_json::from_str::<Value>(&body).ok().and_then(|value| {
        let error = value.get("error")?;
        error
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| error.as_str())
            .map(str::to_string)
    });
    if let Some(message) = from_json {
        return message;
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return status
            .canonical_reason()
            .unwrap_or("no response body")
            .to_string();
    }
    truncate_text(trimmed, ERROR_BODY_MAX_CHARS)
}

fn is_retryable_transport_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_request()
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::extract::{Multipart, State};
    use axum::http::{header, HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use base64::Engine as _;
    use futures::stream::{self, StreamExt};
    use paralon_contracts::constraints::RemoteParams;
    use paralon_contracts::requests::RemoteOperation;
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::{
        parse_images_response, ImagePayload, InputImage, RejectionKind, RemoteClient,
        RemoteConfig, RemoteError, RemoteImages, RemoteInputs, RetryPolicy, BASE64,
    };

    async fn bind() -> anyhow::Result<(TcpListener, String)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let base = format!("http://{}", listener.local_addr()?);
        Ok((listener, base))
    }

    fn serve(listener: TcpListener, router: Router) {
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
    }

    fn client(api_base: &str, max_attempts: u32) -> RemoteClient {
        let mut config = RemoteConfig::new(api_base, "test-key");
        config.retry = RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        };
        config.request_timeout = Duration::from_secs(5);
        RemoteClient::new(config)
    }

    fn generation(n: u32) -> RemoteParams {
        RemoteParams {
            operation: RemoteOperation::Generation,
            model: "dall-e-2".to_string(),
            size: "256x256".to_string(),
            quality: None,
            n,
            prompt: Some("a red cube".to_string()),
        }
    }

    fn b64_body<T: AsRef<[u8]>>(payloads: &[T]) -> serde_json::Value {
        let data: Vec<_> = payloads
            .iter()
            .map(|bytes| json!({"b64_json": BASE64.encode(bytes.as_ref())}))
            .collect();
        json!({"created": 1, "data": data})
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(policy.delay_before_retry(1), Duration::from_millis(500));
        assert_eq!(policy.delay_before_retry(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_before_retry(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_before_retry(4), Duration::from_secs(3));
        assert_eq!(policy.delay_before_retry(40), Duration::from_secs(3));
    }

    #[test]
    fn config_trims_trailing_slash_and_redacts_key() {
        let config = RemoteConfig::new(" https://example.test/v1/ ", "sk-secret");
        assert_eq!(
            config.endpoint(RemoteOperation::Edit),
            "https://example.test/v1/images/edits"
        );
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-secret"));
        assert_eq!(RemoteConfig::new("", "k").api_base, super::DEFAULT_API_BASE);
    }

    #[test]
    fn parse_response_handles_both_encodings() {
        let body = json!({"data": [
            {"b64_json": BASE64.encode(b"inline")},
            {"url": "https://cdn.example/x.png"},
        ]});
        let payloads = parse_images_response("generation", body.to_string().as_bytes()).unwrap();
        assert_eq!(
            payloads,
            vec![
                ImagePayload::Inline(b"inline".to_vec()),
                ImagePayload::Remote("https://cdn.example/x.png".to_string()),
            ]
        );

        let empty = parse_images_response("generation", br#"{"data": []}"#);
        assert!(matches!(empty, Err(RemoteError::InvalidResponse { .. })));
        let neither = parse_images_response("generation", br#"{"data": [{}]}"#);
        assert!(matches!(neither, Err(RemoteError::InvalidResponse { .. })));
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() -> anyhow::Result<()> {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/images/generations",
                post(|State(hits): State<Arc<AtomicUsize>>| async move {
                    let seen = hits.fetch_add(1, Ordering::SeqCst);
                    if seen < 3 {
                        return (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded")
                            .into_response();
                    }
                    Json(b64_body(&["fourth-time-lucky"])).into_response()
                }),
            )
            .with_state(hits.clone());
        let (listener, base) = bind().await?;
        serve(listener, router);

        let images = client(&base, 4)
            .invoke(&generation(1), &RemoteInputs::default())
            .await?;
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].bytes, b"fourth-time-lucky".to_vec());
        assert_eq!(hits.load(Ordering::SeqCst), 4);
        Ok(())
    }

    #[tokio::test]
    async fn server_errors_surface_after_attempts_are_exhausted() -> anyhow::Result<()> {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/images/generations",
                post(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    StatusCode::BAD_GATEWAY
                }),
            )
            .with_state(hits.clone());
        let (listener, base) = bind().await?;
        serve(listener, router);

        let err = client(&base, 3)
            .invoke(&generation(1), &RemoteInputs::default())
            .await
            .unwrap_err();
        match err {
            RemoteError::Server {
                status, attempts, ..
            } => {
                assert_eq!(status, 502);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn bad_request_is_not_retried() -> anyhow::Result<()> {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/images/generations",
                post(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    (
                        StatusCode::BAD_REQUEST,
                        Json(json!({
                            "error": {"message": "Invalid size", "type": "invalid_request_error"}
                        })),
                    )
                }),
            )
            .with_state(hits.clone());
        let (listener, base) = bind().await?;
        serve(listener, router);

        let err = client(&base, 4)
            .invoke(&generation(1), &RemoteInputs::default())
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert_eq!(err.status(), Some(400));
        match err {
            RemoteError::Rejected { kind, message, .. } => {
                assert_eq!(kind, RejectionKind::BadRequest);
                assert_eq!(message, "Invalid size");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn rate_limit_and_auth_failures_are_distinguished() -> anyhow::Result<()> {
        let router = Router::new()
            .route(
                "/images/generations",
                post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
            )
            .route(
                "/images/variations",
                post(|| async { StatusCode::UNAUTHORIZED }),
            );
        let (listener, base) = bind().await?;
        serve(listener, router);
        let client = client(&base, 4);

        let limited = client
            .invoke(&generation(1), &RemoteInputs::default())
            .await
            .unwrap_err();
        assert!(matches!(
            limited,
            RemoteError::Rejected {
                kind: RejectionKind::RateLimited,
                status: 429,
                ..
            }
        ));

        let mut variation = generation(1);
        variation.operation = RemoteOperation::Variation;
        variation.prompt = None;
        let inputs = RemoteInputs {
            image: Some(InputImage {
                bytes: vec![1, 2, 3],
                mime_type: "image/png".to_string(),
                file_name: "image.png".to_string(),
            }),
            mask: None,
        };
        let unauthorized = client.invoke(&variation, &inputs).await.unwrap_err();
        match unauthorized {
            RemoteError::Rejected { kind, message, .. } => {
                assert_eq!(kind, RejectionKind::Unauthorized);
                assert!(message.contains("PARALONCLOUD_API_KEY"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn url_results_are_downloaded_with_the_same_retry_policy() -> anyhow::Result<()> {
        let (listener, base) = bind().await?;
        let downloads = Arc::new(AtomicUsize::new(0));
        let file_url = format!("{base}/files/result.png");
        let router = Router::new()
            .route(
                "/images/generations",
                post(move || {
                    let file_url = file_url.clone();
                    async move { Json(json!({"data": [{"url": file_url}]})) }
                }),
            )
            .route(
                "/files/result.png",
                get(|State(downloads): State<Arc<AtomicUsize>>| async move {
                    if downloads.fetch_add(1, Ordering::SeqCst) == 0 {
                        return StatusCode::SERVICE_UNAVAILABLE.into_response();
                    }
                    ([(header::CONTENT_TYPE, "image/png")], b"png-bytes".to_vec()).into_response()
                }),
            )
            .with_state(downloads.clone());
        serve(listener, router);

        let images = client(&base, 3)
            .invoke(&generation(1), &RemoteInputs::default())
            .await?;
        assert_eq!(images[0].bytes, b"png-bytes".to_vec());
        assert_eq!(images[0].mime_type.as_deref(), Some("image/png"));
        assert_eq!(downloads.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn edit_sends_authenticated_multipart_form() -> anyhow::Result<()> {
        let router = Router::new().route(
            "/images/edits",
            post(|headers: HeaderMap, mut multipart: Multipart| async move {
                let auth = headers
                    .get(header::AUTHORIZATION)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let mut fields = Vec::new();
                while let Ok(Some(field)) = multipart.next_field().await {
                    let name = field.name().unwrap_or_default().to_string();
                    let value = field.bytes().await.unwrap_or_default();
                    fields.push(format!("{name}={}", value.len()));
                }
                if auth != "Bearer test-key" {
                    return StatusCode::UNAUTHORIZED.into_response();
                }
                let names = fields.join(",");
                Json(b64_body(&[names])).into_response()
            }),
        );
        let (listener, base) = bind().await?;
        serve(listener, router);

        let params = RemoteParams {
            operation: RemoteOperation::Edit,
            model: "dall-e-2".to_string(),
            size: "512x512".to_string(),
            quality: None,
            n: 1,
            prompt: Some("add a hat".to_string()),
        };
        let image = InputImage {
            bytes: vec![7; 10],
            mime_type: "image/png".to_string(),
            file_name: "base.png".to_string(),
        };
        let inputs = RemoteInputs {
            image: Some(image.clone()),
            mask: Some(InputImage {
                bytes: vec![0; 4],
                ..image
            }),
        };
        let images = client(&base, 1).invoke(&params, &inputs).await?;
        let echoed = String::from_utf8(images[0].bytes.clone())?;
        for expected in ["model=8", "size=7", "n=1", "image=10", "prompt=9", "mask=4"] {
            assert!(echoed.contains(expected), "{expected} missing from {echoed}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn slow_responses_surface_as_timeout() -> anyhow::Result<()> {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/images/generations",
                post(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Json(b64_body(&["late"]))
                }),
            )
            .with_state(hits.clone());
        let (listener, base) = bind().await?;
        serve(listener, router);

        let mut client = client(&base, 2);
        let mut config = client.config().clone();
        config.request_timeout = Duration::from_millis(50);
        client = RemoteClient::new(config);

        let err = client
            .invoke(&generation(1), &RemoteInputs::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Timeout { attempts: 2, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[tokio::test]
    async fn stalled_body_is_retried_and_reported_as_timeout() -> anyhow::Result<()> {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .route(
                "/images/generations",
                post(|State(hits): State<Arc<AtomicUsize>>| async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let head = stream::once(async { Ok::<_, Infallible>("{\"data\":") });
                    let tail = stream::once(async {
                        tokio::time::sleep(Duration::from_millis(600)).await;
                        Ok::<_, Infallible>("[]}")
                    });
                    (
                        [(header::CONTENT_TYPE, "application/json")],
                        Body::from_stream(head.chain(tail)),
                    )
                }),
            )
            .with_state(hits.clone());
        let (listener, base) = bind().await?;
        serve(listener, router);

        let mut config = client(&base, 3).config().clone();
        config.request_timeout = Duration::from_millis(150);
        let err = RemoteClient::new(config)
            .invoke(&generation(1), &RemoteInputs::default())
            .await
            .unwrap_err();
        assert!(
            matches!(err, RemoteError::Timeout { attempts: 3, .. }),
            "unexpected error: {err:?}"
        );
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        Ok(())
    }

    #[tokio::test]
    async fn refused_connections_are_retried_then_reported() -> anyhow::Result<()> {
        let (listener, base) = bind().await?;
        drop(listener);

        let err = client(&base, 2)
            .invoke(&generation(1), &RemoteInputs::default())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, RemoteError::Transport { attempts: 2, .. }));
        Ok(())
    }

    #[tokio::test]
    async fn multiple_inline_results_are_all_returned() -> anyhow::Result<()> {
        let router = Router::new().route(
            "/images/generations",
            post(|| async { Json(b64_body(&["one", "two", "three"])) }),
        );
        let (listener, base) = bind().await?;
        serve(listener, router);

        let images = client(&base, 1)
            .invoke(&generation(3), &RemoteInputs::default())
            .await?;
        let bodies: Vec<_> = images.iter().map(|image| image.bytes.clone()).collect();
        assert_eq!(bodies, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
        Ok(())
    }
}
