//! Outbound webhook transport
//!
//! `WebhookTransport` is the seam between the worker pool and the network.
//! `HttpTransport` is the reqwest-backed implementation; tests can plug in
//! scripted transports without a server.

use super::signing;
use super::DeliveryOutcome;
use crate::consumer::{ConsumerConfig, DeliveryTarget};
use crate::error::{DispatchError, Result};
use crate::types::Event;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::{Duration, Instant};

pub const HEADER_EVENT_ID: &str = "X-Dispatch-Event-Id";
pub const HEADER_EVENT_TYPE: &str = "X-Dispatch-Event-Type";
pub const HEADER_ATTEMPT: &str = "X-Dispatch-Attempt";
pub const HEADER_SIGNATURE: &str = "X-Dispatch-Signature";

/// Response bodies beyond this are truncated in attempt records
const MAX_DETAIL_BYTES: usize = 1024;

/// A fully prepared webhook POST
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    pub timeout: Duration,
}

impl WebhookRequest {
    /// Build the request for one attempt of `event` to a webhook consumer
    ///
    /// Custom consumer headers are applied first so they can't override
    /// the managed ones.
    pub fn build(
        event: &Event,
        consumer: &ConsumerConfig,
        attempt: u32,
        default_timeout: Duration,
    ) -> Result<Self> {
        let DeliveryTarget::Webhook {
            url,
            headers: custom,
            secret,
            timeout_ms,
        } = &consumer.target
        else {
            return Err(DispatchError::Configuration {
                consumer_id: consumer.id.clone(),
                reason: "consumer is not a webhook".to_string(),
            });
        };

        let body = Bytes::from(serde_json::to_vec(&event.envelope())?);

        let mut headers: Vec<(String, String)> = custom
            .iter()
            .filter(|(name, _)| !is_managed_header(name))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.sort();
        headers.push(("content-type".to_string(), "application/json".to_string()));
        headers.push((HEADER_EVENT_ID.to_string(), event.id.clone()));
        headers.push((HEADER_EVENT_TYPE.to_string(), event.event_type.clone()));
        headers.push((HEADER_ATTEMPT.to_string(), attempt.to_string()));
        if let Some(secret) = secret.as_deref().filter(|s| !s.is_empty()) {
            headers.push((HEADER_SIGNATURE.to_string(), signing::sign(secret, &body)));
        }

        Ok(Self {
            url: url.clone(),
            headers,
            body,
            timeout: timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(default_timeout),
        })
    }

    /// Look up a header value by case-insensitive name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// What came back from the endpoint
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status_code: u16,
    pub body: String,
}

/// Failure to get any HTTP response
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    /// The request itself is unsendable (bad header, bad url); resending
    /// the same request fails the same way
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("request failed: {0}")]
    Other(String),
}

/// Sends prepared webhook requests
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn send(
        &self,
        request: WebhookRequest,
    ) -> std::result::Result<WebhookResponse, TransportError>;
}

/// reqwest-backed transport with a pooled client
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DispatchError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn send(
        &self,
        request: WebhookRequest,
    ) -> std::result::Result<WebhookResponse, TransportError> {
        let mut builder = self
            .client
            .post(&request.url)
            .timeout(request.timeout)
            .body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(request.timeout)
            } else if e.is_builder() {
                TransportError::InvalidRequest(e.to_string())
            } else if e.is_connect() {
                TransportError::Connect(e.to_string())
            } else {
                TransportError::Other(e.to_string())
            }
        })?;

        let status_code = response.status().as_u16();
        let body = read_detail(response).await;
        Ok(WebhookResponse { status_code, body })
    }
}

/// Send one attempt and classify the result
///
/// The transport call is additionally bounded by the request timeout so a
/// misbehaving transport can't stall a worker.
pub(crate) async fn send_attempt(
    transport: &dyn WebhookTransport,
    request: WebhookRequest,
) -> (DeliveryOutcome, Duration) {
    let started = Instant::now();
    let timeout = request.timeout;
    let result = match tokio::time::timeout(timeout, transport.send(request)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(timeout)),
    };
    (classify(result), started.elapsed())
}

/// Map an HTTP result to a delivery outcome
///
/// 2xx is success; 4xx and unsendable requests are permanent; everything
/// else (5xx, other codes, timeouts, network errors) is transient.
pub fn classify(result: std::result::Result<WebhookResponse, TransportError>) -> DeliveryOutcome {
    match result {
        Ok(response) => {
            let status_code = Some(response.status_code);
            let detail = format!("HTTP {}: {}", response.status_code, response.body);
            match response.status_code {
                200..=299 => DeliveryOutcome::Delivered {
                    status_code,
                    detail,
                },
                400..=499 => DeliveryOutcome::Permanent {
                    status_code,
                    detail,
                },
                _ => DeliveryOutcome::Transient {
                    status_code,
                    detail,
                    timed_out: false,
                },
            }
        }
        Err(e @ TransportError::InvalidRequest(_)) => DeliveryOutcome::Permanent {
            status_code: None,
            detail: e.to_string(),
        },
        Err(e) => DeliveryOutcome::Transient {
            status_code: None,
            timed_out: matches!(e, TransportError::Timeout(_)),
            detail: e.to_string(),
        },
    }
}

/// Read just enough of the body for the attempt record
///
/// Stops one byte past the limit so truncation is still detected; the
/// rest of a large body is never buffered.
async fn read_detail(mut response: reqwest::Response) -> String {
    let limit = MAX_DETAIL_BYTES + 1;
    let mut buf: Vec<u8> = Vec::new();
    while buf.len() < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(limit - buf.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            Ok(None) => break,
            Err(e) => return format!("[failed to read response body: {}]", e),
        }
    }
    truncate_detail(&buf)
}

fn truncate_detail(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_DETAIL_BYTES {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    format!(
        "{}... (truncated)",
        String::from_utf8_lossy(&bytes[..MAX_DETAIL_BYTES])
    )
}

fn is_managed_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    matches!(
        lower.as_str(),
        "content-type" | "content-length" | "host" | "user-agent" | "transfer-encoding"
    ) || [HEADER_EVENT_ID, HEADER_EVENT_TYPE, HEADER_ATTEMPT, HEADER_SIGNATURE]
        .iter()
        .any(|h| h.eq_ignore_ascii_case(&lower))
}
