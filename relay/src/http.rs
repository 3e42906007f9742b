//! HTTP client abstraction for webhook POSTs.
//!
//! The `HttpClient` trait lets the delivery path run against a scripted mock in tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

/// An outbound webhook request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

/// Response from an HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
        }
    }
}

/// Failures before a response status was received.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timeout")]
    Timeout,
    #[error("Connection error: {0}")]
    Connect(String),
    #[error("Unexpected error: {0}")]
    Other(String),
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

/// Production HTTP client using reqwest.
///
/// Redirects are not followed, a 3xx answer counts as a non-2xx response.
#[derive(Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> crate::error::Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build webhook HTTP client: {e}"))?;
        Ok(Self { client })
    }
}

fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    #[tracing::instrument(skip(self, request), fields(url = %request.url, body_len = request.body.len()))]
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self
            .client
            .post(&request.url)
            .timeout(request.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder.body(request.body).send().await.map_err(classify)?;
        let status = response.status().as_u16();
        // The body is informational only, a failed read doesn't change the outcome
        let body = response.text().await.unwrap_or_default();

        tracing::debug!(status, response_len = body.len(), "Webhook POST completed");
        Ok(HttpResponse { status, body })
    }
}

/// Record of a call made to the mock HTTP client.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

impl MockCall {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

type ScriptedResponse = Result<HttpResponse, TransportError>;

/// Mock HTTP client returning scripted responses per URL, in FIFO order.
///
/// URLs with no scripted response left get an `Other` transport error.
#[derive(Clone, Default)]
pub struct MockHttpClient {
    responses: Arc<Mutex<HashMap<String, Vec<ScriptedResponse>>>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_response(&self, url: &str, response: ScriptedResponse) {
        self.responses
            .lock()
            .entry(url.to_string())
            .or_default()
            .push(response);
    }

    /// Shorthand for scripting a bare status code.
    pub fn respond_with_status(&self, url: &str, status: u16) {
        self.add_response(url, Ok(HttpResponse::status(status)));
    }

    pub fn get_calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.calls.lock().push(MockCall {
            url: request.url.clone(),
            headers: request.headers.clone(),
            body: request.body.clone(),
            timeout: request.timeout,
        });

        let mut responses = self.responses.lock();
        match responses.get_mut(&request.url) {
            Some(queue) if !queue.is_empty() => queue.remove(0),
            _ => Err(TransportError::Other(format!(
                "No mock response configured for {}",
                request.url
            ))),
        }
    }
}
