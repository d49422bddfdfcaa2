//! HTTP transport seam for the LLM client
//!
//! The client only ever POSTs JSON and reads a JSON body back; hiding
//! that behind a trait lets the pipeline tests run against scripted
//! responses instead of the network.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use thiserror::Error;

/// Transport-level failure, classified for the retry policy.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("http error {status}: {message}")]
    Http { status: u16, message: String },
}

impl TransportError {
    /// Network failures, 5xx and rate-limits are retryable.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Network(_) => true,
            TransportError::Http { status, .. } => *status == 429 || *status >= 500,
        }
    }
}

/// Minimal JSON-over-HTTP transport.
#[async_trait]
pub trait LlmTransport: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &serde_json::Value,
    ) -> Result<String, TransportError>;
}

/// Real transport backed by reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmTransport for HttpTransport {
    async fn post_json(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: &serde_json::Value,
    ) -> Result<String, TransportError> {
        let mut builder = self.client.post(url).json(body);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: text.chars().take(500).collect(),
            });
        }

        Ok(text)
    }
}

/// Scripted transport for tests: responses are consumed in FIFO order
/// and every call is counted.
pub struct FakeTransport {
    responses: Mutex<VecDeque<Result<String, TransportError>>>,
    calls: Mutex<Vec<String>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful response body.
    pub fn push_ok(&self, body: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(body.to_string()));
    }

    /// Queue an HTTP error.
    pub fn push_status(&self, status: u16, message: &str) {
        self.responses.lock().unwrap().push_back(Err(TransportError::Http {
            status,
            message: message.to_string(),
        }));
    }

    /// Queue a network failure.
    pub fn push_network_error(&self, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(TransportError::Network(message.to_string())));
    }

    /// Number of calls that reached the transport.
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// URLs called, in order.
    pub fn called_urls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LlmTransport for FakeTransport {
    async fn post_json(
        &self,
        url: &str,
        _headers: &[(&str, &str)],
        _body: &serde_json::Value,
    ) -> Result<String, TransportError> {
        self.calls.lock().unwrap().push(url.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Network("no scripted response".to_string())))
    }
}
