use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

/// Opaque HTTP response as seen by the dispatcher: status code plus raw
/// body bytes. Kept minimal so a fake transport in tests doesn't need to
/// fabricate a real `reqwest::Response`.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success_2xx(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_client_or_server_error(&self) -> bool {
        self.status >= 400
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Timeout,
    Transport(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "request timed out"),
            TransportError::Transport(msg) => write!(f, "transport error: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// The HTTP-style collaborator the dispatcher posts envelopes to. Out of
/// scope per spec.md §1 (code runner / prompt runner / webhook are opaque
/// endpoints); abstracted behind a trait so tests never make a real
/// network call, matching this codebase's adapter-trait convention.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post_json(
        &self,
        url: &str,
        body: serde_json::Value,
        deadline: Duration,
    ) -> Result<HttpResponse, TransportError>;
}

/// Production transport backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post_json(
        &self,
        url: &str,
        body: serde_json::Value,
        deadline: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let resp = self
            .client
            .post(url)
            .timeout(deadline)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Transport(e.to_string())
                }
            })?;

        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .await
            .map_err(|e| TransportError::Transport(e.to_string()))?
            .to_vec();

        Ok(HttpResponse { status, body })
    }
}
