//! qntx-dispatch
//!
//! Four action kinds over a uniform HTTP contract (§4.C6, §6). Input is
//! `(watcher, attestation_snapshot)`; success returns opaque bytes, failure
//! returns a classified [`DispatchError`].

mod transport;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use qntx_model::{ActionData, Attestation, CompositionEdge, Watcher};
use tokio_util::sync::CancellationToken;

pub use transport::{HttpResponse, HttpTransport, ReqwestTransport, TransportError};

pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(30);

/// HTTP non-success or transport error during dispatch (§7 ActionFailure),
/// or cooperative shutdown observed mid-dispatch (§7 Shutdown).
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    NonSuccess { status: u16, body: String },
    Transport(String),
    Shutdown,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::NonSuccess { status, body } => {
                write!(f, "action dispatch failed with status {status}: {body}")
            }
            DispatchError::Transport(msg) => write!(f, "action dispatch transport error: {msg}"),
            DispatchError::Shutdown => write!(f, "action dispatch aborted by shutdown"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Sink for the `execution_started` / `execution_success` / `execution_error`
/// events a composition-edge dispatch additionally emits (§4.C6). Kept as a
/// trait rather than a direct dependency on the Broadcast Fabric crate so
/// the dependency stays one-way (§9 "Cyclic reference risk"): qntx-engine
/// wires its broadcast handle in as the observer, qntx-dispatch never
/// depends on qntx-broadcast.
pub trait DispatchObserver: Send + Sync {
    fn execution_started(&self, watcher_id: &str, composition: &CompositionEdge);
    fn execution_success(&self, watcher_id: &str, composition: &CompositionEdge, body: &[u8]);
    fn execution_error(&self, watcher_id: &str, composition: &CompositionEdge, error: &str);
}

/// Endpoint configuration. The code-runner path is retained for
/// compatibility with an existing transport (§6): it is a generic code
/// runner, not Python-specific.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub code_runner_base_url: String,
    pub prompt_runner_base_url: String,
    pub deadline: Duration,
}

impl DispatchConfig {
    pub fn new(code_runner_base_url: impl Into<String>, prompt_runner_base_url: impl Into<String>) -> Self {
        Self {
            code_runner_base_url: code_runner_base_url.into(),
            prompt_runner_base_url: prompt_runner_base_url.into(),
            deadline: DEFAULT_DEADLINE,
        }
    }
}

pub struct Dispatcher<T: HttpTransport> {
    transport: T,
    config: DispatchConfig,
    observer: Option<Arc<dyn DispatchObserver>>,
}

impl<T: HttpTransport> Dispatcher<T> {
    pub fn new(transport: T, config: DispatchConfig) -> Self {
        Self {
            transport,
            config,
            observer: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn DispatchObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Invoke `watcher`'s action against `attestation`, honoring
    /// `cancel` cooperatively (§5 "Cancellation and shutdown"): the HTTP
    /// call races the cancellation signal and yields `Shutdown` if the
    /// engine context closes first.
    pub async fn dispatch(
        &self,
        watcher: &Watcher,
        attestation: &Attestation,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Shutdown);
        }

        let composition = watcher.action_data.composition_edge().cloned();
        if let (Some(composition), Some(observer)) = (&composition, &self.observer) {
            observer.execution_started(&watcher.id, composition);
        }

        let result = self.dispatch_inner(watcher, attestation, cancel).await;

        if let (Some(composition), Some(observer)) = (&composition, &self.observer) {
            match &result {
                Ok(body) => observer.execution_success(&watcher.id, composition, body),
                Err(error) => observer.execution_error(&watcher.id, composition, &error.to_string()),
            }
        }

        result
    }

    async fn dispatch_inner(
        &self,
        watcher: &Watcher,
        attestation: &Attestation,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, DispatchError> {
        let (url, body) = match &watcher.action_data {
            ActionData::SemanticOnly => return Ok(Vec::new()),
            ActionData::Code { content, glyph_id, .. } => {
                let url = format!(
                    "{}/api/python/execute",
                    self.config.code_runner_base_url.trim_end_matches('/')
                );
                let body = serde_json::json!({
                    "content": content,
                    "glyph_id": glyph_id,
                    "upstream_attestation": attestation,
                });
                (url, body)
            }
            ActionData::Prompt { template, glyph_id } => {
                let url = format!(
                    "{}/api/prompt/direct",
                    self.config.prompt_runner_base_url.trim_end_matches('/')
                );
                let body = serde_json::json!({
                    "template": template,
                    "glyph_id": glyph_id,
                    "upstream_attestation": attestation,
                });
                (url, body)
            }
            ActionData::Webhook { url } => {
                let body = serde_json::json!({
                    "watcher_id": watcher.id,
                    "attestation": attestation,
                    "fired_at": Utc::now(),
                });
                (url.clone(), body)
            }
        };

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DispatchError::Shutdown),
            result = self.transport.post_json(&url, body, self.config.deadline) => result,
        };

        let response = response.map_err(|e| match e {
            TransportError::Timeout => DispatchError::Transport("request timed out".to_string()),
            TransportError::Transport(msg) => DispatchError::Transport(msg),
        })?;

        classify(watcher, response)
    }
}

/// Success rule differs subtly by action kind: code/prompt require a 2xx
/// status; webhook only fails at >= 400 (§4.C6, §6).
fn classify(watcher: &Watcher, response: HttpResponse) -> Result<Vec<u8>, DispatchError> {
    let success = match watcher.action_data {
        ActionData::Webhook { .. } => !response.is_client_or_server_error(),
        _ => response.is_success_2xx(),
    };

    if success {
        Ok(response.body)
    } else {
        Err(DispatchError::NonSuccess {
            status: response.status,
            body: String::from_utf8_lossy(&response.body).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use qntx_model::{ActionData, Filter, WatcherCounters};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    struct ScriptedTransport {
        calls: Mutex<Vec<(String, serde_json::Value)>>,
        responses: Mutex<Vec<Result<HttpResponse, TransportError>>>,
    }

    impl ScriptedTransport {
        fn new(responses: Vec<Result<HttpResponse, TransportError>>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl HttpTransport for ScriptedTransport {
        async fn post_json(
            &self,
            url: &str,
            body: serde_json::Value,
            _deadline: Duration,
        ) -> Result<HttpResponse, TransportError> {
            self.calls.lock().unwrap().push((url.to_string(), body));
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn webhook_watcher(url: &str) -> Watcher {
        Watcher {
            id: "w1".into(),
            enabled: true,
            raw_query: None,
            filter: Some(Filter::wildcard()),
            semantic_query: None,
            semantic_threshold: 0.0,
            action_data: ActionData::Webhook { url: url.to_string() },
            max_fires_per_minute: 6,
            counters: WatcherCounters::default(),
        }
    }

    fn attestation() -> Attestation {
        Attestation::new(
            "a1",
            Utc::now(),
            "test",
            vec!["alice".into()],
            vec!["is".into()],
            vec![],
            vec![],
            BTreeMap::new(),
        )
    }

    #[tokio::test]
    async fn scenario_s1_webhook_success_posts_expected_envelope() {
        let transport = ScriptedTransport::new(vec![Ok(HttpResponse {
            status: 200,
            body: b"ok".to_vec(),
        })]);
        let dispatcher = Dispatcher::new(
            transport,
            DispatchConfig::new("http://code", "http://prompt"),
        );
        let watcher = webhook_watcher("http://sink/x");
        let cancel = CancellationToken::new();

        let result = dispatcher.dispatch(&watcher, &attestation(), &cancel).await;
        assert_eq!(result, Ok(b"ok".to_vec()));

        let calls = dispatcher.transport.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "http://sink/x");
        assert_eq!(calls[0].1["watcher_id"], "w1");
    }

    #[tokio::test]
    async fn webhook_failure_status_is_classified_as_non_success() {
        let transport = ScriptedTransport::new(vec![Ok(HttpResponse {
            status: 500,
            body: b"boom".to_vec(),
        })]);
        let dispatcher = Dispatcher::new(
            transport,
            DispatchConfig::new("http://code", "http://prompt"),
        );
        let watcher = webhook_watcher("http://sink/x");
        let cancel = CancellationToken::new();

        let result = dispatcher.dispatch(&watcher, &attestation(), &cancel).await;
        assert_eq!(
            result,
            Err(DispatchError::NonSuccess {
                status: 500,
                body: "boom".to_string()
            })
        );
    }

    #[tokio::test]
    async fn semantic_only_never_calls_transport() {
        let transport = ScriptedTransport::new(vec![]);
        let dispatcher = Dispatcher::new(
            transport,
            DispatchConfig::new("http://code", "http://prompt"),
        );
        let watcher = Watcher {
            action_data: ActionData::SemanticOnly,
            ..webhook_watcher("http://unused")
        };
        let cancel = CancellationToken::new();
        let result = dispatcher.dispatch(&watcher, &attestation(), &cancel).await;
        assert_eq!(result, Ok(Vec::new()));
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits_to_shutdown() {
        let transport = ScriptedTransport::new(vec![]);
        let dispatcher = Dispatcher::new(
            transport,
            DispatchConfig::new("http://code", "http://prompt"),
        );
        let watcher = webhook_watcher("http://sink/x");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = dispatcher.dispatch(&watcher, &attestation(), &cancel).await;
        assert_eq!(result, Err(DispatchError::Shutdown));
    }
}
