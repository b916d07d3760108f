//! The upstream LLM workflow gateway
//!
//! Holds the gateway settings that used to be process-wide globals, builds the requests the
//! relay sends, and implements best-effort task cancellation across the different stop
//! endpoint shapes gateways expose.

use crate::client::HttpClient;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use bon::Builder;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

/// Stop endpoint shapes, tried in this order. `{task_id}` is substituted.
pub const STOP_ENDPOINT_TEMPLATES: &[&str] = &[
    "chat-messages/{task_id}/stop",
    "workflows/{task_id}/stop",
    "workflows/tasks/{task_id}/stop",
    "tasks/{task_id}/stop",
];

/// Which gateway API blocking requests go to. Streaming always uses the chat API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Channel {
    #[default]
    Workflow,
    Chat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    Streaming,
    Blocking,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid gateway url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("failed to build gateway request: {0}")]
    Request(#[from] axum::http::Error),
    #[error("failed to encode gateway payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Builder)]
pub struct GatewayConfig {
    /// Base URL of the gateway API, e.g. `https://gateway.example.com/v1`.
    pub base_url: Url,
    pub api_key: String,
    #[builder(default)]
    pub channel: Channel,
    /// User identifier reported to the gateway.
    #[builder(default = "dialogue-forge".to_string(), into)]
    pub user: String,
    /// Wall-clock bound on one upstream call, including the whole streamed body.
    #[builder(default = Duration::from_secs(60))]
    pub timeout: Duration,
    #[builder(default = Duration::from_secs(30))]
    pub stop_timeout: Duration,
}

/// Body of a chat request to the gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayPayload {
    pub inputs: GatewayInputs,
    pub query: String,
    pub response_mode: ResponseMode,
    pub conversation_id: String,
    pub user: String,
}

/// Workflow inputs; both keys carry the query so either workflow shape picks it up.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayInputs {
    pub query: String,
    pub text: String,
}

impl GatewayConfig {
    /// Join a path onto the base URL, keeping the base's own path segments.
    pub fn endpoint(&self, path: &str) -> Result<Url, url::ParseError> {
        let base = self.base_url.as_str().trim_end_matches('/');
        Url::parse(&format!("{base}/{}", path.trim_start_matches('/')))
    }

    pub fn streaming_url(&self) -> Result<Url, url::ParseError> {
        self.endpoint("chat-messages")
    }

    pub fn blocking_url(&self) -> Result<Url, url::ParseError> {
        match self.channel {
            Channel::Workflow => self.endpoint("workflows/run"),
            Channel::Chat => self.endpoint("chat-messages"),
        }
    }

    pub fn payload(
        &self,
        query: &str,
        upstream_conversation_id: Option<&str>,
        mode: ResponseMode,
    ) -> GatewayPayload {
        GatewayPayload {
            inputs: GatewayInputs {
                query: query.to_string(),
                text: query.to_string(),
            },
            query: query.to_string(),
            response_mode: mode,
            conversation_id: upstream_conversation_id.unwrap_or_default().to_string(),
            user: self.user.clone(),
        }
    }

    /// Build the POST request for a chat in the given mode.
    pub fn chat_request(&self, payload: &GatewayPayload) -> Result<Request<Body>, GatewayError> {
        let (url, accept) = match payload.response_mode {
            ResponseMode::Streaming => (self.streaming_url()?, "text/event-stream"),
            ResponseMode::Blocking => (self.blocking_url()?, "application/json"),
        };
        let body = serde_json::to_vec(payload)?;
        let request = self
            .authorized(Request::builder().method("POST").uri(url.as_str()), &url)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, accept)
            .body(Body::from(body))?;
        Ok(request)
    }

    fn authorized(&self, builder: axum::http::request::Builder, url: &Url) -> axum::http::request::Builder {
        let mut builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", self.api_key));
        if let Some(host) = url.host_str() {
            let host = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            builder = builder.header(header::HOST, host);
        }
        builder
    }

    /// Every stop URL to try for a task, in order: each template, then its trailing-slash
    /// variant for gateways that redirect to it.
    pub fn stop_candidates(&self, task_id: &str) -> Result<Vec<Url>, url::ParseError> {
        let mut candidates = Vec::with_capacity(STOP_ENDPOINT_TEMPLATES.len() * 2);
        for template in STOP_ENDPOINT_TEMPLATES {
            let url = self.endpoint(&template.replace("{task_id}", task_id))?;
            let with_slash = Url::parse(&format!("{}/", url.as_str()))?;
            candidates.push(url);
            candidates.push(with_slash);
        }
        Ok(candidates)
    }
}

/// Result of a stop attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    /// An endpoint accepted the stop request.
    Stopped { url: Url, result: String },
    /// No endpoint accepted it. Carries the last status and body seen, if any endpoint answered.
    Failed {
        last_status: Option<StatusCode>,
        last_body: Option<String>,
    },
}

/// Task ids are opaque but end up in a URL path, so only plain id characters are accepted.
pub fn is_valid_task_id(task_id: &str) -> bool {
    !task_id.is_empty()
        && task_id.len() <= 128
        && task_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Ask the gateway to stop a running task, trying each candidate endpoint in order and
/// stopping at the first one that answers 200 or 204.
pub async fn stop_task<T: HttpClient + ?Sized>(
    client: &T,
    gateway: &GatewayConfig,
    task_id: &str,
) -> Result<StopOutcome, GatewayError> {
    let body = serde_json::to_vec(&serde_json::json!({ "user": gateway.user }))?;
    let mut last_status = None;
    let mut last_body = None;

    for url in gateway.stop_candidates(task_id)? {
        debug!(url = %url, "Trying stop endpoint");
        let request = gateway
            .authorized(Request::builder().method("POST").uri(url.as_str()), &url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.clone()))?;

        let response = match tokio::time::timeout(gateway.stop_timeout, client.request(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(url = %url, error = %e, "Stop endpoint unreachable");
                continue;
            }
            Err(_) => {
                warn!(url = %url, "Stop endpoint timed out");
                continue;
            }
        };

        let status = response.status();
        let text = match tokio::time::timeout(
            gateway.stop_timeout,
            axum::body::to_bytes(response.into_body(), 64 * 1024),
        )
        .await
        {
            Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
            _ => String::new(),
        };

        if status == StatusCode::OK || status == StatusCode::NO_CONTENT {
            let result = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("result").and_then(Value::as_str).map(str::to_owned))
                .unwrap_or_else(|| "success".to_string());
            info!(task_id = %task_id, url = %url, "Gateway task stopped");
            return Ok(StopOutcome::Stopped { url, result });
        }

        debug!(url = %url, status = %status, "Stop endpoint refused");
        last_status = Some(status);
        last_body = Some(text);
    }

    warn!(task_id = %task_id, last_status = ?last_status, "No stop endpoint accepted the request");
    Ok(StopOutcome::Failed {
        last_status,
        last_body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockHttpClient, MockReply};

    fn gateway(base: &str) -> GatewayConfig {
        GatewayConfig::builder()
            .base_url(base.parse().unwrap())
            .api_key("app-secret".to_string())
            .build()
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let gw = gateway("https://gw.example.com/v1");
        assert_eq!(
            gw.streaming_url().unwrap().as_str(),
            "https://gw.example.com/v1/chat-messages"
        );
        let gw = gateway("https://gw.example.com/v1/");
        assert_eq!(
            gw.blocking_url().unwrap().as_str(),
            "https://gw.example.com/v1/workflows/run"
        );
    }

    #[test]
    fn test_blocking_url_follows_channel() {
        let mut gw = gateway("https://gw.example.com/v1");
        gw.channel = Channel::Chat;
        assert_eq!(
            gw.blocking_url().unwrap().as_str(),
            "https://gw.example.com/v1/chat-messages"
        );
    }

    #[test]
    fn test_payload_shape() {
        let gw = gateway("https://gw.example.com/v1");
        let payload = gw.payload("hi", None, ResponseMode::Streaming);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["inputs"]["query"], "hi");
        assert_eq!(value["inputs"]["text"], "hi");
        assert_eq!(value["query"], "hi");
        assert_eq!(value["response_mode"], "streaming");
        assert_eq!(value["conversation_id"], "");
        assert_eq!(value["user"], "dialogue-forge");
    }

    #[test]
    fn test_chat_request_headers() {
        let gw = gateway("https://gw.example.com:8443/v1");
        let payload = gw.payload("hi", Some("up1"), ResponseMode::Streaming);
        let request = gw.chat_request(&payload).unwrap();
        assert_eq!(request.uri(), "https://gw.example.com:8443/v1/chat-messages");
        assert_eq!(request.headers()[header::AUTHORIZATION], "Bearer app-secret");
        assert_eq!(request.headers()[header::ACCEPT], "text/event-stream");
        assert_eq!(request.headers()[header::HOST], "gw.example.com:8443");
    }

    #[test]
    fn test_stop_candidates_order() {
        let gw = gateway("https://gw.example.com/v1");
        let candidates: Vec<String> = gw
            .stop_candidates("t1")
            .unwrap()
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(
            candidates,
            vec![
                "https://gw.example.com/v1/chat-messages/t1/stop",
                "https://gw.example.com/v1/chat-messages/t1/stop/",
                "https://gw.example.com/v1/workflows/t1/stop",
                "https://gw.example.com/v1/workflows/t1/stop/",
                "https://gw.example.com/v1/workflows/tasks/t1/stop",
                "https://gw.example.com/v1/workflows/tasks/t1/stop/",
                "https://gw.example.com/v1/tasks/t1/stop",
                "https://gw.example.com/v1/tasks/t1/stop/",
            ]
        );
    }

    #[test]
    fn test_task_id_validation() {
        assert!(is_valid_task_id("3f2c-aa_01"));
        assert!(!is_valid_task_id(""));
        assert!(!is_valid_task_id("../admin"));
        assert!(!is_valid_task_id("a/b"));
    }

    #[tokio::test]
    async fn test_stop_short_circuits_on_first_success() {
        let gw = gateway("https://gw.example.com/v1");
        let client = MockHttpClient::new(StatusCode::NOT_FOUND, "{}").with_route(
            "/workflows/t1/stop",
            MockReply::body(StatusCode::OK, r#"{"result":"success"}"#),
        );

        let outcome = stop_task(&client, &gw, "t1").await.unwrap();
        match outcome {
            StopOutcome::Stopped { url, result } => {
                assert_eq!(url.as_str(), "https://gw.example.com/v1/workflows/t1/stop");
                assert_eq!(result, "success");
            }
            other => panic!("expected a stop, got {other:?}"),
        }

        // chat-messages twice, then the first workflows candidate
        let requests = client.get_requests();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|r| r.method == "POST"));
        assert!(
            requests[0]
                .headers
                .iter()
                .any(|(k, v)| k == "authorization" && v == "Bearer app-secret")
        );
    }

    #[tokio::test]
    async fn test_stop_accepts_no_content() {
        let gw = gateway("https://gw.example.com/v1");
        let client = MockHttpClient::new(StatusCode::NO_CONTENT, "");
        let outcome = stop_task(&client, &gw, "t1").await.unwrap();
        assert!(matches!(outcome, StopOutcome::Stopped { ref result, .. } if result == "success"));
        assert_eq!(client.get_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_reports_last_failure() {
        let gw = gateway("https://gw.example.com/v1");
        let client = MockHttpClient::new(StatusCode::BAD_REQUEST, "task not running");
        let outcome = stop_task(&client, &gw, "t1").await.unwrap();
        assert_eq!(
            outcome,
            StopOutcome::Failed {
                last_status: Some(StatusCode::BAD_REQUEST),
                last_body: Some("task not running".into()),
            }
        );
        assert_eq!(client.get_requests().len(), 8);
    }

    #[tokio::test]
    async fn test_stop_with_unreachable_gateway() {
        let gw = gateway("https://gw.example.com/v1");
        let client = MockHttpClient::failing("connection refused");
        let outcome = stop_task(&client, &gw, "t1").await.unwrap();
        assert_eq!(
            outcome,
            StopOutcome::Failed {
                last_status: None,
                last_body: None,
            }
        );
    }
}
