//! Dialogue Forge - a chat backend that relays conversations to an LLM workflow gateway
//!
//! This library provides the streaming relay between clients and the gateway, conversation
//! persistence, document generation for answers, and the HTTP API around them.

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use bon::Builder;
use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod auth;
pub mod client;
pub mod errors;
pub mod gateway;
pub mod handlers;
pub mod models;
pub mod relay;
pub mod render;
pub mod sse;
pub mod store;

use auth::Authenticator;
use client::{HttpClient, HyperClient, PoolConfig};
use gateway::GatewayConfig;
use relay::RelayContext;
use render::{FILES_ROUTE, FileRenderer, Renderer};
use store::{ChatStore, InMemoryStore};

/// Multipart framing on top of the largest accepted upload.
const UPLOAD_BODY_OVERHEAD: usize = 1024 * 1024;

/// Settings of the HTTP service itself, as opposed to the gateway.
#[derive(Debug, Clone, Builder)]
pub struct ServiceSettings {
    /// Model catalogue served by `/api/models`.
    #[builder(default = vec![models::DEFAULT_MODEL.to_string(), "deepseek-coder".to_string()])]
    pub models: Vec<String>,
    /// Directory generated documents are written to and served from.
    #[builder(default = PathBuf::from("generated"), into)]
    pub generated_dir: PathBuf,
    #[builder(default = PathBuf::from("uploads"), into)]
    pub upload_dir: PathBuf,
    #[builder(default = 50 * 1024 * 1024)]
    pub max_upload_bytes: usize,
    /// Reject requests without a bearer token.
    #[builder(default)]
    pub require_auth: bool,
}

/// The main application state shared by every handler
#[derive(Clone)]
pub struct AppState<T: HttpClient> {
    pub http_client: T,
    pub gateway: Arc<GatewayConfig>,
    pub store: Arc<dyn ChatStore>,
    pub renderer: Arc<dyn Renderer>,
    pub auth: Arc<dyn Authenticator>,
    pub settings: Arc<ServiceSettings>,
}

impl<T: HttpClient> std::fmt::Debug for AppState<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("http_client", &self.http_client)
            .field("gateway", &self.gateway)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl AppState<HyperClient> {
    /// Create a new AppState with the pooled Hyper client
    pub fn new(
        gateway: GatewayConfig,
        settings: ServiceSettings,
        auth: Arc<dyn Authenticator>,
        pool: PoolConfig,
    ) -> Self {
        let http_client = client::create_hyper_client(pool);
        Self::with_client(gateway, settings, auth, http_client)
    }
}

impl<T: HttpClient> AppState<T> {
    /// Create a new AppState with a custom HTTP client (useful for testing).
    ///
    /// Conversations are kept in memory and documents are written to the generated-files
    /// directory; either can be swapped with [`AppState::with_store`] and
    /// [`AppState::with_renderer`].
    pub fn with_client(
        gateway: GatewayConfig,
        settings: ServiceSettings,
        auth: Arc<dyn Authenticator>,
        http_client: T,
    ) -> Self {
        Self {
            http_client,
            gateway: Arc::new(gateway),
            store: Arc::new(InMemoryStore::new()),
            renderer: Arc::new(FileRenderer::new(settings.generated_dir.clone())),
            auth,
            settings: Arc::new(settings),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ChatStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn Renderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn relay_context(&self) -> RelayContext<T>
    where
        T: Clone,
    {
        RelayContext {
            client: self.http_client.clone(),
            gateway: self.gateway.clone(),
            store: self.store.clone(),
            renderer: self.renderer.clone(),
        }
    }
}

/// Build the main router for the service
/// This creates routes for:
/// - `/health` and `/api/models` - liveness and the model catalogue
/// - `/api/chat` - the streaming and blocking chat relay, plus task cancellation
/// - `/api/conversations` - conversation history
/// - `/api/files`, `/api/upload` - generated documents and uploads
/// - `/api/messages/{id}/copy` - copy bookkeeping
/// - `/api/auth/token` - session tokens for users, issued by service keys
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone + Send + Sync + 'static>(state: AppState<T>) -> Router {
    info!("Building router");
    let upload_limit = state.settings.max_upload_bytes + UPLOAD_BODY_OVERHEAD;
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/models", get(handlers::models))
        .route("/api/stats", get(handlers::stats))
        .route("/api/chat", post(handlers::chat))
        .route("/api/chat/stop/{task_id}", post(handlers::stop_chat))
        .route("/api/conversations", get(handlers::list_conversations))
        .route(
            "/api/conversations/{id}",
            get(handlers::get_conversation)
                .put(handlers::update_conversation)
                .delete(handlers::delete_conversation),
        )
        .route(
            &format!("{FILES_ROUTE}/{{filename}}"),
            get(handlers::download_file),
        )
        .route(
            "/api/upload",
            post(handlers::upload_file).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route(
            "/api/messages/{id}/copy",
            get(handlers::copy_stat).post(handlers::record_copy),
        )
        .route("/api/auth/token", post(handlers::issue_token))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// # Parameters
/// - `prefix`: A string prefix for the metrics, which can be either a string literal or an owned string.
///   The `'static` lifetime is required by the Prometheus metrics layer.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::MatchedPath)
        .with_default_metrics()
        .build_pair()
}

/// Test doubles shared by unit and integration tests.
#[doc(hidden)]
pub mod test_utils {
    use super::*;
    use async_trait::async_trait;
    use axum::body::{Body, Bytes};
    use axum::http::{StatusCode, header};
    use axum::response::{IntoResponse, Response};
    use futures_util::stream::{self, BoxStream, StreamExt};
    use std::sync::Mutex;

    /// How a canned SSE body ends after its chunks.
    #[derive(Debug, Clone)]
    pub enum StreamEnd {
        /// The body finishes normally.
        Close,
        /// The connection breaks with this message.
        Error(String),
        /// The body never finishes.
        Hang,
    }

    #[derive(Debug, Clone)]
    pub enum MockReply {
        Body {
            status: StatusCode,
            body: String,
        },
        Stream {
            status: StatusCode,
            chunks: Vec<String>,
            end: StreamEnd,
        },
        /// The request never reaches a server.
        Fail(String),
    }

    impl MockReply {
        pub fn body(status: StatusCode, body: &str) -> Self {
            MockReply::Body {
                status,
                body: body.to_string(),
            }
        }

        pub fn stream(status: StatusCode, chunks: Vec<String>) -> Self {
            MockReply::Stream {
                status,
                chunks,
                end: StreamEnd::Close,
            }
        }

        fn respond(&self) -> Result<Response, Box<dyn std::error::Error + Send + Sync>> {
            match self {
                MockReply::Body { status, body } => Ok((*status, body.clone()).into_response()),
                MockReply::Stream {
                    status,
                    chunks,
                    end,
                } => {
                    let chunks = stream::iter(
                        chunks
                            .clone()
                            .into_iter()
                            .map(|chunk| Ok::<_, std::io::Error>(Bytes::from(chunk))),
                    );
                    let body: BoxStream<'static, Result<Bytes, std::io::Error>> = match end {
                        StreamEnd::Close => chunks.boxed(),
                        StreamEnd::Error(message) => {
                            let message = message.clone();
                            chunks
                                .chain(stream::once(async move {
                                    Err(std::io::Error::new(
                                        std::io::ErrorKind::ConnectionReset,
                                        message,
                                    ))
                                }))
                                .boxed()
                        }
                        StreamEnd::Hang => chunks.chain(stream::pending()).boxed(),
                    };
                    Ok((
                        *status,
                        [
                            (header::CONTENT_TYPE, "text/event-stream"),
                            (header::CACHE_CONTROL, "no-cache"),
                        ],
                        Body::from_stream(body),
                    )
                        .into_response())
                }
                MockReply::Fail(message) => Err(message.clone().into()),
            }
        }
    }

    #[derive(Clone)]
    pub struct MockHttpClient {
        pub requests: Arc<Mutex<Vec<MockRequest>>>,
        default: MockReply,
        /// Replies for requests whose path ends with the given suffix, first match wins.
        routes: Vec<(String, MockReply)>,
    }

    #[derive(Debug, Clone)]
    pub struct MockRequest {
        pub method: String,
        pub uri: String,
        pub headers: Vec<(String, String)>,
        pub body: Vec<u8>,
    }

    impl MockHttpClient {
        pub fn new(status: StatusCode, body: &str) -> Self {
            Self::replying(MockReply::body(status, body))
        }

        pub fn new_streaming(status: StatusCode, chunks: Vec<String>) -> Self {
            Self::replying(MockReply::stream(status, chunks))
        }

        pub fn streaming_with_end(status: StatusCode, chunks: Vec<String>, end: StreamEnd) -> Self {
            Self::replying(MockReply::Stream {
                status,
                chunks,
                end,
            })
        }

        /// A client whose every request fails before reaching a server.
        pub fn failing(message: &str) -> Self {
            Self::replying(MockReply::Fail(message.to_string()))
        }

        pub fn replying(default: MockReply) -> Self {
            Self {
                requests: Arc::new(Mutex::new(Vec::new())),
                default,
                routes: Vec::new(),
            }
        }

        pub fn with_route(mut self, path_suffix: &str, reply: MockReply) -> Self {
            self.routes.push((path_suffix.to_string(), reply));
            self
        }

        pub fn get_requests(&self) -> Vec<MockRequest> {
            self.requests
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone()
        }

        fn reply_for(&self, path: &str) -> &MockReply {
            self.routes
                .iter()
                .find(|(suffix, _)| path.ends_with(suffix.as_str()))
                .map(|(_, reply)| reply)
                .unwrap_or(&self.default)
        }
    }

    impl std::fmt::Debug for MockHttpClient {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockHttpClient")
                .field("requests", &self.requests)
                .field("default", &self.default)
                .field("routes", &self.routes.len())
                .finish()
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn request(
            &self,
            req: axum::extract::Request,
        ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
            let method = req.method().to_string();
            let uri = req.uri().to_string();
            let path = req.uri().path().to_string();
            let headers = req
                .headers()
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();

            let body = axum::body::to_bytes(req.into_body(), usize::MAX)
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?
                .to_vec();

            self.requests
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(MockRequest {
                    method,
                    uri,
                    headers,
                    body,
                });

            self.reply_for(&path).respond()
        }
    }

    /// A gateway config pointing at a fake host.
    pub fn gateway_config() -> GatewayConfig {
        GatewayConfig::builder()
            .base_url(
                "https://gateway.test/v1"
                    .parse()
                    .unwrap_or_else(|e| panic!("static url: {e}")),
            )
            .api_key("app-test-key".to_string())
            .build()
    }
}
