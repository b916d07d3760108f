//! Error taxonomy and its mapping onto HTTP responses
use crate::auth::AuthError;
use crate::gateway::GatewayError;
use crate::render::RenderError;
use crate::store::StoreError;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::time::Duration;
use tracing::error;

/// Failures of one relayed exchange.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("gateway unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("gateway did not answer within {0:?}")]
    UpstreamTimeout(Duration),
    #[error("gateway returned {status}: {body}")]
    UpstreamStatus { status: StatusCode, body: String },
    #[error("unexpected gateway response: {0}")]
    UpstreamProtocol(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Persistence(#[from] StoreError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// An error as the client sees it: `{"error": {"type": ..., "message": ...}}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    pub status: StatusCode,
    pub error_type: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error_type: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error_type,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request_error", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found_error", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "authentication_error", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "permission_error", message)
    }

    pub fn bad_gateway(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, "upstream_error", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "type": self.error_type,
                "message": self.message
            }
        });

        (self.status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => ApiError::not_found(e.to_string()),
            StoreError::Backend(_) => {
                error!(error = %e, "Storage failure");
                ApiError::internal("storage failure")
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        ApiError::unauthorized(e.to_string())
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::UpstreamUnavailable(_) | RelayError::UpstreamProtocol(_) => {
                ApiError::bad_gateway(e.to_string())
            }
            RelayError::UpstreamTimeout(_) => {
                ApiError::new(StatusCode::REQUEST_TIMEOUT, "timeout_error", e.to_string())
            }
            RelayError::UpstreamStatus { status, ref body } => {
                let message = if body.is_empty() {
                    e.to_string()
                } else {
                    body.clone()
                };
                ApiError::new(status, "upstream_error", message)
            }
            RelayError::Persistence(store) => store.into(),
            RelayError::Auth(auth) => auth.into(),
            RelayError::Gateway(_) | RelayError::Render(_) => {
                error!(error = %e, "Relay failure");
                ApiError::internal(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let response = ApiError::bad_request("no user message").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(body["error"]["message"], "no user message");
    }

    #[test]
    fn test_upstream_status_is_passed_through() {
        let api: ApiError = RelayError::UpstreamStatus {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: "slow down".into(),
        }
        .into();
        assert_eq!(api.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(api.message, "slow down");
    }

    #[test]
    fn test_timeout_and_transport_statuses() {
        let api: ApiError = RelayError::UpstreamTimeout(Duration::from_secs(60)).into();
        assert_eq!(api.status, StatusCode::REQUEST_TIMEOUT);
        let api: ApiError = RelayError::UpstreamUnavailable("refused".into()).into();
        assert_eq!(api.status, StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_store_errors() {
        let api: ApiError = StoreError::NotFound {
            kind: "conversation",
            id: "c1".into(),
        }
        .into();
        assert_eq!(api.status, StatusCode::NOT_FOUND);
        let api: ApiError = StoreError::Backend("disk full".into()).into();
        assert_eq!(api.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api.message, "storage failure");
    }
}
