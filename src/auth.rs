/// Authentication utilities for secure API key validation and bearer-token sessions
use async_trait::async_trait;
use axum::http::{HeaderMap, header};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{debug, info};

/// User id that static API keys authenticate as.
pub const SERVICE_USER: &str = "service";

/// A wrapper around String that uses constant-time equality comparison
/// to prevent timing attacks on API key validation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConstantTimeString(String);

impl From<String> for ConstantTimeString {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConstantTimeString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl PartialEq for ConstantTimeString {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes().ct_eq(other.0.as_bytes()).into()
    }
}

impl Eq for ConstantTimeString {}

impl Hash for ConstantTimeString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

/// Type alias for a HashSet of (best effort) constant-time strings, used for API keys
pub type KeySet = HashSet<ConstantTimeString>;

/// Validates a bearer token against a set of valid keys using constant-time comparison
pub fn validate_bearer_token(keys: &KeySet, token: &str) -> bool {
    keys.contains(&ConstantTimeString::from(token))
}

/// Pull the token out of an `Authorization: Bearer <token>` header.
///
/// `Ok(None)` means no header was sent; a header in any other shape is an error.
pub fn bearer_token(headers: &HeaderMap) -> Result<Option<&str>, AuthError> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value.to_str().map_err(|_| AuthError::MalformedHeader)?;
    match value.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => Ok(Some(token.trim())),
        _ => Err(AuthError::MalformedHeader),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("authentication required")]
    MissingToken,
    #[error("authorization header must be 'Bearer <token>'")]
    MalformedHeader,
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
}

/// A token handed out by [`Authenticator::issue_token`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuedToken {
    pub token: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

/// The credential service.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<User, AuthError>;
    async fn issue_token(&self, user_id: &str) -> Result<IssuedToken, AuthError>;
}

#[derive(Debug, Clone)]
struct Session {
    user_id: String,
    expires_at: DateTime<Utc>,
}

/// Accepts statically configured API keys plus tokens it issued itself.
#[derive(Debug, Clone)]
pub struct TokenAuthenticator {
    keys: Arc<KeySet>,
    sessions: Arc<DashMap<ConstantTimeString, Session>>,
    ttl: Duration,
}

impl TokenAuthenticator {
    pub fn new(keys: KeySet, ttl: Duration) -> Self {
        Self {
            keys: Arc::new(keys),
            sessions: Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn from_keys<I, S>(keys: I, ttl: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys = keys
            .into_iter()
            .map(|k| ConstantTimeString::from(k.into()))
            .collect();
        Self::new(keys, ttl)
    }

    /// Drop expired sessions.
    pub fn purge_expired(&self) {
        let now = Utc::now();
        self.sessions.retain(|_, session| session.expires_at > now);
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, token: &str) -> Result<User, AuthError> {
        if validate_bearer_token(&self.keys, token) {
            return Ok(User {
                id: SERVICE_USER.to_string(),
            });
        }

        let key = ConstantTimeString::from(token);
        let Some(session) = self.sessions.get(&key).map(|s| s.value().clone()) else {
            debug!("Rejected unknown bearer token");
            return Err(AuthError::InvalidToken);
        };
        if session.expires_at <= Utc::now() {
            self.sessions.remove(&key);
            debug!(user_id = %session.user_id, "Rejected expired bearer token");
            return Err(AuthError::Expired);
        }
        Ok(User {
            id: session.user_id,
        })
    }

    async fn issue_token(&self, user_id: &str) -> Result<IssuedToken, AuthError> {
        let token = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        );
        let expires_at = Utc::now() + self.ttl;
        self.sessions.insert(
            ConstantTimeString::from(token.as_str()),
            Session {
                user_id: user_id.to_string(),
                expires_at,
            },
        );
        info!(user_id = %user_id, expires_at = %expires_at, "Issued token");
        Ok(IssuedToken {
            token,
            user_id: user_id.to_string(),
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn authenticator() -> TokenAuthenticator {
        TokenAuthenticator::from_keys(["sk-static"], Duration::hours(24))
    }

    #[test]
    fn test_constant_time_string_equality() {
        let a = ConstantTimeString::from("secret");
        assert_eq!(a, ConstantTimeString::from("secret".to_string()));
        assert_ne!(a, ConstantTimeString::from("secreT"));
        assert_ne!(a, ConstantTimeString::from("secret2"));
    }

    #[test]
    fn test_bearer_token_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), Ok(None));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Ok(Some("abc")));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), Err(AuthError::MalformedHeader));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), Err(AuthError::MalformedHeader));
    }

    #[tokio::test]
    async fn test_static_key_authenticates_as_service() {
        let user = authenticator().authenticate("sk-static").await.unwrap();
        assert_eq!(user.id, SERVICE_USER);
    }

    #[tokio::test]
    async fn test_issued_token_round_trip() {
        let auth = authenticator();
        let issued = auth.issue_token("alice").await.unwrap();
        assert!(issued.expires_at > Utc::now());

        let user = auth.authenticate(&issued.token).await.unwrap();
        assert_eq!(user.id, "alice");
        assert_eq!(
            auth.authenticate("not-a-token").await,
            Err(AuthError::InvalidToken)
        );
    }

    #[tokio::test]
    async fn test_expired_token_is_rejected_and_forgotten() {
        let auth = TokenAuthenticator::from_keys(Vec::<String>::new(), Duration::seconds(-1));
        let issued = auth.issue_token("bob").await.unwrap();

        assert_eq!(auth.authenticate(&issued.token).await, Err(AuthError::Expired));
        assert_eq!(
            auth.authenticate(&issued.token).await,
            Err(AuthError::InvalidToken)
        );
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let auth = TokenAuthenticator::from_keys(Vec::<String>::new(), Duration::seconds(-1));
        auth.issue_token("bob").await.unwrap();
        auth.purge_expired();
        assert!(auth.sessions.is_empty());
    }
}
