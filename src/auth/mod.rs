//! Authentication strategies for the vendor web API.
//!
//! Two login schemes exist in the wild: the classic challenge-response login
//! that ends in a `session-auth` cookie, and the newer token login that hands
//! out a JWT used as a bearer token. Both are hidden behind [`AuthStrategy`].

mod challenge;
mod token;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::http::{ContentType, HttpClient, HttpResponse, StoredCredential, TransportError, XSRF_COOKIE};

pub use challenge::{ChallengeAuth, NONCE_COOKIE, SESSION_COOKIE, derive_password};
pub use token::{TokenAuth, token_expiry};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid credentials: {0}")]
    InvalidSecret(String),

    #[error("server unreachable: {0}")]
    Unreachable(#[from] TransportError),

    #[error("server error during login (HTTP {status})")]
    ServerError { status: u16 },

    #[error("unexpected login response: {0}")]
    Protocol(String),
}

/// Which login scheme a server speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    #[default]
    Challenge,
    Token,
}

/// What a successful login produced.
#[derive(Debug, Clone)]
pub enum Credential {
    Session(StoredCredential),
    Bearer {
        token: String,
        expires_at: Option<DateTime<Utc>>,
    },
}

#[async_trait]
pub trait AuthStrategy: Send + Sync {
    fn kind(&self) -> AuthKind;

    /// Whether the stored session can be used at `now`. Never does I/O.
    fn is_valid(&self, now: DateTime<Utc>) -> bool;

    /// Run the full login protocol and store the resulting session.
    async fn authenticate(&self, secret: &str) -> Result<Credential, AuthError>;

    /// Headers to attach to every API request.
    fn auth_headers(&self) -> HeaderMap;

    /// Make sure the anti-forgery cookie is present before an API call.
    async fn prepare(&self) -> Result<(), AuthError>;

    /// Fetch a fresh anti-forgery cookie after the server rejected ours.
    async fn refresh_csrf(&self) -> Result<(), AuthError>;

    /// Forget the session after the server refused it.
    fn invalidate(&self);
}

/// Build the strategy for a server.
pub fn create_strategy(kind: AuthKind, http: Arc<HttpClient>, base_url: Url) -> Arc<dyn AuthStrategy> {
    match kind {
        AuthKind::Challenge => Arc::new(ChallengeAuth::new(http, base_url)),
        AuthKind::Token => Arc::new(TokenAuth::new(http, base_url)),
    }
}

/// GET the server root, which answers with an `xsrf-token` cookie.
pub(crate) async fn fetch_xsrf_token(http: &HttpClient, base_url: &Url) -> Result<(), AuthError> {
    debug!(url = %base_url, "Fetching XSRF token");
    let response = http
        .request(Method::GET, base_url.clone(), &HeaderMap::new(), None, ContentType::Html)
        .await?;

    if http.cookie_present(XSRF_COOKIE, Utc::now()) {
        Ok(())
    } else {
        Err(AuthError::Protocol(format!(
            "server did not issue an XSRF token (HTTP {})",
            response.status.as_u16()
        )))
    }
}

pub(crate) async fn ensure_xsrf_token(http: &HttpClient, base_url: &Url) -> Result<(), AuthError> {
    if http.cookie_present(XSRF_COOKIE, Utc::now()) {
        return Ok(());
    }
    fetch_xsrf_token(http, base_url).await
}

/// Classify a failed login response.
pub(crate) fn login_failure(response: &HttpResponse) -> AuthError {
    if response.landed_on_login_page() {
        return AuthError::InvalidSecret("redirected to the login page".to_string());
    }
    match response.status {
        StatusCode::UNAUTHORIZED => AuthError::InvalidSecret("incorrect password provided".to_string()),
        status if status.is_server_error() => AuthError::ServerError {
            status: status.as_u16(),
        },
        status => AuthError::InvalidSecret(format!("login rejected with HTTP {}", status.as_u16())),
    }
}
