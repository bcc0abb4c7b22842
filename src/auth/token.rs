use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::{AuthError, AuthKind, AuthStrategy, Credential, fetch_xsrf_token, login_failure};
use crate::http::{ContentType, HttpClient};

#[derive(Debug, Deserialize)]
struct LoginReply {
    #[serde(rename = "AccessToken")]
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Claims {
    exp: i64,
}

/// Read the `exp` claim of a JWT without verifying its signature.
///
/// Any decode error means no expiry, which callers treat as invalid.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let mut validation = Validation::new(Algorithm::HS256);
    #[allow(deprecated)]
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let decoding_key = DecodingKey::from_secret(b"");
    match decode::<Claims>(token, &decoding_key, &validation) {
        Ok(data) => DateTime::from_timestamp(data.claims.exp, 0),
        Err(e) => {
            debug!(error = %e, "Access token does not decode");
            None
        }
    }
}

/// Bearer-token login against the v1 auth endpoint.
pub struct TokenAuth {
    http: Arc<HttpClient>,
    base_url: Url,
    token: RwLock<Option<String>>,
}

impl TokenAuth {
    pub fn new(http: Arc<HttpClient>, base_url: Url) -> Self {
        Self {
            http,
            base_url,
            token: RwLock::new(None),
        }
    }

    fn current_token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }
}

#[async_trait]
impl AuthStrategy for TokenAuth {
    fn kind(&self) -> AuthKind {
        AuthKind::Token
    }

    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        let Some(token) = self.current_token() else {
            return false;
        };
        match token_expiry(&token) {
            Some(expires_at) => {
                debug!(%expires_at, "Checked access token");
                expires_at > now
            }
            None => {
                warn!("Stored access token is malformed");
                false
            }
        }
    }

    async fn authenticate(&self, secret: &str) -> Result<Credential, AuthError> {
        let login_url = self
            .base_url
            .join("api/v1/auth/login")
            .map_err(|e| AuthError::Protocol(format!("invalid login URL: {e}")))?;
        info!(url = %self.base_url, "Logging in with access token flow");

        let response = self
            .http
            .request(
                Method::POST,
                login_url,
                &HeaderMap::new(),
                Some(&json!({"Password": secret})),
                ContentType::Json,
            )
            .await?;

        if response.status != StatusCode::OK || response.landed_on_login_page() {
            let error = login_failure(&response);
            warn!(status = response.status.as_u16(), error = %error, "Login failed");
            return Err(error);
        }

        let token = response
            .body
            .into_json()
            .and_then(|value| serde_json::from_value::<LoginReply>(value).ok())
            .and_then(|reply| reply.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| AuthError::Protocol("login response lacks AccessToken".to_string()))?;

        let expires_at = token_expiry(&token);
        info!(expires_at = ?expires_at, "Login succeeded");
        self.store_token(Some(token.clone()));

        Ok(Credential::Bearer { token, expires_at })
    }

    fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(token) = self.current_token() {
            match HeaderValue::from_str(&format!("Bearer {token}")) {
                Ok(value) => {
                    headers.insert(AUTHORIZATION, value);
                }
                Err(_) => warn!("Access token is not a valid header value"),
            }
        }
        headers
    }

    async fn prepare(&self) -> Result<(), AuthError> {
        Ok(())
    }

    async fn refresh_csrf(&self) -> Result<(), AuthError> {
        match fetch_xsrf_token(&self.http, &self.base_url).await {
            Err(AuthError::Protocol(reason)) => {
                debug!(%reason, "No XSRF token issued in token mode");
                Ok(())
            }
            other => other,
        }
    }

    fn invalidate(&self) {
        self.store_token(None);
    }
}
