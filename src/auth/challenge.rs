use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::{AuthError, AuthKind, AuthStrategy, Credential, ensure_xsrf_token, fetch_xsrf_token, login_failure};
use crate::http::{ContentType, HttpClient};

pub const SESSION_COOKIE: &str = "session-auth";
pub const NONCE_COOKIE: &str = "session-nonce";

#[derive(Debug, Deserialize)]
struct NonceReply {
    #[serde(rename = "Nonce")]
    nonce: String,
    #[serde(rename = "Salt")]
    salt: String,
}

/// Derive the login password from the secret and the server challenge:
/// `base64(sha256(nonce ‖ sha256(secret ‖ salt)))`.
pub fn derive_password(secret: &str, nonce: &[u8], salt: &[u8]) -> String {
    let salted = Sha256::new()
        .chain_update(secret.as_bytes())
        .chain_update(salt)
        .finalize();
    let nonced = Sha256::new()
        .chain_update(nonce)
        .chain_update(salted)
        .finalize();
    BASE64.encode(nonced)
}

/// Nonce/salt challenge login. The whole session lives in the cookie jar.
pub struct ChallengeAuth {
    http: Arc<HttpClient>,
    base_url: Url,
}

impl ChallengeAuth {
    pub fn new(http: Arc<HttpClient>, base_url: Url) -> Self {
        Self { http, base_url }
    }

    fn login_url(&self) -> Result<Url, AuthError> {
        self.base_url
            .join("login.cgi")
            .map_err(|e| AuthError::Protocol(format!("invalid login URL: {e}")))
    }

    async fn request_challenge(&self, login_url: &Url) -> Result<(Vec<u8>, Vec<u8>), AuthError> {
        let response = self
            .http
            .request(
                Method::POST,
                login_url.clone(),
                &HeaderMap::new(),
                Some(&json!({"get-nonce": 1})),
                ContentType::Form,
            )
            .await?;

        if response.status != StatusCode::OK || response.landed_on_login_page() {
            return Err(login_failure(&response));
        }

        let reply: NonceReply = response
            .body
            .into_json()
            .and_then(|value| serde_json::from_value(value).ok())
            .ok_or_else(|| AuthError::Protocol("nonce response lacks Nonce and Salt".to_string()))?;

        let nonce = BASE64
            .decode(reply.nonce.trim())
            .map_err(|e| AuthError::Protocol(format!("nonce is not base64: {e}")))?;
        let salt = BASE64
            .decode(reply.salt.trim())
            .map_err(|e| AuthError::Protocol(format!("salt is not base64: {e}")))?;

        Ok((nonce, salt))
    }
}

#[async_trait]
impl AuthStrategy for ChallengeAuth {
    fn kind(&self) -> AuthKind {
        AuthKind::Challenge
    }

    fn is_valid(&self, now: DateTime<Utc>) -> bool {
        let valid = self.http.cookie_valid(SESSION_COOKIE, now);
        debug!(valid, "Checked session cookie");
        valid
    }

    async fn authenticate(&self, secret: &str) -> Result<Credential, AuthError> {
        let login_url = self.login_url()?;
        info!(url = %self.base_url, "Logging in with challenge-response");

        ensure_xsrf_token(&self.http, &self.base_url).await?;
        let (nonce, salt) = self.request_challenge(&login_url).await?;
        let password = derive_password(secret, &nonce, &salt);

        let response = self
            .http
            .request(
                Method::POST,
                login_url,
                &HeaderMap::new(),
                Some(&json!({"password": password})),
                ContentType::Form,
            )
            .await?;

        if response.status != StatusCode::OK || response.landed_on_login_page() {
            let error = login_failure(&response);
            warn!(status = response.status.as_u16(), error = %error, "Login failed");
            return Err(error);
        }

        match self.http.cookie(SESSION_COOKIE) {
            Some(cookie) if !cookie.value.is_empty() => {
                info!(expires_at = ?cookie.expires_at, "Login succeeded");
                Ok(Credential::Session(cookie))
            }
            _ => Err(AuthError::Protocol(
                "login succeeded but no session cookie was issued".to_string(),
            )),
        }
    }

    fn auth_headers(&self) -> HeaderMap {
        HeaderMap::new()
    }

    async fn prepare(&self) -> Result<(), AuthError> {
        ensure_xsrf_token(&self.http, &self.base_url).await
    }

    async fn refresh_csrf(&self) -> Result<(), AuthError> {
        fetch_xsrf_token(&self.http, &self.base_url).await
    }

    fn invalidate(&self) {
        self.http.remove_cookie(SESSION_COOKIE);
        self.http.remove_cookie(NONCE_COOKIE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_known_password() {
        let nonce = BASE64.decode("Zml4ZWQtbm9uY2UtMDAwMQ==").unwrap();
        let salt = BASE64.decode("Zml4ZWQtc2FsdC0wMDAx").unwrap();

        assert_eq!(
            derive_password("pw", &nonce, &salt),
            "epktGpyEgQbi/hx0dYenaVC9xhkCo+lTdI79M/b2NQI="
        );
    }

    #[test]
    fn salted_hash_matches_hex_roundtrip() {
        let salted = Sha256::new()
            .chain_update(b"pw")
            .chain_update(b"fixed-salt-0001")
            .finalize();
        let hex: String = salted.iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(
            hex,
            "66f99681aaaa5ab534a656e103f93f3be46c1d0c293203d209bf659d73d5dc7b"
        );
    }

    #[test]
    fn different_nonce_changes_password() {
        let a = derive_password("pw", b"nonce-a", b"salt");
        let b = derive_password("pw", b"nonce-b", b"salt");
        assert_ne!(a, b);
    }
}
