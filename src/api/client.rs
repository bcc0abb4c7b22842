use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use regex::Regex;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::models::{JobDefinition, JobProgress, StartResponse, SystemInfo};
use super::{ApiError, BackupApi, RemoteError, Reply};
use crate::auth::{AuthError, AuthStrategy, create_strategy};
use crate::config::ServerConfig;
use crate::http::{Body, ContentType, HttpClient, HttpOptions, HttpResponse};

static JOB_ID_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+$").expect("job id pattern is valid"));

/// Reject anything but a decimal job id before it reaches a URL.
pub fn validate_job_id(job_id: &str) -> Result<(), ApiError> {
    if JOB_ID_RE.is_match(job_id) {
        Ok(())
    } else {
        Err(ApiError::Validation(format!(
            "the provided backup id '{job_id}' has an invalid format"
        )))
    }
}

/// API client for one backend. Cheap to share behind an `Arc`.
pub struct ApiClient {
    host: String,
    base_url: Url,
    http: Arc<HttpClient>,
    auth: Arc<dyn AuthStrategy>,
    secret: Option<String>,
}

impl ApiClient {
    pub fn new(
        base_url: Url,
        http: Arc<HttpClient>,
        auth: Arc<dyn AuthStrategy>,
        secret: Option<String>,
    ) -> Self {
        let host = host_key(&base_url);
        Self {
            host,
            base_url,
            http,
            auth,
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    /// Build the transport, strategy and client for a configured server.
    pub fn from_config(server: &ServerConfig) -> Result<Self, ApiError> {
        let base_url = normalize_base_url(&server.url)?;
        let http = Arc::new(HttpClient::new(&HttpOptions {
            verify_ssl: server.verify_ssl,
            timeout: Duration::from_secs(server.timeout_secs),
            max_redirects: server.max_redirects,
        })?);
        let auth = create_strategy(server.auth, Arc::clone(&http), base_url.clone());

        Ok(Self::new(base_url, http, auth, server.password.clone()))
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn auth(&self) -> &Arc<dyn AuthStrategy> {
        &self.auth
    }

    async fn ensure_session(&self) -> Result<(), ApiError> {
        if let Some(secret) = &self.secret {
            if !self.auth.is_valid(Utc::now()) {
                info!(host = %self.host, "Session missing or expired, logging in");
                self.auth.authenticate(secret).await?;
            }
        }
        self.auth.prepare().await?;
        Ok(())
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ApiError::Validation(format!("invalid endpoint {path}: {e}")))
    }

    /// Authenticated call with a single retry on a missing XSRF token.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<HttpResponse, ApiError> {
        self.ensure_session().await?;
        let url = self.endpoint(path)?;
        let mut retried = false;

        loop {
            let response = self
                .http
                .request(
                    method.clone(),
                    url.clone(),
                    &self.auth.auth_headers(),
                    body,
                    ContentType::Json,
                )
                .await?;

            if response.status == StatusCode::UNAUTHORIZED || response.landed_on_login_page() {
                warn!(host = %self.host, %url, status = response.status.as_u16(), "Server refused the session");
                self.auth.invalidate();
                return Err(AuthError::InvalidSecret("the server rejected the session".to_string()).into());
            }

            if response.signals_missing_xsrf() {
                if retried {
                    return Err(ApiError::MissingCsrf);
                }
                warn!(host = %self.host, %url, "Missing XSRF token, refreshing and retrying");
                self.auth.refresh_csrf().await?;
                retried = true;
                continue;
            }

            debug!(
                host = %self.host,
                %method,
                %url,
                status = response.status.as_u16(),
                elapsed_ms = response.elapsed.as_millis() as u64,
                "API call completed"
            );
            return Ok(response);
        }
    }

    async fn call_typed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Reply<T>, ApiError> {
        let response = self.call(method, path, body).await?;
        decode(response)
    }
}

/// Turn a response into either typed data or the server's error report.
fn decode<T: DeserializeOwned>(response: HttpResponse) -> Result<Reply<T>, ApiError> {
    if let Some(error) = remote_error(&response) {
        debug!(status = response.status.as_u16(), error = %error, "Server returned an error payload");
        return Ok(Reply::Error(error));
    }

    let status = response.status;
    let value = match response.body {
        Body::Json(value) => unwrap_envelope(value),
        Body::Empty => Value::Null,
        other => {
            return Err(ApiError::Processing(format!(
                "expected JSON from the server (HTTP {}), got {other:?}",
                status.as_u16()
            )));
        }
    };

    serde_json::from_value(value)
        .map(Reply::Data)
        .map_err(|e| ApiError::Processing(e.to_string()))
}

fn remote_error(response: &HttpResponse) -> Option<RemoteError> {
    if let Some(Value::Object(map)) = response.body.as_json() {
        if let Some(error) = map.get("Error") {
            let message = match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let code = map
                .get("Code")
                .and_then(Value::as_u64)
                .and_then(|c| u16::try_from(c).ok())
                .or_else(|| (!response.status.is_success()).then(|| response.status.as_u16()));
            return Some(RemoteError { message, code });
        }
    }

    if response.status.is_success() {
        return None;
    }

    let message = match &response.body {
        Body::Text(text) if !text.trim().is_empty() => text.trim().to_string(),
        Body::Json(value) => value.to_string(),
        _ => match response.reason() {
            "" => "request failed".to_string(),
            reason => reason.to_string(),
        },
    };
    Some(RemoteError {
        message,
        code: Some(response.status.as_u16()),
    })
}

/// Some server versions wrap payloads as `{"success": .., "data": ..}`.
fn unwrap_envelope(value: Value) -> Value {
    match value {
        Value::Object(mut map)
            if map.contains_key("data") && map.keys().all(|k| k == "data" || k == "success") =>
        {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    }
}

pub fn normalize_base_url(raw: &str) -> Result<Url, ApiError> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| ApiError::Validation(format!("invalid server URL '{raw}': {e}")))?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// `host:port` of a server URL.
pub fn host_key(url: &Url) -> String {
    let host = url.host_str().unwrap_or("unknown");
    match url.port_or_known_default() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    }
}

#[async_trait]
impl BackupApi for ApiClient {
    fn host(&self) -> &str {
        &self.host
    }

    async fn get_job(&self, job_id: &str) -> Result<Reply<JobDefinition>, ApiError> {
        validate_job_id(job_id)?;
        self.call_typed(Method::GET, &format!("api/v1/backup/{job_id}"), None)
            .await
    }

    async fn list_jobs(&self) -> Result<Reply<Vec<JobDefinition>>, ApiError> {
        self.call_typed(Method::GET, "api/v1/backups", None).await
    }

    async fn start_job(&self, job_id: &str) -> Result<Reply<StartResponse>, ApiError> {
        validate_job_id(job_id)?;

        match self.get_progress().await? {
            Reply::Data(progress) if progress.phase.is_running() => {
                warn!(
                    host = %self.host,
                    job_id = %job_id,
                    running_job = %progress.job_id,
                    phase = %progress.phase,
                    "Refusing to start while a backup is running"
                );
                return Err(ApiError::AlreadyRunning {
                    job_id: progress.job_id,
                });
            }
            Reply::Data(progress) => debug!(phase = %progress.phase, "No backup running"),
            Reply::Error(error) => debug!(%error, "No backup running"),
        }

        info!(host = %self.host, job_id = %job_id, "Requesting backup run");
        self.call_typed(Method::POST, &format!("api/v1/backup/{job_id}/run"), None)
            .await
    }

    async fn update_job(&self, job_id: &str, patch: &Value) -> Result<Reply<Value>, ApiError> {
        validate_job_id(job_id)?;
        match patch.as_object() {
            Some(fields) if !fields.is_empty() => {}
            _ => {
                return Err(ApiError::Validation(
                    "update payload must be a non-empty JSON object".to_string(),
                ));
            }
        }
        self.call_typed(Method::PUT, &format!("api/v1/backup/{job_id}"), Some(patch))
            .await
    }

    async fn delete_job(&self, job_id: &str) -> Result<Reply<Value>, ApiError> {
        validate_job_id(job_id)?;
        self.call_typed(Method::DELETE, &format!("api/v1/backup/{job_id}"), None)
            .await
    }

    async fn get_progress(&self) -> Result<Reply<JobProgress>, ApiError> {
        self.call_typed(Method::GET, "api/v1/progressstate", None)
            .await
    }

    async fn get_system_info(&self) -> Result<Reply<SystemInfo>, ApiError> {
        self.call_typed(Method::GET, "api/v1/systeminfo", None)
            .await
    }
}
