//! HTTP transport for one backend.
//!
//! Wraps a `reqwest::Client` with redirects disabled so that every hop goes
//! through the cookie jar: cookies set on a redirect response are stored, and
//! the next hop is sent with freshly prepared headers.

pub mod cookies;

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use hyper::ext::ReasonPhrase;
use reqwest::header::{CONTENT_TYPE, COOKIE, HeaderMap, HeaderName, HeaderValue, LOCATION};
use reqwest::{Method, StatusCode, Url};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub use cookies::{CookieStore, StoredCredential};

/// Cookie carrying the anti-forgery token.
pub const XSRF_COOKIE: &str = "xsrf-token";
/// Header the anti-forgery token is echoed in.
pub const XSRF_HEADER: &str = "x-xsrf-token";

const MISSING_XSRF_SIGNAL: &str = "Missing XSRF Token";
const LOG_BODY_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot connect to {url}: {source}")]
    CannotConnect {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("too many redirects (limit {limit}) starting from {url}")]
    TooManyRedirects { url: String, limit: u32 },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid header value for {name}")]
    InvalidHeader { name: String },

    #[error("failed to encode request body: {0}")]
    Body(String),

    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Request/response body encodings understood by the vendor API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    Json,
    Form,
    Text,
    Html,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Form => "application/x-www-form-urlencoded",
            ContentType::Text => "text/plain",
            ContentType::Html => "text/html",
        }
    }

    /// Map a `Content-Type` header value onto a known encoding.
    pub fn detect(header: &str) -> Option<Self> {
        let mime = header.split(';').next()?.trim().to_ascii_lowercase();
        match mime.as_str() {
            "application/json" | "text/json" => Some(ContentType::Json),
            "application/x-www-form-urlencoded" => Some(ContentType::Form),
            "text/html" => Some(ContentType::Html),
            m if m.ends_with("+json") => Some(ContentType::Json),
            m if m.starts_with("text/") => Some(ContentType::Text),
            _ => None,
        }
    }
}

/// Parsed response body.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
    Text(String),
}

impl Body {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_json(self) -> Option<Value> {
        match self {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
    /// Final URL after redirects.
    pub url: Url,
    pub redirects: u32,
    pub elapsed: Duration,
    /// Reason phrase from the status line, when it differs from the standard one.
    pub reason: Option<String>,
}

impl HttpResponse {
    /// Reason phrase as sent by the server, falling back to the standard text.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or_default()
    }

    /// The server bounced the request to its login page.
    pub fn landed_on_login_page(&self) -> bool {
        self.redirects > 0 && self.url.path().to_ascii_lowercase().contains("login")
    }

    /// HTTP 400 carrying the "Missing XSRF Token" reason. The vendor sends it
    /// as a custom reason phrase, which may also surface in the body.
    pub fn signals_missing_xsrf(&self) -> bool {
        if self.status != StatusCode::BAD_REQUEST {
            return false;
        }
        let reason = self.reason();
        let body = match &self.body {
            Body::Text(text) => text.clone(),
            Body::Json(value) => value.to_string(),
            _ => String::new(),
        };
        reason.contains(MISSING_XSRF_SIGNAL) || body.contains(MISSING_XSRF_SIGNAL)
    }
}

#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub verify_ssl: bool,
    pub timeout: Duration,
    pub max_redirects: u32,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            verify_ssl: true,
            timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// Shared per-backend transport. Cookie access is serialized by the mutex.
pub struct HttpClient {
    client: reqwest::Client,
    cookies: Mutex<CookieStore>,
    max_redirects: u32,
}

impl HttpClient {
    pub fn new(options: &HttpOptions) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(options.timeout)
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(!options.verify_ssl)
            .build()
            .map_err(TransportError::Client)?;

        Ok(Self {
            client,
            cookies: Mutex::new(CookieStore::new()),
            max_redirects: options.max_redirects,
        })
    }

    /// Send a request, following redirects up to the configured limit.
    ///
    /// `headers` are applied after the cookie-derived headers, so an
    /// authentication strategy can override anything the jar would send.
    pub async fn request(
        &self,
        method: Method,
        url: Url,
        headers: &HeaderMap,
        body: Option<&Value>,
        content_type: ContentType,
    ) -> Result<HttpResponse, TransportError> {
        let started = Instant::now();
        let origin = url.to_string();
        let mut method = method;
        let mut url = url;
        let mut payload = body.map(|b| encode_body(b, content_type)).transpose()?;
        let mut redirects = 0;

        loop {
            let request_headers =
                self.prepare_headers(&url, headers, payload.as_ref().map(|_| content_type))?;
            log_request(&method, &url, &request_headers, payload.as_deref());

            let mut builder = self
                .client
                .request(method.clone(), url.clone())
                .headers(request_headers);
            if let Some(payload) = &payload {
                builder = builder.body(payload.clone());
            }

            let response = builder
                .send()
                .await
                .map_err(|source| TransportError::CannotConnect {
                    url: url.to_string(),
                    source,
                })?;

            let status = response.status();
            let response_headers = response.headers().clone();
            let reason = response
                .extensions()
                .get::<ReasonPhrase>()
                .map(|phrase| String::from_utf8_lossy(phrase.as_bytes()).into_owned());
            self.with_cookies(|store| {
                let now = Utc::now();
                store.record(&response_headers, now);
                store.purge_expired(now);
            });

            let text = response
                .text()
                .await
                .map_err(|source| TransportError::CannotConnect {
                    url: url.to_string(),
                    source,
                })?;
            let parsed = parse_body(&response_headers, &text);
            log_response(status, &url, &response_headers, &text);

            if is_redirect(status) {
                if let Some(location) = response_headers
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                {
                    if redirects >= self.max_redirects {
                        warn!(url = %origin, limit = self.max_redirects, "Redirect limit exceeded");
                        return Err(TransportError::TooManyRedirects {
                            url: origin,
                            limit: self.max_redirects,
                        });
                    }

                    let next = url
                        .join(location)
                        .map_err(|e| TransportError::InvalidUrl(format!("{location}: {e}")))?;
                    debug!(status = status.as_u16(), from = %url, to = %next, "Following redirect");

                    if status == StatusCode::SEE_OTHER {
                        method = Method::GET;
                        payload = None;
                    }
                    url = next;
                    redirects += 1;
                    continue;
                }
            }

            return Ok(HttpResponse {
                status,
                headers: response_headers,
                body: parsed,
                url,
                redirects,
                elapsed: started.elapsed(),
                reason,
            });
        }
    }

    /// Snapshot of a stored cookie.
    pub fn cookie(&self, name: &str) -> Option<StoredCredential> {
        self.with_cookies(|store| store.get(name).cloned())
    }

    pub fn cookie_valid(&self, name: &str, now: DateTime<Utc>) -> bool {
        self.with_cookies(|store| store.is_valid(name, now))
    }

    /// Non-empty and unexpired; a cookie without an expiry qualifies.
    pub fn cookie_present(&self, name: &str, now: DateTime<Utc>) -> bool {
        self.with_cookies(|store| store.is_present(name, now))
    }

    pub fn remove_cookie(&self, name: &str) -> Option<StoredCredential> {
        self.with_cookies(|store| store.remove(name))
    }

    fn with_cookies<R>(&self, f: impl FnOnce(&mut CookieStore) -> R) -> R {
        let mut guard: MutexGuard<'_, CookieStore> =
            self.cookies.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    fn prepare_headers(
        &self,
        url: &Url,
        extra: &HeaderMap,
        content_type: Option<ContentType>,
    ) -> Result<HeaderMap, TransportError> {
        let mut headers = HeaderMap::new();

        let cookies: Vec<(String, String)> = self.with_cookies(|store| {
            let now = Utc::now();
            store.purge_expired(now);
            store
                .valid_for(url, now)
                .into_iter()
                .map(|c| (c.name.clone(), c.value.clone()))
                .collect()
        });

        if !cookies.is_empty() {
            let line = cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            headers.insert(COOKIE, header_value(COOKIE.as_str(), &line)?);

            if let Some((_, token)) = cookies.iter().find(|(name, _)| name == XSRF_COOKIE) {
                headers.insert(
                    HeaderName::from_static(XSRF_HEADER),
                    header_value(XSRF_HEADER, token)?,
                );
            }
        }

        for (name, value) in extra {
            headers.insert(name.clone(), value.clone());
        }

        if let Some(content_type) = content_type {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type.as_str()));
        }

        Ok(headers)
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value).map_err(|_| TransportError::InvalidHeader {
        name: name.to_string(),
    })
}

fn encode_body(body: &Value, content_type: ContentType) -> Result<String, TransportError> {
    match content_type {
        ContentType::Json => {
            serde_json::to_string(body).map_err(|e| TransportError::Body(e.to_string()))
        }
        ContentType::Form => {
            let Value::Object(fields) = body else {
                return Err(TransportError::Body(
                    "form bodies must be JSON objects".to_string(),
                ));
            };
            Ok(fields
                .iter()
                .map(|(key, value)| {
                    let value = match value {
                        Value::String(s) => s.clone(),
                        Value::Null => String::new(),
                        other => other.to_string(),
                    };
                    format!("{}={}", urlencoding::encode(key), urlencoding::encode(&value))
                })
                .collect::<Vec<_>>()
                .join("&"))
        }
        ContentType::Text | ContentType::Html => Ok(match body {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }),
    }
}

/// Parse a response body by its declared content type.
pub fn parse_body(headers: &HeaderMap, text: &str) -> Body {
    let text = text.trim_start_matches('\u{feff}');
    if text.trim().is_empty() {
        return Body::Empty;
    }

    let declared = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(ContentType::detect);

    match declared {
        Some(ContentType::Json) => match serde_json::from_str(text) {
            Ok(value) => Body::Json(value),
            Err(e) => {
                warn!(error = %e, "Failed to parse JSON response body");
                Body::Empty
            }
        },
        Some(ContentType::Form) => Body::Form(
            text.split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| {
                    let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                    (decode_form(key), decode_form(value))
                })
                .collect(),
        ),
        Some(ContentType::Text) | Some(ContentType::Html) | None => Body::Text(text.to_string()),
    }
}

fn decode_form(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|s| s.into_owned())
        .unwrap_or(spaced)
}

fn is_sensitive(name: &str) -> bool {
    matches!(
        name,
        "cookie" | "set-cookie" | "authorization" | XSRF_HEADER
    )
}

fn redacted_headers(headers: &HeaderMap) -> Vec<String> {
    headers
        .iter()
        .map(|(name, value)| {
            if is_sensitive(name.as_str()) {
                format!("{name}: <redacted>")
            } else {
                format!("{name}: {}", value.to_str().unwrap_or("<binary>"))
            }
        })
        .collect()
}

/// Shorten a body for logging, on a char boundary.
pub fn truncate_for_log(text: &str) -> String {
    let flat = text.replace(['\r', '\n'], " ");
    match flat.char_indices().nth(LOG_BODY_LIMIT) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat,
    }
}

fn log_request(method: &Method, url: &Url, headers: &HeaderMap, payload: Option<&str>) {
    debug!(
        %method,
        %url,
        headers = ?redacted_headers(headers),
        body = ?payload.map(|body| {
            if body.contains("password") {
                "<redacted>".to_string()
            } else {
                truncate_for_log(body)
            }
        }),
        "HTTP request"
    );
}

fn log_response(status: StatusCode, url: &Url, headers: &HeaderMap, text: &str) {
    debug!(
        status = status.as_u16(),
        %url,
        headers = ?redacted_headers(headers),
        body = %truncate_for_log(text),
        "HTTP response"
    );
}
