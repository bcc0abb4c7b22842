//! Cookie jar for a single backend.
//!
//! The vendor keeps its whole session in cookies (`xsrf-token`, `session-nonce`,
//! `session-auth`), so the jar is the source of truth for "am I logged in".
//! Entries are keyed by name; the server never scopes two cookies with the same
//! name to different paths.

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use cookie::Cookie;
use reqwest::Url;
use reqwest::header::{HeaderMap, SET_COOKIE};
use tracing::{debug, warn};

/// One cookie as set by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredential {
    pub name: String,
    pub value: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub path: String,
    pub domain: Option<String>,
    pub secure: bool,
    pub http_only: bool,
}

impl StoredCredential {
    /// Parse a single `Set-Cookie` header value.
    ///
    /// `Max-Age` wins over `Expires` when both are present. Values are
    /// percent-decoded. Returns `None` for headers without a `name=value` pair.
    pub fn parse(header: &str, now: DateTime<Utc>) -> Option<Self> {
        let cookie = match Cookie::parse_encoded(header) {
            Ok(cookie) => cookie,
            Err(e) => {
                debug!(error = %e, "Unparseable Set-Cookie header");
                return None;
            }
        };

        let expires_at = match cookie.max_age() {
            Some(max_age) => TimeDelta::try_seconds(max_age.whole_seconds())
                .and_then(|delta| now.checked_add_signed(delta))
                .or(Some(now)),
            None => cookie
                .expires_datetime()
                .and_then(|at| DateTime::from_timestamp(at.unix_timestamp(), 0)),
        };

        Some(StoredCredential {
            name: cookie.name().to_string(),
            value: cookie.value_trimmed().to_string(),
            expires_at,
            path: cookie
                .path()
                .filter(|path| path.starts_with('/'))
                .unwrap_or("/")
                .to_string(),
            domain: cookie
                .domain()
                .map(str::to_ascii_lowercase)
                .filter(|domain| !domain.is_empty()),
            secure: cookie.secure().unwrap_or(false),
            http_only: cookie.http_only().unwrap_or(false),
        })
    }

    /// Session cookies (no expiry) never expire on their own.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn matches(&self, url: &Url) -> bool {
        if self.secure && url.scheme() != "https" {
            return false;
        }

        if let Some(domain) = &self.domain {
            let Some(host) = url.host_str() else {
                return false;
            };
            let host = host.to_ascii_lowercase();
            if host != *domain && !host.ends_with(&format!(".{domain}")) {
                return false;
            }
        }

        let path = url.path();
        path == self.path
            || (path.starts_with(&self.path)
                && (self.path.ends_with('/') || path[self.path.len()..].starts_with('/')))
    }
}

/// Name-keyed cookie jar. Last write wins.
#[derive(Debug, Default, Clone)]
pub struct CookieStore {
    entries: HashMap<String, StoredCredential>,
}

impl CookieStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record every `Set-Cookie` header of a response.
    pub fn record(&mut self, headers: &HeaderMap, now: DateTime<Utc>) {
        for value in headers.get_all(SET_COOKIE) {
            match value.to_str() {
                Ok(raw) => self.record_one(raw, now),
                Err(_) => warn!("Ignoring non-ASCII Set-Cookie header"),
            }
        }
    }

    /// Record a single `Set-Cookie` value. An already-expired cookie deletes
    /// any stored cookie of the same name.
    pub fn record_one(&mut self, raw: &str, now: DateTime<Utc>) {
        let Some(credential) = StoredCredential::parse(raw, now) else {
            debug!(header = %raw, "Ignoring malformed Set-Cookie header");
            return;
        };

        if credential.is_expired(now) {
            if self.entries.remove(&credential.name).is_some() {
                debug!(cookie = %credential.name, "Server expired cookie");
            }
            return;
        }

        match self.entries.get(&credential.name) {
            Some(existing)
                if existing.value == credential.value
                    && existing.expires_at == credential.expires_at => {}
            _ => {
                debug!(cookie = %credential.name, expires_at = ?credential.expires_at, "Stored cookie");
                self.entries.insert(credential.name.clone(), credential);
            }
        }
    }

    /// Cookies that may be sent to `url` at `now`, sorted by name.
    pub fn valid_for(&self, url: &Url, now: DateTime<Utc>) -> Vec<&StoredCredential> {
        let mut valid: Vec<_> = self
            .entries
            .values()
            .filter(|c| !c.is_expired(now) && c.matches(url))
            .collect();
        valid.sort_by(|a, b| a.name.cmp(&b.name));
        valid
    }

    /// Drop every expired cookie. Returns how many were removed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|name, credential| {
            let keep = !credential.is_expired(now);
            if !keep {
                debug!(cookie = %name, "Purged expired cookie");
            }
            keep
        });
        before - self.entries.len()
    }

    pub fn get(&self, name: &str) -> Option<&StoredCredential> {
        self.entries.get(name)
    }

    /// A credential counts as valid only with a non-empty value and an
    /// explicit expiry that lies in the future.
    pub fn is_valid(&self, name: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .get(name)
            .is_some_and(|c| !c.value.is_empty() && c.expires_at.is_some_and(|at| at > now))
    }

    /// A cookie is present when it has a non-empty value and has not
    /// expired. Session cookies without an expiry count.
    pub fn is_present(&self, name: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .get(name)
            .is_some_and(|c| !c.value.is_empty() && !c.is_expired(now))
    }

    pub fn remove(&mut self, name: &str) -> Option<StoredCredential> {
        self.entries.remove(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
