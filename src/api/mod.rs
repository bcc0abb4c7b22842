//! Backend API: job operations on top of the authenticated transport.

mod client;
pub mod models;

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::auth::AuthError;
use crate::http::TransportError;

pub use client::{ApiClient, host_key, normalize_base_url, validate_job_id};
pub use models::{JobDefinition, JobMetadata, JobProgress, Phase, Schedule, StartResponse, SystemInfo};

/// Application-level failure reported by the server in its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteError {
    pub message: String,
    pub code: Option<u16>,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("server reported an error: {0}")]
    Remote(RemoteError),

    #[error("failed to process response: {0}")]
    Processing(String),

    #[error("request rejected for a missing XSRF token after refreshing it")]
    MissingCsrf,

    #[error("a backup is already running (job {job_id})")]
    AlreadyRunning { job_id: String },

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ApiError {
    /// Failures where the server could not be reached at all.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ApiError::Transport(TransportError::CannotConnect { .. })
                | ApiError::Auth(AuthError::Unreachable(TransportError::CannotConnect { .. }))
        )
    }
}

/// Either the typed payload or the server's own error report.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply<T> {
    Data(T),
    Error(RemoteError),
}

impl<T> Reply<T> {
    pub fn into_result(self) -> Result<T, ApiError> {
        match self {
            Reply::Data(data) => Ok(data),
            Reply::Error(error) => Err(ApiError::Remote(error)),
        }
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            Reply::Data(data) => Some(data),
            Reply::Error(_) => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

/// Job operations the monitoring engine needs from a backend.
#[async_trait]
pub trait BackupApi: Send + Sync {
    /// Host name (with port) of the backend, used as its key.
    fn host(&self) -> &str;

    async fn get_job(&self, job_id: &str) -> Result<Reply<JobDefinition>, ApiError>;

    async fn list_jobs(&self) -> Result<Reply<Vec<JobDefinition>>, ApiError>;

    /// Start a run. Refuses while any job is running.
    async fn start_job(&self, job_id: &str) -> Result<Reply<StartResponse>, ApiError>;

    async fn update_job(&self, job_id: &str, patch: &Value) -> Result<Reply<Value>, ApiError>;

    async fn delete_job(&self, job_id: &str) -> Result<Reply<Value>, ApiError>;

    async fn get_progress(&self) -> Result<Reply<JobProgress>, ApiError>;

    async fn get_system_info(&self) -> Result<Reply<SystemInfo>, ApiError>;
}
