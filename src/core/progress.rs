//! In-memory progress tracking for running backups.
//!
//! Progress is recorded on every fast poll while a job is being actively
//! monitored and dropped once the run finishes. Nothing here is persisted;
//! the status API reads it for live progress.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::api::JobProgress;

/// Thread-safe store of the latest progress report per job.
///
/// Shared between a backend's coordinators and the status API.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<RwLock<HashMap<String, JobProgress>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record the latest progress for a job.
    pub async fn update(&self, job_id: &str, progress: JobProgress) {
        let mut map = self.inner.write().await;
        map.insert(job_id.to_string(), progress);
    }

    /// Get the current progress for a specific job.
    pub async fn get(&self, job_id: &str) -> Option<JobProgress> {
        let map = self.inner.read().await;
        map.get(job_id).cloned()
    }

    /// Stop tracking a job (called when its run finishes).
    pub async fn remove(&self, job_id: &str) {
        let mut map = self.inner.write().await;
        map.remove(job_id);
    }

    pub async fn active_count(&self) -> usize {
        let map = self.inner.read().await;
        map.len()
    }
}
