//! Host-facing backup service for one backend.
//!
//! Every failure that reaches this layer is turned into a user-visible
//! notification before it is returned, and every outcome is announced on a
//! broadcast channel of [`HostEvent`]s.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::api::models::{MAX_MESSAGE_LEN, truncate_message};
use crate::api::{ApiError, BackupApi};
use crate::core::{CoordinatorHandle, MonitorError, Notification, NotificationChannel, StatusSnapshot};

const EVENT_BUFFER: usize = 64;

pub const TITLE_BACKUP_ERROR: &str = "Backup creation error";
pub const TITLE_REFRESH_ERROR: &str = "Sensor refresh error";

/// Outcome announcements for the host application.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    BackupStarted { host: String, job_id: String },
    BackupCompleted { host: String, job_id: String },
    BackupFailed { host: String, job_id: String, error: String },
    SensorsRefreshed { host: String, job_id: String },
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("job {job_id} is not monitored on {host}")]
    UnknownJob { host: String, job_id: String },

    #[error("server did not accept the run request (status {0})")]
    StartRejected(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

pub struct BackupService {
    host: String,
    api: Arc<dyn BackupApi>,
    coordinators: BTreeMap<String, CoordinatorHandle>,
    notifier: Option<Arc<dyn NotificationChannel>>,
    events: broadcast::Sender<HostEvent>,
}

impl BackupService {
    pub fn new(
        api: Arc<dyn BackupApi>,
        coordinators: Vec<CoordinatorHandle>,
        notifier: Option<Arc<dyn NotificationChannel>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            host: api.host().to_string(),
            api,
            coordinators: coordinators
                .into_iter()
                .map(|handle| (handle.job_id().to_string(), handle))
                .collect(),
            notifier,
            events,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn api(&self) -> &Arc<dyn BackupApi> {
        &self.api
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    pub fn job_ids(&self) -> impl Iterator<Item = &str> {
        self.coordinators.keys().map(String::as_str)
    }

    pub fn coordinator(&self, job_id: &str) -> Option<&CoordinatorHandle> {
        self.coordinators.get(job_id)
    }

    /// Start a run and wait until it finishes, notifying on any failure.
    pub async fn start_backup(&self, job_id: &str) -> Result<Arc<StatusSnapshot>, ServiceError> {
        match self.run_backup(job_id).await {
            Ok(snapshot) => Ok(snapshot),
            Err(error) => {
                self.emit(HostEvent::BackupFailed {
                    host: self.host.clone(),
                    job_id: job_id.to_string(),
                    error: error.to_string(),
                });
                self.notify(TITLE_BACKUP_ERROR, job_id, &error).await;
                Err(error)
            }
        }
    }

    async fn run_backup(&self, job_id: &str) -> Result<Arc<StatusSnapshot>, ServiceError> {
        let coordinator = self.known(job_id)?;

        let response = self.api.start_job(job_id).await?.into_result()?;
        if !response.accepted() {
            return Err(ServiceError::StartRejected(response.status));
        }
        info!(host = %self.host, job_id, task_id = ?response.task_id, "Backup started");
        self.emit(HostEvent::BackupStarted {
            host: self.host.clone(),
            job_id: job_id.to_string(),
        });

        let snapshot = coordinator.follow_run(coordinator.wait_timeout()).await?;
        info!(host = %self.host, job_id, "Backup completed");
        self.emit(HostEvent::BackupCompleted {
            host: self.host.clone(),
            job_id: job_id.to_string(),
        });
        self.emit(HostEvent::SensorsRefreshed {
            host: self.host.clone(),
            job_id: job_id.to_string(),
        });
        Ok(snapshot)
    }

    /// Refresh one job's status, notifying on failure.
    pub async fn refresh(&self, job_id: &str) -> Result<Arc<StatusSnapshot>, ServiceError> {
        let result = match self.known(job_id) {
            Ok(coordinator) => coordinator.refresh().await.map_err(ServiceError::from),
            Err(error) => Err(error),
        };

        match result {
            Ok(snapshot) => {
                self.emit(HostEvent::SensorsRefreshed {
                    host: self.host.clone(),
                    job_id: job_id.to_string(),
                });
                Ok(snapshot)
            }
            Err(error) => {
                self.notify(TITLE_REFRESH_ERROR, job_id, &error).await;
                Err(error)
            }
        }
    }

    /// Stop every coordinator of this backend.
    pub async fn unload(&self) {
        for coordinator in self.coordinators.values() {
            coordinator.unload().await;
        }
    }

    fn known(&self, job_id: &str) -> Result<&CoordinatorHandle, ServiceError> {
        self.coordinators
            .get(job_id)
            .ok_or_else(|| ServiceError::UnknownJob {
                host: self.host.clone(),
                job_id: job_id.to_string(),
            })
    }

    fn emit(&self, event: HostEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn notify(&self, title: &str, job_id: &str, error: &ServiceError) {
        let message = truncate_message(&error.to_string(), MAX_MESSAGE_LEN);
        warn!(host = %self.host, job_id, title, error = %error, "Reporting failure");

        let Some(notifier) = &self.notifier else {
            return;
        };
        let notification = Notification {
            title: title.to_string(),
            message,
            host: self.host.clone(),
            job_id: Some(job_id.to_string()),
        };
        if let Err(e) = notifier.notify(notification).await {
            warn!(host = %self.host, error = %e, "Failed to deliver notification");
        }
    }
}
