//! Per-server backends, keyed by `host:port`.
//!
//! A backend owns everything tied to one Duplicati server: the transport and
//! its cookie store (inside the API client), the auth strategy, the service
//! and one coordinator per monitored job.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

use crate::api::{ApiClient, BackupApi, validate_job_id};
use crate::config::{AppConfig, MonitorSettings, ServerConfig};
use crate::core::{Coordinator, NotificationChannel, ProgressTracker, create_notifier};
use crate::service::BackupService;

pub struct Backend {
    host: String,
    service: BackupService,
    progress: ProgressTracker,
}

impl Backend {
    /// Check the server answers, then start a coordinator per configured job
    /// and refresh each once.
    pub async fn connect(
        server: &ServerConfig,
        settings: &MonitorSettings,
        notifier: Option<Arc<dyn NotificationChannel>>,
    ) -> Result<Self> {
        let client = ApiClient::from_config(server)
            .with_context(|| format!("Invalid server configuration for {}", server.url))?;
        let api: Arc<dyn BackupApi> = Arc::new(client);
        Self::start(api, &server.jobs, settings, notifier).await
    }

    pub async fn start(
        api: Arc<dyn BackupApi>,
        jobs: &[String],
        settings: &MonitorSettings,
        notifier: Option<Arc<dyn NotificationChannel>>,
    ) -> Result<Self> {
        let host = api.host().to_string();
        let info = api
            .get_system_info()
            .await
            .with_context(|| format!("Cannot reach Duplicati server {host}"))?
            .into_result()
            .with_context(|| format!("Server {host} refused the system info request"))?;
        info!(
            host = %host,
            version = info.server_version.as_deref().unwrap_or("unknown"),
            jobs = jobs.len(),
            "Connected to Duplicati server"
        );

        let progress = ProgressTracker::new();
        let mut coordinators = Vec::with_capacity(jobs.len());
        for job_id in jobs {
            validate_job_id(job_id).with_context(|| format!("Invalid job id on {host}"))?;
            coordinators.push(Coordinator::spawn(
                job_id.clone(),
                Arc::clone(&api),
                settings.clone(),
                progress.clone(),
            ));
        }

        for coordinator in &coordinators {
            if let Err(error) = coordinator.refresh().await {
                warn!(host = %host, job_id = coordinator.job_id(), %error, "Initial refresh failed, will retry on the next poll");
            }
        }

        Ok(Self {
            host,
            service: BackupService::new(api, coordinators, notifier),
            progress,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn service(&self) -> &BackupService {
        &self.service
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub async fn unload(&self) {
        self.service.unload().await;
        info!(host = %self.host, "Backend unloaded");
    }
}

/// All connected backends. Replaces any process-wide host lookup table.
#[derive(Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect every configured server.
    pub async fn connect_all(config: &AppConfig) -> Result<Self> {
        let notifier = create_notifier(&config.notifications);
        let mut registry = Self::new();
        for server in &config.servers {
            let backend = Backend::connect(server, &config.monitoring, notifier.clone()).await?;
            registry.insert(backend)?;
        }
        Ok(registry)
    }

    pub fn insert(&mut self, backend: Backend) -> Result<Arc<Backend>> {
        if self.backends.contains_key(backend.host()) {
            bail!("Server {} is configured twice", backend.host());
        }
        let backend = Arc::new(backend);
        self.backends
            .insert(backend.host().to_string(), Arc::clone(&backend));
        Ok(backend)
    }

    pub fn get(&self, host: &str) -> Option<Arc<Backend>> {
        self.backends.get(host).cloned()
    }

    pub fn backends(&self) -> impl Iterator<Item = &Arc<Backend>> {
        self.backends.values()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub async fn unload_all(&self) {
        for backend in self.backends.values() {
            backend.unload().await;
        }
    }
}
