//! Scripted in-memory backend for coordinator and service tests.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::models::{BackupInfo, JobDefinition, JobMetadata, JobProgress, Phase, Schedule, StartResponse, SystemInfo};
use super::{ApiError, BackupApi, RemoteError, Reply};
use crate::http::TransportError;

#[derive(Default)]
pub(crate) struct FakeState {
    pub job: Option<JobDefinition>,
    /// Progress answers in order; the last one repeats.
    pub progress: VecDeque<JobProgress>,
    pub get_job_failures: usize,
    pub progress_failures: usize,
    pub get_job_calls: usize,
    pub progress_calls: usize,
    pub start_calls: usize,
    /// `start_job` answers `AlreadyRunning` for this job.
    pub running_elsewhere: Option<String>,
}

pub(crate) struct FakeApi {
    pub state: Mutex<FakeState>,
}

impl FakeApi {
    pub fn new(job: JobDefinition) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(FakeState {
                job: Some(job),
                ..Default::default()
            }),
        })
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn set_progress(&self, progress: JobProgress) {
        self.with(|s| s.progress = VecDeque::from([progress]));
    }

    pub fn set_job(&self, job: JobDefinition) {
        self.with(|s| s.job = Some(job));
    }

    pub fn get_job_calls(&self) -> usize {
        self.with(|s| s.get_job_calls)
    }

    pub fn progress_calls(&self) -> usize {
        self.with(|s| s.progress_calls)
    }

    pub fn start_calls(&self) -> usize {
        self.with(|s| s.start_calls)
    }
}

fn unreachable_error() -> ApiError {
    ApiError::Transport(TransportError::InvalidUrl("scripted failure".to_string()))
}

pub(crate) fn job(id: &str, next_run: Option<DateTime<Utc>>, metadata: JobMetadata) -> JobDefinition {
    JobDefinition {
        backup: BackupInfo {
            id: id.to_string(),
            name: format!("Job {id}"),
            description: None,
            target_url: None,
            metadata,
            extra: BTreeMap::new(),
        },
        schedule: next_run.map(|at| Schedule {
            id: 1,
            tags: vec![],
            next_run_time: Some(at),
            repeat: "1D".to_string(),
            last_run: None,
            rule: String::new(),
            allowed_days: None,
            extra: BTreeMap::new(),
        }),
    }
}

pub(crate) fn progress(job_id: &str, phase: &str) -> JobProgress {
    JobProgress {
        job_id: job_id.to_string(),
        task_id: 1,
        phase: Phase::from(phase.to_string()),
        overall_progress: 0.5,
        ..Default::default()
    }
}

#[async_trait]
impl BackupApi for FakeApi {
    fn host(&self) -> &str {
        "fake:8200"
    }

    async fn get_job(&self, _job_id: &str) -> Result<Reply<JobDefinition>, ApiError> {
        self.with(|s| {
            s.get_job_calls += 1;
            if s.get_job_failures > 0 {
                s.get_job_failures -= 1;
                return Err(unreachable_error());
            }
            Ok(match &s.job {
                Some(job) => Reply::Data(job.clone()),
                None => Reply::Error(RemoteError {
                    message: "Backup not found".to_string(),
                    code: Some(404),
                }),
            })
        })
    }

    async fn list_jobs(&self) -> Result<Reply<Vec<JobDefinition>>, ApiError> {
        self.with(|s| Ok(Reply::Data(s.job.iter().cloned().collect())))
    }

    async fn start_job(&self, _job_id: &str) -> Result<Reply<StartResponse>, ApiError> {
        self.with(|s| {
            if let Some(job_id) = &s.running_elsewhere {
                return Err(ApiError::AlreadyRunning {
                    job_id: job_id.clone(),
                });
            }
            s.start_calls += 1;
            Ok(Reply::Data(StartResponse {
                status: "OK".to_string(),
                task_id: Some(1),
            }))
        })
    }

    async fn update_job(&self, _job_id: &str, _patch: &Value) -> Result<Reply<Value>, ApiError> {
        Ok(Reply::Data(Value::Null))
    }

    async fn delete_job(&self, _job_id: &str) -> Result<Reply<Value>, ApiError> {
        Ok(Reply::Data(Value::Null))
    }

    async fn get_progress(&self) -> Result<Reply<JobProgress>, ApiError> {
        self.with(|s| {
            s.progress_calls += 1;
            if s.progress_failures > 0 {
                s.progress_failures -= 1;
                return Err(unreachable_error());
            }
            let next = if s.progress.len() > 1 {
                s.progress.pop_front()
            } else {
                s.progress.front().cloned()
            };
            Ok(match next {
                Some(progress) => Reply::Data(progress),
                None => Reply::Error(RemoteError {
                    message: "No active backup".to_string(),
                    code: None,
                }),
            })
        })
    }

    async fn get_system_info(&self) -> Result<Reply<SystemInfo>, ApiError> {
        Ok(Reply::Data(SystemInfo::default()))
    }
}
