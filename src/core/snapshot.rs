//! Published job status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::api::JobDefinition;

pub const METRIC_CURRENT_STATUS: &str = "current_status";
pub const METRIC_LAST_BACKUP_STATUS: &str = "last_backup_status";
pub const METRIC_LAST_BACKUP_EXECUTION: &str = "last_backup_execution";
pub const METRIC_LAST_BACKUP_DURATION: &str = "last_backup_duration";
pub const METRIC_LAST_BACKUP_SOURCE_SIZE: &str = "last_backup_source_size";
pub const METRIC_LAST_BACKUP_SOURCE_FILES_COUNT: &str = "last_backup_source_files_count";
pub const METRIC_LAST_BACKUP_TARGET_SIZE: &str = "last_backup_target_size";
pub const METRIC_LAST_BACKUP_TARGET_FILES_COUNT: &str = "last_backup_target_files_count";
pub const METRIC_LAST_BACKUP_ERROR_MESSAGE: &str = "last_backup_error_message";
pub const METRIC_NEXT_BACKUP_EXECUTION: &str = "next_backup_execution";

/// Metric values derived from one fetch of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JobMetrics {
    pub current_status: bool,
    /// `true` when the last run failed.
    pub last_backup_status: bool,
    pub last_backup_execution: Option<DateTime<Utc>>,
    /// Seconds.
    pub last_backup_duration: Option<f64>,
    pub last_backup_source_size: Option<u64>,
    pub last_backup_source_files_count: Option<u64>,
    pub last_backup_target_size: Option<u64>,
    pub last_backup_target_files_count: Option<u64>,
    pub last_backup_error_message: Option<String>,
    pub next_backup_execution: Option<DateTime<Utc>>,
}

impl JobMetrics {
    /// Derive metrics from a job definition. A failed run reports the error
    /// time as its execution and leaves duration, sizes and counts absent.
    pub fn from_definition(job: &JobDefinition, running: bool, now: DateTime<Utc>) -> Self {
        let meta = job.metadata();
        let next_backup_execution = job.next_run_time().filter(|at| *at > now);

        if meta.last_run_failed() {
            return Self {
                current_status: running,
                last_backup_status: true,
                last_backup_execution: meta.last_error_at,
                last_backup_error_message: meta.last_error_message.clone(),
                next_backup_execution,
                ..Default::default()
            };
        }

        Self {
            current_status: running,
            last_backup_status: false,
            last_backup_execution: meta.last_run_finished,
            last_backup_duration: meta.last_run_duration.map(|d| d.as_secs_f64()),
            last_backup_source_size: meta.source_size,
            last_backup_source_files_count: meta.source_file_count,
            last_backup_target_size: meta.target_size,
            last_backup_target_files_count: meta.target_file_count,
            last_backup_error_message: None,
            next_backup_execution,
        }
    }

    /// Metric name to value, absent values included as `Absent`.
    pub fn to_map(&self) -> BTreeMap<&'static str, MetricValue> {
        BTreeMap::from([
            (METRIC_CURRENT_STATUS, MetricValue::Flag(self.current_status)),
            (METRIC_LAST_BACKUP_STATUS, MetricValue::Flag(self.last_backup_status)),
            (METRIC_LAST_BACKUP_EXECUTION, self.last_backup_execution.into()),
            (
                METRIC_LAST_BACKUP_DURATION,
                self.last_backup_duration
                    .map_or(MetricValue::Absent, MetricValue::Seconds),
            ),
            (METRIC_LAST_BACKUP_SOURCE_SIZE, self.last_backup_source_size.into()),
            (METRIC_LAST_BACKUP_SOURCE_FILES_COUNT, self.last_backup_source_files_count.into()),
            (METRIC_LAST_BACKUP_TARGET_SIZE, self.last_backup_target_size.into()),
            (METRIC_LAST_BACKUP_TARGET_FILES_COUNT, self.last_backup_target_files_count.into()),
            (
                METRIC_LAST_BACKUP_ERROR_MESSAGE,
                self.last_backup_error_message
                    .clone()
                    .map_or(MetricValue::Absent, MetricValue::Text),
            ),
            (METRIC_NEXT_BACKUP_EXECUTION, self.next_backup_execution.into()),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Flag(bool),
    Timestamp(DateTime<Utc>),
    Seconds(f64),
    Count(u64),
    Text(String),
    Absent,
}

impl From<Option<DateTime<Utc>>> for MetricValue {
    fn from(value: Option<DateTime<Utc>>) -> Self {
        value.map_or(MetricValue::Absent, MetricValue::Timestamp)
    }
}

impl From<Option<u64>> for MetricValue {
    fn from(value: Option<u64>) -> Self {
        value.map_or(MetricValue::Absent, MetricValue::Count)
    }
}

/// One published status. Replaced wholesale, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub job_id: String,
    pub sequence: u64,
    pub published_at: DateTime<Utc>,
    #[serde(flatten)]
    pub metrics: JobMetrics,
}
