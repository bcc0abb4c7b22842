//! Typed records for the vendor's JSON payloads.
//!
//! Field names on the wire are PascalCase and most numbers arrive as strings,
//! so the lenient (de)serializers below accept both and write back the
//! vendor's own representation.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Longest error message kept in metadata and notifications.
pub const MAX_MESSAGE_LEN: usize = 255;
const TRUNCATION_SUFFIX: &str = " ... (see log for full message)";

/// Cut `message` at a word boundary so that, with the suffix, it fits in `max_len` chars.
pub fn truncate_message(message: &str, max_len: usize) -> String {
    let available = max_len.saturating_sub(TRUNCATION_SUFFIX.chars().count());
    if message.chars().count() <= available {
        return message.to_string();
    }

    let mut kept = String::new();
    for word in message.split_whitespace() {
        let candidate = kept.chars().count() + word.chars().count();
        if candidate > available {
            break;
        }
        kept.push_str(word);
        kept.push(' ');
    }

    format!("{}{}", kept.trim_end(), TRUNCATION_SUFFIX)
}

/// A backup job as returned by `GET /api/v1/backup/{id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    #[serde(rename = "Backup")]
    pub backup: BackupInfo,
    #[serde(rename = "Schedule", default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
}

impl JobDefinition {
    pub fn id(&self) -> &str {
        &self.backup.id
    }

    pub fn name(&self) -> &str {
        &self.backup.name
    }

    pub fn metadata(&self) -> &JobMetadata {
        &self.backup.metadata
    }

    pub fn next_run_time(&self) -> Option<DateTime<Utc>> {
        self.schedule.as_ref().and_then(|s| s.next_run_time)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
    #[serde(rename = "ID", deserialize_with = "lenient::string")]
    pub id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Description", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "TargetURL", default, skip_serializing_if = "Option::is_none")]
    pub target_url: Option<String>,
    #[serde(rename = "Metadata", default)]
    pub metadata: JobMetadata,
    /// Fields this crate does not interpret, kept for round trips.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMetadata {
    #[serde(
        rename = "LastBackupStarted",
        default,
        with = "metadata_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_run_started: Option<DateTime<Utc>>,
    #[serde(
        rename = "LastBackupFinished",
        default,
        with = "metadata_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_run_finished: Option<DateTime<Utc>>,
    #[serde(
        rename = "LastBackupDuration",
        default,
        with = "vendor_duration",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_run_duration: Option<Duration>,
    #[serde(
        rename = "LastErrorDate",
        default,
        with = "metadata_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_error_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "LastErrorMessage",
        default,
        deserialize_with = "lenient::truncated_message",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_error_message: Option<String>,
    #[serde(
        rename = "SourceFilesSize",
        default,
        with = "count_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_size: Option<u64>,
    #[serde(
        rename = "SourceFilesCount",
        default,
        with = "count_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_file_count: Option<u64>,
    #[serde(
        rename = "TargetFilesSize",
        default,
        with = "count_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_size: Option<u64>,
    #[serde(
        rename = "TargetFilesCount",
        default,
        with = "count_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_file_count: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl JobMetadata {
    /// No error timestamp means success. An error without a finish time is a
    /// failure. With both present the run failed only if the error is
    /// strictly later than the finish.
    pub fn last_run_failed(&self) -> bool {
        match (self.last_error_at, self.last_run_finished) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(error), Some(finished)) => error > finished,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(rename = "ID", deserialize_with = "lenient::integer")]
    pub id: i64,
    #[serde(rename = "Tags", default, deserialize_with = "lenient::string_list")]
    pub tags: Vec<String>,
    #[serde(
        rename = "Time",
        default,
        with = "schedule_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub next_run_time: Option<DateTime<Utc>>,
    #[serde(rename = "Repeat", default)]
    pub repeat: String,
    #[serde(
        rename = "LastRun",
        default,
        with = "schedule_time",
        skip_serializing_if = "Option::is_none"
    )]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(rename = "Rule", default)]
    pub rule: String,
    #[serde(rename = "AllowedDays", default, skip_serializing_if = "Option::is_none")]
    pub allowed_days: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Vendor task phase. Anything not idle or terminal counts as running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Phase {
    #[default]
    Idle,
    Running(String),
    Error,
    Complete,
}

impl Phase {
    pub fn is_running(&self) -> bool {
        matches!(self, Phase::Running(_))
    }
}

impl From<String> for Phase {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "" | "No active backup" => Phase::Idle,
            "Error" => Phase::Error,
            "Backup_Complete" => Phase::Complete,
            _ => Phase::Running(raw),
        }
    }
}

impl From<Phase> for String {
    fn from(phase: Phase) -> Self {
        phase.to_string()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => f.write_str("No active backup"),
            Phase::Running(sub_phase) => f.write_str(sub_phase),
            Phase::Error => f.write_str("Error"),
            Phase::Complete => f.write_str("Backup_Complete"),
        }
    }
}

/// `GET /api/v1/progressstate`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    #[serde(rename = "BackupID", default, deserialize_with = "lenient::string")]
    pub job_id: String,
    #[serde(rename = "TaskID", default, deserialize_with = "lenient::integer")]
    pub task_id: i64,
    #[serde(rename = "Phase", default, deserialize_with = "lenient::phase")]
    pub phase: Phase,
    #[serde(rename = "OverallProgress", default)]
    pub overall_progress: f64,
    #[serde(rename = "ProcessedFileCount", default, deserialize_with = "lenient::unsigned")]
    pub processed_file_count: u64,
    #[serde(rename = "ProcessedFileSize", default, deserialize_with = "lenient::unsigned")]
    pub processed_file_size: u64,
    #[serde(rename = "TotalFileCount", default, deserialize_with = "lenient::unsigned")]
    pub total_file_count: u64,
    #[serde(rename = "TotalFileSize", default, deserialize_with = "lenient::unsigned")]
    pub total_file_size: u64,
    #[serde(rename = "CurrentFilename", default)]
    pub current_file: Option<String>,
    #[serde(rename = "StillCounting", default)]
    pub still_counting: bool,
}

/// `GET /api/v1/systeminfo`, reduced to what is logged and shown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    #[serde(rename = "ServerVersion", default)]
    pub server_version: Option<String>,
    #[serde(rename = "ServerVersionName", default)]
    pub server_version_name: Option<String>,
    #[serde(rename = "APIVersion", default)]
    pub api_version: Option<i64>,
    #[serde(rename = "MachineName", default)]
    pub machine_name: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// `POST /api/v1/backup/{id}/run`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartResponse {
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "ID", default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<i64>,
}

impl StartResponse {
    pub fn accepted(&self) -> bool {
        self.status.eq_ignore_ascii_case("OK")
    }
}

mod lenient {
    use super::*;
    use serde::de::Error;

    pub fn string<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::String(s) => s,
            Value::Null => String::new(),
            Value::Number(n) => n.to_string(),
            other => return Err(D::Error::custom(format!("expected string, got {other}"))),
        })
    }

    pub fn integer<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
        match Value::deserialize(d)? {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .ok_or_else(|| D::Error::custom("integer out of range")),
            Value::String(s) if s.trim().is_empty() => Ok(0),
            Value::String(s) => s.trim().parse().map_err(D::Error::custom),
            Value::Null => Ok(0),
            other => Err(D::Error::custom(format!("expected integer, got {other}"))),
        }
    }

    pub fn unsigned<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let value = integer(d)?;
        u64::try_from(value).map_err(D::Error::custom)
    }

    pub fn phase<'de, D: Deserializer<'de>>(d: D) -> Result<Phase, D::Error> {
        Ok(Phase::from(string(d)?))
    }

    pub fn string_list<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<String>, D::Error> {
        Ok(Option::<Vec<String>>::deserialize(d)?.unwrap_or_default())
    }

    pub fn truncated_message<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(Option::<String>::deserialize(d)?
            .filter(|m| !m.is_empty())
            .map(|m| truncate_message(&m, MAX_MESSAGE_LEN)))
    }
}

/// Generates a `with` module for optional timestamps in a fixed vendor format.
macro_rules! timestamp_format {
    ($module:ident, $format:literal) => {
        mod $module {
            use super::*;
            use chrono::NaiveDateTime;
            use serde::de::Error;

            pub fn serialize<S: Serializer>(
                value: &Option<DateTime<Utc>>,
                s: S,
            ) -> Result<S::Ok, S::Error> {
                match value {
                    Some(at) => s.serialize_str(&at.format($format).to_string()),
                    None => s.serialize_none(),
                }
            }

            pub fn deserialize<'de, D: Deserializer<'de>>(
                d: D,
            ) -> Result<Option<DateTime<Utc>>, D::Error> {
                match Option::<String>::deserialize(d)? {
                    Some(raw) if !raw.trim().is_empty() => {
                        NaiveDateTime::parse_from_str(raw.trim(), $format)
                            .map(|naive| Some(naive.and_utc()))
                            .map_err(|e| D::Error::custom(format!("invalid timestamp '{raw}': {e}")))
                    }
                    _ => Ok(None),
                }
            }
        }
    };
}

timestamp_format!(metadata_time, "%Y%m%dT%H%M%SZ");
timestamp_format!(schedule_time, "%Y-%m-%dT%H:%M:%SZ");

mod count_string {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Option<u64>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(n) => s.serialize_str(&n.to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u64>, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }
}

/// .NET `TimeSpan` strings: `[d.]hh:mm:ss[.fffffff]`.
mod vendor_duration {
    use super::*;
    use serde::de::Error;

    const TICKS_PER_SECOND: u32 = 10_000_000;

    pub fn parse(raw: &str) -> Option<Duration> {
        let mut parts = raw.trim().split(':');
        let (hours_part, minutes, seconds) = (parts.next()?, parts.next()?, parts.next()?);
        if parts.next().is_some() {
            return None;
        }

        let (days, hours) = match hours_part.split_once('.') {
            Some((days, hours)) => (days.parse::<u64>().ok()?, hours.parse::<u64>().ok()?),
            None => (0, hours_part.parse::<u64>().ok()?),
        };
        let minutes: u64 = minutes.parse().ok()?;
        let (whole, fraction) = seconds.split_once('.').unwrap_or((seconds, ""));
        let whole: u64 = whole.parse().ok()?;

        let nanos = if fraction.is_empty() {
            0
        } else {
            let digits: String = fraction.chars().take(9).collect();
            if !digits.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            format!("{digits:0<9}").parse::<u32>().ok()?
        };

        let total = ((days * 24 + hours) * 60 + minutes) * 60 + whole;
        Some(Duration::new(total, nanos))
    }

    pub fn format(duration: &Duration) -> String {
        let total = duration.as_secs();
        let (days, rest) = (total / 86_400, total % 86_400);
        let (hours, minutes, seconds) = (rest / 3600, (rest % 3600) / 60, rest % 60);
        let ticks = duration.subsec_nanos() / (1_000_000_000 / TICKS_PER_SECOND);

        let mut out = if days > 0 {
            format!("{days}.{hours:02}:{minutes:02}:{seconds:02}")
        } else {
            format!("{hours:02}:{minutes:02}:{seconds:02}")
        };
        if ticks > 0 {
            out.push_str(&format!(".{ticks:07}"));
        }
        out
    }

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => s.serialize_str(&format(duration)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(raw) if !raw.trim().is_empty() => parse(&raw)
                .map(Some)
                .ok_or_else(|| D::Error::custom(format!("invalid duration '{raw}'"))),
            _ => Ok(None),
        }
    }
}
