use chrono::{DateTime, SubsecRound, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::WorkError;

/// Current instant, truncated to the microsecond precision the store keeps.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Lifecycle state of a job.
///
/// ```text
/// PENDING ─┐
///          ├─> QUEUED ─> TO_BE_RUN ─> RUNNING ─> SUCCEEDED | FAILED | ABORTED
/// (direct) ┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its trigger date.
    Pending,
    /// Eligible for a claim.
    Queued,
    /// Claimed by a dispatcher, not yet started by a worker.
    ToBeRun,
    /// Executing in a worker slot.
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl JobStatus {
    /// Statuses after which a record never changes again.
    pub const TERMINAL: [JobStatus; 3] =
        [JobStatus::Succeeded, JobStatus::Failed, JobStatus::Aborted];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::ToBeRun => "to_be_run",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown job status: {0}")]
pub struct UnknownStatus(pub String);

impl std::str::FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "to_be_run" => Ok(JobStatus::ToBeRun),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "aborted" => Ok(JobStatus::Aborted),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One named job parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParameter {
    pub name: String,
    pub value: serde_json::Value,
}

/// Ordered name → value mapping handed verbatim to the work implementation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobParameters(Vec<JobParameter>);

impl JobParameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `name`, keeping its original position if it already exists.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|p| p.name == name) {
            Some(existing) => existing.value = value,
            None => self.0.push(JobParameter { name, value }),
        }
    }

    pub fn raw(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    /// Typed lookup. `Ok(None)` when absent, `InvalidParameter` when the value
    /// does not deserialize into `T`.
    pub fn get<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, WorkError> {
        self.raw(name)
            .map(|v| {
                serde_json::from_value(v.clone()).map_err(|e| WorkError::InvalidParameter {
                    name: name.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    /// Typed lookup of a mandatory parameter.
    pub fn require<T: DeserializeOwned>(&self, name: &str) -> Result<T, WorkError> {
        self.get(name)?.ok_or_else(|| WorkError::MissingParameter {
            name: name.to_string(),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobParameter> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A submission request. Build with [`NewJob::new`] and the `with_*` helpers.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub tenant: String,
    pub job_type: String,
    pub parameters: JobParameters,
    pub priority: i32,
    pub expiration_date: Option<DateTime<Utc>>,
    pub trigger_date: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(tenant: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            job_type: job_type.into(),
            parameters: JobParameters::new(),
            priority: 0,
            expiration_date: None,
            trigger_date: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parameter(
        mut self,
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.parameters.insert(name, value);
        self
    }

    pub fn with_parameters(mut self, parameters: JobParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expiration_date = Some(at.trunc_subsecs(6));
        self
    }

    /// Keep the job PENDING until `at`.
    pub fn triggered_at(mut self, at: DateTime<Utc>) -> Self {
        self.trigger_date = Some(at.trunc_subsecs(6));
        self
    }
}

/// A persisted job record. The store owns it; copies held elsewhere are
/// snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// UUIDv7 string — primary key.
    pub id: String,
    pub tenant: String,
    /// Key into the [`WorkRegistry`](crate::registry::WorkRegistry).
    pub job_type: String,
    pub parameters: JobParameters,
    /// Higher value = claimed earlier.
    pub priority: i32,
    pub status: JobStatus,
    /// 0–100, never decreases while running.
    pub percent_completed: u8,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub trigger_date: Option<DateTime<Utc>>,
    pub start_date: Option<DateTime<Utc>>,
    pub stop_date: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error_detail: Option<String>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Materialise a submission: PENDING when a trigger date is set, QUEUED
    /// otherwise.
    pub fn from_new(job: NewJob, now: DateTime<Utc>) -> Self {
        let status = if job.trigger_date.is_some() {
            JobStatus::Pending
        } else {
            JobStatus::Queued
        };
        Self {
            id: Uuid::now_v7().to_string(),
            tenant: job.tenant,
            job_type: job.job_type,
            parameters: job.parameters,
            priority: job.priority,
            status,
            percent_completed: 0,
            estimated_completion: None,
            last_heartbeat: None,
            expiration_date: job.expiration_date,
            trigger_date: job.trigger_date,
            start_date: None,
            stop_date: None,
            result: None,
            error_detail: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_date.is_some_and(|exp| exp <= now)
    }
}

/// Extrapolate the completion instant from elapsed time and progress.
///
/// `start + (now - start) * (100 - percent) / percent`; `None` at 0 %.
pub fn estimate_completion(
    start: DateTime<Utc>,
    now: DateTime<Utc>,
    percent: u8,
) -> Option<DateTime<Utc>> {
    if percent == 0 {
        return None;
    }
    let percent = i64::from(percent.min(100));
    let elapsed_us = (now - start).num_microseconds()?;
    let remaining_us = elapsed_us.checked_mul(100 - percent)? / percent;
    Some(start + chrono::Duration::microseconds(remaining_us))
}

/// Kind of lifecycle notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobEventType {
    Running,
    Succeeded,
    Failed,
    Aborted,
}

/// Lifecycle notification, emitted after the matching state is durable.
///
/// Delivery is at-least-once; consumers deduplicate on [`JobEvent::dedup_key`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job_id: String,
    pub tenant: String,
    pub job_type: String,
    pub event_type: JobEventType,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(job: &JobRecord, event_type: JobEventType, timestamp: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id.clone(),
            tenant: job.tenant.clone(),
            job_type: job.job_type.clone(),
            event_type,
            timestamp,
        }
    }

    pub fn dedup_key(&self) -> (&str, JobEventType) {
        (&self.job_id, self.event_type)
    }
}
