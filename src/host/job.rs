use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a job on this host.
///
/// Jobs only move forward: `Starting -> Running -> terminal`, or straight
/// from `Starting` to a terminal status when the backend fails to start it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Starting,
    Running,
    Done,
    Crashed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Crashed | JobStatus::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            JobStatus::Starting => 0,
            JobStatus::Running => 1,
            JobStatus::Done | JobStatus::Crashed | JobStatus::Failed => 2,
        }
    }

    /// Whether a job in `self` may move to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Starting => write!(f, "starting"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Crashed => write!(f, "crashed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A workload unit as scheduled onto this host.
///
/// `metadata` is opaque to the agent and passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Job {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// The store's record of a job and where it is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveJob {
    pub job: Job,
    pub status: JobStatus,
    /// Set while `Starting` to stop the job as soon as it is running.
    #[serde(default)]
    pub force_stop: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_status: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ActiveJob {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            status: JobStatus::Starting,
            force_stop: false,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            exit_status: None,
            error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.job.id
    }
}

/// A job status change as delivered to listeners.
///
/// Carries the full job record so consumers never need a follow-up query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub job_id: String,
    pub status: JobStatus,
    pub job: ActiveJob,
}

impl Event {
    pub fn from_job(job: &ActiveJob) -> Self {
        Self {
            job_id: job.job.id.clone(),
            status: job.status,
            job: job.clone(),
        }
    }
}
