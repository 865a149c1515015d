//! Normalized job events pushed to live subscribers.

use serde::{Deserialize, Serialize};

use super::job::{Job, JobStatus};

/// Event type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Progress,
    Status,
    Completed,
    Error,
}

/// A job state-change event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobEvent {
    fn empty(event_type: EventType, job_id: &str) -> Self {
        Self {
            event_type,
            job_id: job_id.to_string(),
            progress: None,
            speed: None,
            eta: None,
            status: None,
            filename: None,
            error: None,
        }
    }

    /// Progress sample of a running job.
    pub fn progress(job: &Job) -> Self {
        Self {
            progress: job.progress,
            speed: job.speed.clone(),
            eta: job.eta.clone(),
            ..Self::empty(EventType::Progress, &job.id)
        }
    }

    /// Plain status change. Retrying jobs carry the error that caused the retry.
    pub fn status(job: &Job) -> Self {
        Self {
            status: Some(job.status),
            error: match job.status {
                JobStatus::Retrying => job.error.clone(),
                _ => None,
            },
            ..Self::empty(EventType::Status, &job.id)
        }
    }

    /// Successful completion.
    pub fn completed(job: &Job) -> Self {
        Self {
            status: Some(job.status),
            filename: job.filename.clone(),
            progress: job.progress,
            ..Self::empty(EventType::Completed, &job.id)
        }
    }

    /// Permanent failure.
    pub fn error(job: &Job) -> Self {
        Self {
            status: Some(job.status),
            error: job.error.clone(),
            ..Self::empty(EventType::Error, &job.id)
        }
    }

    /// Pick the event matching the job's current status.
    pub fn for_transition(job: &Job) -> Self {
        match job.status {
            JobStatus::Completed => Self::completed(job),
            JobStatus::Failed => Self::error(job),
            _ => Self::status(job),
        }
    }
}
