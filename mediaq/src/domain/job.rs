//! Job entity and its status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::request::{DownloadOptions, DownloadRequest, MediaKind};

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Ready to be admitted once a concurrency ticket frees.
    Queued,
    /// Dormant until `scheduled_time` arrives.
    Scheduled,
    /// Holding a ticket, engine is transferring the payload.
    Downloading,
    /// Holding a ticket, engine is post-processing (e.g. audio conversion).
    Processing,
    /// Parked until `resume_at` after a failed attempt.
    Retrying,
    /// Finished successfully.
    Completed,
    /// Failed permanently.
    Failed,
    /// Cancelled by the user.
    Cancelled,
}

impl JobStatus {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Scheduled => "scheduled",
            Self::Downloading => "downloading",
            Self::Processing => "processing",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a job in this status holds a concurrency ticket.
    pub fn holds_ticket(&self) -> bool {
        matches!(self, Self::Downloading | Self::Processing)
    }

    /// Check whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;

        if next == Cancelled {
            return !self.is_terminal();
        }

        matches!(
            (self, next),
            (Scheduled, Queued)
                | (Queued, Downloading)
                | (Downloading, Processing)
                | (Downloading | Processing, Completed)
                | (Downloading | Processing, Failed)
                | (Downloading | Processing, Retrying)
                | (Retrying, Queued)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One download request and its tracked state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub url: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub options: DownloadOptions,
    pub status: JobStatus,
    /// Percentage in [0, 100]; `None` while the total size is unknown.
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub speed: Option<String>,
    #[serde(default)]
    pub eta: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    /// Backoff deadline while `retrying`.
    #[serde(default)]
    pub resume_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_auto_retry")]
    pub auto_retry: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

fn default_auto_retry() -> bool {
    true
}

impl Job {
    /// Create a job from a validated request.
    ///
    /// The job starts `scheduled` when the request carries a future activation
    /// time, `queued` otherwise.
    pub fn from_request(
        id: impl Into<String>,
        request: DownloadRequest,
        default_max_retries: u32,
        default_auto_retry: bool,
        now: DateTime<Utc>,
    ) -> Self {
        let status = match request.scheduled_time {
            Some(at) if at > now => JobStatus::Scheduled,
            _ => JobStatus::Queued,
        };

        Self {
            id: id.into(),
            url: request.url,
            kind: request.kind,
            options: request.options,
            status,
            progress: None,
            speed: None,
            eta: None,
            created_at: now,
            completed_at: None,
            scheduled_time: request.scheduled_time,
            resume_at: None,
            retry_count: 0,
            max_retries: request.max_retries.unwrap_or(default_max_retries),
            auto_retry: request.auto_retry.unwrap_or(default_auto_retry),
            error: None,
            filename: None,
        }
    }

    /// A job is ready when queued and its activation time (if any) has passed.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.scheduled_time.is_none_or(|at| at <= now)
    }

    /// Check if the job is in a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Admission: `queued -> downloading`, clearing per-attempt fields.
    pub fn begin_attempt(&mut self) {
        self.status = JobStatus::Downloading;
        self.progress = None;
        self.speed = None;
        self.eta = None;
        self.error = None;
        self.resume_at = None;
    }

    /// Record a normalized progress sample.
    ///
    /// Progress never moves backwards within an attempt; a smaller sample
    /// keeps the previous value.
    pub fn record_progress(
        &mut self,
        progress: Option<f64>,
        speed: Option<String>,
        eta: Option<String>,
    ) {
        if let Some(p) = progress {
            let p = p.clamp(0.0, 100.0);
            self.progress = Some(self.progress.map_or(p, |prev| prev.max(p)));
        }
        if speed.is_some() {
            self.speed = speed;
        }
        if eta.is_some() {
            self.eta = eta;
        }
    }

    /// `downloading|processing -> completed`.
    pub fn complete(&mut self, filename: impl Into<String>, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.filename = Some(filename.into());
        self.progress = Some(100.0);
        self.completed_at = Some(now);
        self.speed = None;
        self.eta = None;
        self.error = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn request(url: &str) -> DownloadRequest {
        DownloadRequest::new(url, MediaKind::Video)
    }

    #[test]
    fn test_transition_table() {
        use JobStatus::*;

        assert!(Scheduled.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Downloading));
        assert!(Downloading.can_transition_to(Processing));
        assert!(Downloading.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Retrying));
        assert!(Retrying.can_transition_to(Queued));

        assert!(!Scheduled.can_transition_to(Downloading));
        assert!(!Retrying.can_transition_to(Downloading));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Downloading));
    }

    #[test]
    fn test_cancel_only_from_non_terminal() {
        use JobStatus::*;

        for status in [Queued, Scheduled, Downloading, Processing, Retrying] {
            assert!(status.can_transition_to(Cancelled), "{status}");
        }
        for status in [Completed, Failed, Cancelled] {
            assert!(!status.can_transition_to(Cancelled), "{status}");
            assert!(!status.can_transition_to(Queued), "{status}");
        }
    }

    #[test]
    fn test_from_request_future_schedule() {
        let now = Utc::now();
        let req = request("https://example.com/v").with_scheduled_time(now + Duration::seconds(5));
        let job = Job::from_request("a", req, 3, true, now);

        assert_eq!(job.status, JobStatus::Scheduled);
        assert!(!job.is_ready(now));
    }

    #[test]
    fn test_from_request_past_schedule_is_queued() {
        let now = Utc::now();
        let req = request("https://example.com/v").with_scheduled_time(now - Duration::seconds(5));
        let job = Job::from_request("a", req, 3, true, now);

        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.is_ready(now));
    }

    #[test]
    fn test_progress_is_monotonic_within_attempt() {
        let mut job = Job::from_request("a", request("https://example.com/v"), 3, true, Utc::now());
        job.begin_attempt();

        job.record_progress(Some(40.0), Some("1.0MB/s".into()), None);
        job.record_progress(Some(25.0), None, Some("3s".into()));
        assert_eq!(job.progress, Some(40.0));
        assert_eq!(job.speed.as_deref(), Some("1.0MB/s"));
        assert_eq!(job.eta.as_deref(), Some("3s"));

        job.record_progress(Some(140.0), None, None);
        assert_eq!(job.progress, Some(100.0));
    }

    #[test]
    fn test_begin_attempt_resets_progress() {
        let mut job = Job::from_request("a", request("https://example.com/v"), 3, true, Utc::now());
        job.begin_attempt();
        job.record_progress(Some(70.0), Some("1KB/s".into()), Some("9s".into()));
        job.error = Some("boom".into());

        job.status = JobStatus::Queued;
        job.begin_attempt();
        assert_eq!(job.progress, None);
        assert_eq!(job.speed, None);
        assert_eq!(job.eta, None);
        assert_eq!(job.error, None);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&JobStatus::Downloading).unwrap();
        assert_eq!(json, "\"downloading\"");
    }
}
