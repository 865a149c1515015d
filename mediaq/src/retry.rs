//! Retry Supervisor.
//!
//! Decides, on a failed attempt, whether a job is parked in `retrying` with an
//! exponential backoff or declared permanently `failed`. The decision and the
//! status change happen inside one conditional store update, so a job that
//! was cancelled while its engine was failing stays cancelled.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::{Job, JobStatus};
use crate::store::JobStore;
use crate::{Error, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Default retry ceiling for jobs that do not set their own.
    pub max_retries: u32,
    /// Base delay in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay in milliseconds.
    pub max_delay_ms: u64,
    /// Whether to add up to 25% jitter to delays.
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 300_000,
            use_jitter: false,
        }
    }
}

impl RetryConfig {
    /// Backoff for the given retry number: `base * 2^retry`, capped.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let factor = 1u64.checked_shl(retry.min(63)).unwrap_or(u64::MAX);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);

        let final_delay = if self.use_jitter {
            let jitter = (delay_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            delay_ms.saturating_add(jitter)
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay)
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Park the job and retry after `delay`; `retry` is the new retry count.
    RetryAfter { retry: u32, delay: Duration },
    /// Retries exhausted or disabled.
    GiveUp,
}

/// Routes failed attempts to `retrying` or `failed`.
#[derive(Debug, Clone)]
pub struct RetrySupervisor {
    config: RetryConfig,
}

impl RetrySupervisor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Decide what to do with a failed job.
    pub fn decide(&self, job: &Job) -> RetryDecision {
        if job.auto_retry && job.retry_count < job.max_retries {
            let retry = job.retry_count + 1;
            RetryDecision::RetryAfter {
                retry,
                delay: self.config.delay_for_retry(retry),
            }
        } else {
            RetryDecision::GiveUp
        }
    }

    /// Record a failed attempt for a job currently in `phase`.
    ///
    /// Returns the updated job, or [`Error::Conflict`] if the job left
    /// `phase` in the meantime (typically because it was cancelled).
    pub fn handle_failure(
        &self,
        store: &JobStore,
        job_id: &str,
        phase: JobStatus,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let mut decision = RetryDecision::GiveUp;

        let job = store.update(job_id, Some(phase), |job| {
            decision = self.decide(job);
            job.error = Some(error.to_string());
            job.speed = None;
            job.eta = None;

            match decision {
                RetryDecision::RetryAfter { retry, delay } => {
                    let delay = chrono::Duration::from_std(delay)
                        .map_err(|e| Error::Other(format!("backoff out of range: {e}")))?;
                    job.retry_count = retry;
                    job.status = JobStatus::Retrying;
                    job.resume_at = Some(now + delay);
                }
                RetryDecision::GiveUp => {
                    job.status = JobStatus::Failed;
                    job.resume_at = None;
                }
            }
            Ok(())
        })?;

        match decision {
            RetryDecision::RetryAfter { retry, delay } => info!(
                job_id = %job_id,
                retry,
                max_retries = job.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Attempt failed, retry scheduled"
            ),
            RetryDecision::GiveUp => warn!(
                job_id = %job_id,
                retries = job.retry_count,
                error = %error,
                "Job failed permanently"
            ),
        }

        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DownloadRequest, MediaKind};

    fn config() -> RetryConfig {
        RetryConfig {
            max_retries: 2,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            use_jitter: false,
        }
    }

    fn downloading_job(store: &JobStore, id: &str, max_retries: u32, auto_retry: bool) {
        let request = DownloadRequest::new("https://example.com/v", MediaKind::Video)
            .with_max_retries(max_retries)
            .with_auto_retry(auto_retry);
        store
            .create(Job::from_request(id, request, 3, true, Utc::now()))
            .unwrap();
        store
            .update(id, None, |job| {
                job.begin_attempt();
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_delay_calculation() {
        let config = config();
        assert_eq!(config.delay_for_retry(0), Duration::from_millis(1000));
        assert_eq!(config.delay_for_retry(1), Duration::from_millis(2000));
        assert_eq!(config.delay_for_retry(2), Duration::from_millis(4000));
        assert_eq!(config.delay_for_retry(3), Duration::from_millis(8000));
        // Capped at max
        assert_eq!(config.delay_for_retry(4), Duration::from_millis(10_000));
        assert_eq!(config.delay_for_retry(200), Duration::from_millis(10_000));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let config = RetryConfig {
            use_jitter: true,
            ..config()
        };
        for _ in 0..32 {
            let delay = config.delay_for_retry(1);
            assert!(delay >= Duration::from_millis(2000));
            assert!(delay <= Duration::from_millis(2500));
        }
    }

    #[test]
    fn test_retry_then_give_up() {
        let store = JobStore::new();
        let supervisor = RetrySupervisor::new(config());
        downloading_job(&store, "a", 2, true);
        let now = Utc::now();

        let job = supervisor
            .handle_failure(&store, "a", JobStatus::Downloading, "HTTP Error 500", now)
            .unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.retry_count, 1);
        assert_eq!(job.resume_at, Some(now + chrono::Duration::milliseconds(2000)));
        assert_eq!(job.error.as_deref(), Some("HTTP Error 500"));

        store
            .update("a", None, |job| {
                job.status = JobStatus::Queued;
                Ok(())
            })
            .unwrap();
        store
            .update("a", None, |job| {
                job.begin_attempt();
                Ok(())
            })
            .unwrap();
        let job = supervisor
            .handle_failure(&store, "a", JobStatus::Downloading, "again", now)
            .unwrap();
        assert_eq!(job.status, JobStatus::Retrying);
        assert_eq!(job.retry_count, 2);

        store
            .update("a", None, |job| {
                job.status = JobStatus::Queued;
                Ok(())
            })
            .unwrap();
        store
            .update("a", None, |job| {
                job.begin_attempt();
                Ok(())
            })
            .unwrap();
        let job = supervisor
            .handle_failure(&store, "a", JobStatus::Downloading, "final", now)
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 2);
        assert_eq!(job.error.as_deref(), Some("final"));
    }

    #[test]
    fn test_auto_retry_disabled_fails_immediately() {
        let store = JobStore::new();
        let supervisor = RetrySupervisor::new(config());
        downloading_job(&store, "a", 3, false);

        let job = supervisor
            .handle_failure(&store, "a", JobStatus::Downloading, "boom", Utc::now())
            .unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.retry_count, 0);
    }

    #[test]
    fn test_failure_after_cancel_conflicts() {
        let store = JobStore::new();
        let supervisor = RetrySupervisor::new(config());
        downloading_job(&store, "a", 2, true);
        store
            .update("a", None, |job| {
                job.status = JobStatus::Cancelled;
                Ok(())
            })
            .unwrap();

        let err = supervisor
            .handle_failure(&store, "a", JobStatus::Downloading, "boom", Utc::now())
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.get("a").unwrap().status, JobStatus::Cancelled);
    }
}
