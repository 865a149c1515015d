//! Scheduler.
//!
//! Time-triggered promotions only: `scheduled` jobs whose activation time has
//! arrived and `retrying` jobs whose backoff has elapsed move to `queued`.
//! The orchestrator drives [`Scheduler::promote_due`] from its tick loop and
//! runs an admission pass afterwards.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::domain::{Job, JobStatus};
use crate::store::JobStore;

/// Promotes due jobs to `queued`.
pub struct Scheduler {
    store: Arc<JobStore>,
}

impl Scheduler {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self { store }
    }

    /// Promote every due job at `now`. Returns the promoted jobs.
    pub fn promote_due(&self, now: DateTime<Utc>) -> Vec<Job> {
        let due = self.store.list_where(|job| is_due(job, now));
        let mut promoted = Vec::with_capacity(due.len());

        for job in due {
            let from = job.status;
            match self.store.update(&job.id, Some(from), |job| {
                job.status = JobStatus::Queued;
                job.resume_at = None;
                Ok(())
            }) {
                Ok(job) => {
                    match from {
                        JobStatus::Scheduled => {
                            info!(job_id = %job.id, "Scheduled job activated")
                        }
                        _ => info!(
                            job_id = %job.id,
                            attempt = job.retry_count + 1,
                            "Retry backoff elapsed, job re-queued"
                        ),
                    }
                    promoted.push(job);
                }
                Err(e) => {
                    // Cancelled between the scan and the update.
                    debug!(job_id = %job.id, error = %e, "Skipped promotion");
                }
            }
        }

        promoted
    }
}

fn is_due(job: &Job, now: DateTime<Utc>) -> bool {
    match job.status {
        JobStatus::Scheduled => job.scheduled_time.is_none_or(|at| at <= now),
        JobStatus::Retrying => job.resume_at.is_none_or(|at| at <= now),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DownloadRequest, MediaKind};
    use chrono::Duration;

    fn store_with_scheduled(at: DateTime<Utc>, now: DateTime<Utc>) -> Arc<JobStore> {
        let store = Arc::new(JobStore::new());
        let request =
            DownloadRequest::new("https://example.com/v", MediaKind::Video).with_scheduled_time(at);
        store
            .create(Job::from_request("s", request, 2, true, now))
            .unwrap();
        store
    }

    #[test]
    fn test_scheduled_job_waits_for_its_time() {
        let now = Utc::now();
        let store = store_with_scheduled(now + Duration::seconds(5), now);
        let scheduler = Scheduler::new(store.clone());

        assert!(scheduler.promote_due(now).is_empty());
        assert!(scheduler.promote_due(now + Duration::seconds(4)).is_empty());
        assert_eq!(store.get("s").unwrap().status, JobStatus::Scheduled);

        let promoted = scheduler.promote_due(now + Duration::seconds(5));
        assert_eq!(promoted.len(), 1);
        let job = store.get("s").unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.is_ready(now + Duration::seconds(5)));
    }

    #[test]
    fn test_retrying_job_requeued_after_resume_at() {
        let now = Utc::now();
        let store = Arc::new(JobStore::new());
        store
            .create(Job::from_request(
                "r",
                DownloadRequest::new("https://example.com/v", MediaKind::Video),
                2,
                true,
                now,
            ))
            .unwrap();
        store
            .update("r", None, |job| {
                job.begin_attempt();
                Ok(())
            })
            .unwrap();
        store
            .update("r", None, |job| {
                job.status = JobStatus::Retrying;
                job.retry_count = 1;
                job.resume_at = Some(now + Duration::seconds(2));
                Ok(())
            })
            .unwrap();

        let scheduler = Scheduler::new(store.clone());
        assert!(scheduler.promote_due(now + Duration::seconds(1)).is_empty());

        let promoted = scheduler.promote_due(now + Duration::seconds(2));
        assert_eq!(promoted.len(), 1);
        let job = store.get("r").unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.resume_at, None);
        assert_eq!(job.retry_count, 1);
    }

    #[test]
    fn test_cancelled_scheduled_job_is_not_promoted() {
        let now = Utc::now();
        let store = store_with_scheduled(now + Duration::seconds(1), now);
        store
            .update("s", None, |job| {
                job.status = JobStatus::Cancelled;
                Ok(())
            })
            .unwrap();

        let scheduler = Scheduler::new(store.clone());
        assert!(scheduler.promote_due(now + Duration::seconds(10)).is_empty());
        assert_eq!(store.get("s").unwrap().status, JobStatus::Cancelled);
    }
}
