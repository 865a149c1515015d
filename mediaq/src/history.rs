//! History Persister.
//!
//! Snapshots terminal jobs (plus dormant `scheduled` ones) to a JSON array,
//! newest first, using write-to-temp-then-rename so a crash mid-write never
//! corrupts the durable copy. On startup the snapshot repopulates the store.
//! Persistence failures are logged and retried on the next cycle; the
//! in-memory store stays authoritative.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::{Job, JobStatus};
use crate::store::JobStore;
use crate::utils::fs::write_atomic;
use crate::{Error, Result};

/// Error recorded on jobs that were running when the process stopped.
pub const INTERRUPTED_ERROR: &str = "interrupted by restart";

/// Durable snapshot of finished jobs.
#[derive(Debug, Clone)]
pub struct HistoryPersister {
    path: PathBuf,
    max_size: usize,
    save_requested: Arc<Notify>,
}

impl HistoryPersister {
    pub fn new(path: impl Into<PathBuf>, max_size: usize) -> Self {
        Self {
            path: path.into(),
            max_size,
            save_requested: Arc::new(Notify::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the snapshot. A missing file is an empty history.
    pub async fn load(&self) -> Result<Vec<Job>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(Error::persistence(format!(
                    "read {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        serde_json::from_slice(&bytes).map_err(|e| {
            Error::persistence(format!("parse {}: {}", self.path.display(), e))
        })
    }

    /// Load the snapshot into `store`. Returns the number of restored jobs.
    ///
    /// Scheduled jobs are re-armed. Anything else that was not terminal was
    /// interrupted mid-flight and is restored as `failed`.
    pub async fn restore_into(&self, store: &JobStore) -> Result<usize> {
        let jobs = self.load().await?;
        let mut restored = 0;

        for mut job in jobs {
            if !job.is_terminal() && job.status != JobStatus::Scheduled {
                job.status = JobStatus::Failed;
                job.error = Some(INTERRUPTED_ERROR.to_string());
                job.speed = None;
                job.eta = None;
                job.resume_at = None;
            }
            job.retry_count = job.retry_count.min(job.max_retries);

            let id = job.id.clone();
            match store.create(job) {
                Ok(_) => restored += 1,
                Err(e) => debug!(job_id = %id, error = %e, "Skipping history entry"),
            }
        }

        info!(count = restored, path = %self.path.display(), "Restored download history");
        Ok(restored)
    }

    /// Write the snapshot, pruning the oldest terminal jobs beyond the limit
    /// from both the snapshot and the store. Returns the number of saved jobs.
    pub async fn save(&self, store: &JobStore) -> Result<usize> {
        let mut jobs =
            store.list_where(|job| job.is_terminal() || job.status == JobStatus::Scheduled);
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        let terminal_count = jobs.iter().filter(|j| j.is_terminal()).count();
        if terminal_count > self.max_size {
            let mut excess = terminal_count - self.max_size;
            // Walk from the oldest end, dropping terminal jobs only.
            let mut keep = vec![true; jobs.len()];
            for (i, job) in jobs.iter().enumerate().rev() {
                if excess == 0 {
                    break;
                }
                if job.is_terminal() {
                    keep[i] = false;
                    excess -= 1;
                }
            }

            let mut pruned = 0;
            let mut kept = Vec::with_capacity(jobs.len());
            for (job, keep) in jobs.into_iter().zip(keep) {
                if keep {
                    kept.push(job);
                } else {
                    // Terminal jobs never transition again.
                    store.delete(&job.id);
                    pruned += 1;
                }
            }
            jobs = kept;
            debug!(pruned, max = self.max_size, "Pruned oldest history entries");
        }

        self.write(&jobs).await?;
        Ok(jobs.len())
    }

    /// Remove every terminal job from the store and rewrite the snapshot.
    /// Active jobs are never touched. Returns the number of removed jobs.
    pub async fn clear(&self, store: &JobStore) -> Result<usize> {
        let removed = store.delete_where(Job::is_terminal);
        info!(count = removed.len(), "Cleared download history");
        self.save(store).await?;
        Ok(removed.len())
    }

    /// Ask the background loop to save soon.
    pub fn request_save(&self) {
        self.save_requested.notify_one();
    }

    /// Save every `interval` and whenever a save is requested, until `cancel`
    /// fires. The final save on shutdown is the caller's.
    pub async fn run(self, store: Arc<JobStore>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.save_requested.notified() => {}
            }
            self.save_logged(&store).await;
        }

        debug!("History loop stopped");
    }

    /// Save and log failures instead of returning them.
    pub async fn save_logged(&self, store: &JobStore) {
        match self.save(store).await {
            Ok(count) => debug!(count, "Saved download history"),
            Err(e) => warn!(
                error = %e,
                path = %self.path.display(),
                "Failed to save download history"
            ),
        }
    }

    async fn write(&self, jobs: &[Job]) -> Result<()> {
        let json = serde_json::to_vec_pretty(jobs)?;
        write_atomic(&self.path, &json)
            .await
            .map_err(|e| Error::persistence(format!("save {}: {}", self.path.display(), e)))
    }
}
