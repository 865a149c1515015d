//! Orchestrator.
//!
//! The command surface of the download service. It validates submissions,
//! records jobs in the store, admits ready jobs under the concurrency bound,
//! hands them to workers, drives the scheduler and history loops and fans
//! every change out to subscribers.
//!
//! Admission is the only place tickets are taken. It runs whenever capacity
//! may have freed or a job may have become ready: after a submission, after
//! each scheduler tick and after each worker ends.
//!
//! When enabled, a background loop also asks the engine to update itself at
//! a fixed interval.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcast::{EventBroadcaster, Subscription};
use crate::config::Config;
use crate::domain::request::validate_url;
use crate::domain::{DownloadRequest, Job, JobEvent, JobStatus};
use crate::engine::{ExtractionEngine, MediaInfo, YtDlpEngine};
use crate::history::HistoryPersister;
use crate::limiter::ConcurrencyLimiter;
use crate::retry::RetrySupervisor;
use crate::scheduler::Scheduler;
use crate::store::JobStore;
use crate::worker::{self, WorkerContext, WorkerSettings};
use crate::{Error, Result};

/// Cancellation handle of a running attempt.
struct ActiveAttempt {
    seq: u64,
    token: CancellationToken,
}

struct Inner {
    config: Config,
    store: Arc<JobStore>,
    limiter: ConcurrencyLimiter,
    broadcaster: Arc<EventBroadcaster>,
    scheduler: Scheduler,
    history: HistoryPersister,
    workers: Arc<WorkerContext>,
    active: DashMap<String, ActiveAttempt>,
    attempt_seq: AtomicU64,
    /// Serializes admission passes so tickets and candidates pair up.
    admission: Mutex<()>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
}

/// Download orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Create an orchestrator around `engine`.
    pub fn new(config: Config, engine: Arc<dyn ExtractionEngine>) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(JobStore::new());
        let broadcaster = Arc::new(EventBroadcaster::new(config.subscriber_buffer));
        let workers = Arc::new(WorkerContext {
            store: store.clone(),
            broadcaster: broadcaster.clone(),
            engine,
            supervisor: RetrySupervisor::new(config.retry.clone()),
            settings: WorkerSettings {
                progress_throttle: config.progress_throttle,
                stall_timeout: config.stall_timeout,
                download_timeout: config.download_timeout,
                download_dir: config.download_dir.clone(),
                output_template: config.output_template.clone(),
                proxy: config.proxy.clone(),
            },
        });

        let inner = Inner {
            limiter: ConcurrencyLimiter::new(config.max_concurrent_downloads),
            scheduler: Scheduler::new(store.clone()),
            history: HistoryPersister::new(config.history_file.clone(), config.max_history_size),
            store,
            broadcaster,
            workers,
            active: DashMap::new(),
            attempt_seq: AtomicU64::new(0),
            admission: Mutex::new(()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Create an orchestrator backed by yt-dlp.
    pub fn with_ytdlp(config: Config) -> Result<Self> {
        let engine = YtDlpEngine::new(config.ytdlp());
        Self::new(config, Arc::new(engine))
    }

    /// Restore history and start the background loops. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(e) = self.inner.history.restore_into(&self.inner.store).await {
            warn!(error = %e, "Failed to restore download history");
        }

        let this = self.clone();
        self.inner.tracker.spawn(async move { this.run_scheduler().await });

        self.inner.tracker.spawn(self.inner.history.clone().run(
            self.inner.store.clone(),
            self.inner.config.history_save_interval,
            self.inner.shutdown.child_token(),
        ));

        if self.inner.config.ytdlp_auto_update {
            let this = self.clone();
            let cancel = self.inner.shutdown.child_token();
            self.inner
                .tracker
                .spawn(async move { this.run_updater(cancel).await });
        }

        let engine = &self.inner.workers.engine;
        info!(
            engine = engine.name(),
            version = engine.version().as_deref().unwrap_or("unknown"),
            max_concurrent = self.inner.limiter.capacity(),
            history = %self.inner.history.path().display(),
            "Orchestrator started"
        );

        self.admit_ready();
        Ok(())
    }

    /// Validate and enqueue a request. Returns the new job id.
    pub fn submit(&self, request: DownloadRequest) -> Result<String> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::Other("orchestrator is shutting down".to_string()));
        }

        request.validate()?;
        self.inner
            .workers
            .engine
            .check_request(&request)
            .map_err(Error::Validation)?;

        let id = Uuid::new_v4().to_string();
        let job = Job::from_request(
            id.clone(),
            request,
            self.inner.config.retry.max_retries,
            self.inner.config.auto_retry,
            Utc::now(),
        );
        let job = self.inner.store.create(job)?;

        info!(
            job_id = %id,
            url = %job.url,
            kind = ?job.kind,
            status = %job.status,
            "Job submitted"
        );
        self.inner.broadcaster.publish(JobEvent::status(&job));

        match job.status {
            JobStatus::Queued => self.admit_ready(),
            // Persisted so the schedule survives a restart.
            JobStatus::Scheduled => self.inner.history.request_save(),
            _ => {}
        }
        Ok(id)
    }

    pub fn get(&self, job_id: &str) -> Result<Job> {
        self.inner
            .store
            .get(job_id)
            .ok_or_else(|| Error::not_found("Job", job_id))
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Vec<Job> {
        self.inner.store.list()
    }

    /// Cancel a job that has not finished yet.
    ///
    /// The record turns `cancelled` immediately; a running engine is told to
    /// stop and its ticket returns once it has.
    pub fn cancel(&self, job_id: &str) -> Result<Job> {
        let job = self.inner.store.update(job_id, None, |job| {
            if job.is_terminal() {
                return Err(Error::AlreadyTerminal {
                    id: job.id.clone(),
                    status: job.status,
                });
            }
            job.status = JobStatus::Cancelled;
            job.completed_at = Some(Utc::now());
            job.speed = None;
            job.eta = None;
            job.resume_at = None;
            Ok(())
        })?;

        if let Some((_, attempt)) = self.inner.active.remove(job_id) {
            attempt.token.cancel();
        }

        info!(job_id = %job_id, "Job cancelled");
        self.inner.broadcaster.publish(JobEvent::status(&job));
        self.inner.history.request_save();
        Ok(job)
    }

    /// Remove every finished job from memory and disk. Active jobs stay.
    pub async fn clear_history(&self) -> Result<usize> {
        self.inner.history.clear(&self.inner.store).await
    }

    /// Describe `url` without downloading it. Results are cached per URL.
    pub async fn media_info(&self, url: &str) -> Result<Arc<MediaInfo>> {
        validate_url(url)?;
        let info = self
            .inner
            .workers
            .engine
            .media_info(url.trim(), self.inner.config.proxy.as_deref())
            .await?;
        Ok(info)
    }

    /// Subscribe to live job events.
    pub fn subscribe(&self) -> Subscription {
        self.inner.broadcaster.subscribe()
    }

    /// Number of tickets currently held.
    pub fn active_count(&self) -> usize {
        self.inner.limiter.in_use()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Stop the loops, cancel running attempts and save history one last time.
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();

        let timeout = self.inner.config.shutdown_timeout;
        if tokio::time::timeout(timeout, self.inner.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                timeout_secs = timeout.as_secs(),
                "Timed out waiting for workers to stop"
            );
        }

        self.inner.history.save_logged(&self.inner.store).await;
        info!("Orchestrator stopped");
    }

    async fn run_scheduler(self) {
        let mut ticker = tokio::time::interval(self.inner.config.scheduler_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for job in self.inner.scheduler.promote_due(Utc::now()) {
                self.inner.broadcaster.publish(JobEvent::status(&job));
            }
            self.admit_ready();
        }

        debug!("Scheduler loop stopped");
    }

    /// Ask the engine to update itself every `ytdlp_update_interval`,
    /// starting immediately.
    async fn run_updater(self, cancel: CancellationToken) {
        let engine = self.inner.workers.engine.clone();
        let mut ticker = tokio::time::interval(self.inner.config.ytdlp_update_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                result = engine.self_update() => result,
            };
            match result {
                Ok(Some(version)) => {
                    info!(engine = engine.name(), version = %version, "Engine updated")
                }
                Ok(None) => debug!(engine = engine.name(), "Engine already up to date"),
                Err(e) => warn!(engine = engine.name(), error = %e, "Engine update failed"),
            }
        }

        debug!("Updater loop stopped");
    }

    /// Pair free tickets with the oldest ready jobs and start workers.
    fn admit_ready(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let _admission = self.inner.admission.lock();

        loop {
            let Some(ticket) = self.inner.limiter.try_acquire() else {
                break;
            };
            let Some(candidate) = self.inner.store.oldest_ready(Utc::now()) else {
                break;
            };

            // Registered before the transition so a cancel that lands right
            // after it always finds the token.
            let seq = self.inner.attempt_seq.fetch_add(1, Ordering::Relaxed);
            let token = self.inner.shutdown.child_token();
            self.inner.active.insert(
                candidate.id.clone(),
                ActiveAttempt {
                    seq,
                    token: token.clone(),
                },
            );

            let job = match self
                .inner
                .store
                .update(&candidate.id, Some(JobStatus::Queued), |job| {
                    job.begin_attempt();
                    Ok(())
                }) {
                Ok(job) => job,
                Err(e) => {
                    self.inner.active.remove_if(&candidate.id, |_, a| a.seq == seq);
                    debug!(job_id = %candidate.id, error = %e, "Admission lost the race");
                    continue;
                }
            };

            debug!(
                job_id = %job.id,
                in_use = self.inner.limiter.in_use(),
                queued = self.inner.store.count_status(JobStatus::Queued),
                "Job admitted"
            );
            self.inner.broadcaster.publish(JobEvent::status(&job));

            let this = self.clone();
            self.inner.tracker.spawn(async move {
                let job_id = job.id.clone();
                worker::run_attempt(this.inner.workers.clone(), job, ticket, token).await;

                this.inner.active.remove_if(&job_id, |_, a| a.seq == seq);
                if this
                    .inner
                    .store
                    .get(&job_id)
                    .is_some_and(|job| job.is_terminal())
                {
                    this.inner.history.request_save();
                }
                this.admit_ready();
            });
        }
    }
}
