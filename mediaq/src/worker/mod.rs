//! Download Worker.
//!
//! Runs one attempt of one job while holding a concurrency ticket. The worker
//! drives the engine future, throttles its progress, mirrors it into the job
//! record and reports the outcome. Every write is a conditional update
//! against the phase the worker believes the job is in, so once a job has
//! been cancelled nothing from the attempt reaches the record or the
//! subscribers.

mod throttle;

pub use throttle::ProgressThrottle;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Error;
use crate::broadcast::EventBroadcaster;
use crate::domain::{Job, JobEvent, JobStatus};
use crate::engine::{
    EngineProgress, EngineRequest, EngineSignal, ExtractionEngine, ExtractionError, ProgressSink,
    format_eta, format_speed,
};
use crate::limiter::Ticket;
use crate::retry::RetrySupervisor;
use crate::store::JobStore;

/// How long a cancelled engine gets to clean up before it is dropped.
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);

type Attempt = Pin<Box<dyn Future<Output = Result<String, ExtractionError>> + Send>>;

/// Per-attempt settings resolved from the configuration.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub progress_throttle: Duration,
    pub stall_timeout: Option<Duration>,
    /// Upper bound on a whole attempt, post-processing included.
    pub download_timeout: Option<Duration>,
    pub download_dir: PathBuf,
    pub output_template: String,
    pub proxy: Option<String>,
}

impl WorkerSettings {
    /// Resolve the engine request for a job; job options override defaults.
    pub fn engine_request(&self, job: &Job) -> EngineRequest {
        let opts = &job.options;
        EngineRequest {
            job_id: job.id.clone(),
            url: job.url.clone(),
            kind: job.kind,
            options: opts.clone(),
            output_dir: opts
                .output_dir
                .clone()
                .unwrap_or_else(|| self.download_dir.clone()),
            output_template: opts
                .output_template
                .clone()
                .unwrap_or_else(|| self.output_template.clone()),
            proxy: opts.proxy.clone().or_else(|| self.proxy.clone()),
        }
    }
}

/// Shared dependencies of all workers.
pub struct WorkerContext {
    pub store: Arc<JobStore>,
    pub broadcaster: Arc<EventBroadcaster>,
    pub engine: Arc<dyn ExtractionEngine>,
    pub supervisor: RetrySupervisor,
    pub settings: WorkerSettings,
}

enum Outcome {
    Finished(Result<String, ExtractionError>),
    /// Watchdog or overall deadline fired; the engine must be stopped.
    Aborted(ExtractionError),
    Cancelled,
    /// The record was cancelled or removed under the worker.
    Superseded,
    /// The record still holds the ticket but in a phase the worker did not
    /// expect.
    OutOfStep { actual: JobStatus, error: Error },
}

/// Run one attempt for `job`, which must already be `downloading`.
///
/// The ticket is released only after the job has left the ticket-holding
/// statuses.
pub async fn run_attempt(
    ctx: Arc<WorkerContext>,
    job: Job,
    ticket: Ticket,
    cancel: CancellationToken,
) {
    let job_id = job.id.clone();
    let request = ctx.settings.engine_request(&job);
    let (sink, mut signals) = ProgressSink::channel();
    let engine_cancel = cancel.child_token();

    info!(
        job_id = %job_id,
        engine = ctx.engine.name(),
        attempt = job.retry_count + 1,
        url = %job.url,
        "Download started"
    );

    let engine = ctx.engine.clone();
    let token = engine_cancel.clone();
    let mut attempt: Attempt = Box::pin(async move { engine.run(request, sink, token).await });

    let mut phase = JobStatus::Downloading;
    let outcome = drive(&ctx, &job_id, &mut phase, &mut attempt, &mut signals, &cancel).await;

    match outcome {
        Outcome::Finished(Ok(filename)) => complete(&ctx, &job_id, phase, filename),
        Outcome::Finished(Err(ExtractionError::Cancelled)) if cancel.is_cancelled() => {
            debug!(job_id = %job_id, "Engine stopped after cancellation");
        }
        Outcome::Finished(Err(e)) => fail(&ctx, &job_id, phase, &e.to_string()),
        Outcome::Aborted(reason) => {
            engine_cancel.cancel();
            wait_for_engine(&job_id, attempt).await;
            fail(&ctx, &job_id, phase, &reason.to_string());
        }
        Outcome::Cancelled => {
            debug!(job_id = %job_id, "Worker cancelled");
            wait_for_engine(&job_id, attempt).await;
        }
        Outcome::Superseded => {
            engine_cancel.cancel();
            wait_for_engine(&job_id, attempt).await;
        }
        Outcome::OutOfStep { actual, error } => {
            warn!(
                job_id = %job_id,
                expected = %phase,
                actual = %actual,
                error = %error,
                "Job record out of step with worker"
            );
            engine_cancel.cancel();
            wait_for_engine(&job_id, attempt).await;
            fail(&ctx, &job_id, actual, &error.to_string());
        }
    }

    drop(ticket);
}

async fn drive(
    ctx: &WorkerContext,
    job_id: &str,
    phase: &mut JobStatus,
    attempt: &mut Attempt,
    signals: &mut mpsc::UnboundedReceiver<EngineSignal>,
    cancel: &CancellationToken,
) -> Outcome {
    let mut throttle = ProgressThrottle::new(ctx.settings.progress_throttle);
    let started = Instant::now();
    let mut last_activity = started;
    let timeout_at = ctx
        .settings
        .download_timeout
        .map(|timeout| (started + timeout, timeout));

    loop {
        let flush_at = throttle.deadline();
        // Post-processing reports nothing, so the watchdog only covers transfers.
        let stall_at = ctx
            .settings
            .stall_timeout
            .filter(|_| *phase == JobStatus::Downloading)
            .map(|timeout| (last_activity + timeout, timeout));

        tokio::select! {
            biased;

            _ = cancel.cancelled() => return Outcome::Cancelled,

            result = attempt.as_mut() => return Outcome::Finished(result),

            Some(signal) = signals.recv() => {
                last_activity = Instant::now();
                match signal {
                    EngineSignal::Progress(progress) => throttle.push(progress, last_activity),
                    EngineSignal::PostProcessing if *phase == JobStatus::Processing => {}
                    EngineSignal::PostProcessing => {
                        if let Some(progress) = throttle.flush()
                            && let Err(e) = emit_progress(ctx, job_id, *phase, &progress)
                        {
                            return refused(ctx, job_id, e);
                        }
                        if let Err(e) = enter_processing(ctx, job_id) {
                            return refused(ctx, job_id, e);
                        }
                        *phase = JobStatus::Processing;
                    }
                }
            }

            _ = sleep_until_opt(flush_at) => {
                if let Some(progress) = throttle.poll(Instant::now())
                    && let Err(e) = emit_progress(ctx, job_id, *phase, &progress)
                {
                    return refused(ctx, job_id, e);
                }
            }

            _ = sleep_until_opt(stall_at.map(|(at, _)| at)) => {
                if let Some((_, timeout)) = stall_at {
                    warn!(job_id = %job_id, timeout_secs = timeout.as_secs(), "Download stalled");
                    return Outcome::Aborted(ExtractionError::Stalled(timeout));
                }
            }

            _ = sleep_until_opt(timeout_at.map(|(at, _)| at)) => {
                if let Some((_, timeout)) = timeout_at {
                    warn!(job_id = %job_id, timeout_secs = timeout.as_secs(), "Download timed out");
                    return Outcome::Aborted(ExtractionError::TimedOut(timeout));
                }
            }
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Classify a refused conditional write.
fn refused(ctx: &WorkerContext, job_id: &str, error: Error) -> Outcome {
    match ctx.store.get(job_id) {
        Some(job) if job.status.holds_ticket() => Outcome::OutOfStep {
            actual: job.status,
            error,
        },
        _ => {
            debug!(job_id = %job_id, error = %error, "Attempt superseded");
            Outcome::Superseded
        }
    }
}

/// Mirror a progress sample into the record and publish it.
fn emit_progress(
    ctx: &WorkerContext,
    job_id: &str,
    phase: JobStatus,
    progress: &EngineProgress,
) -> crate::Result<()> {
    let percent = progress.percent();
    let speed = progress.rate.and_then(format_speed);
    let eta = progress.eta.and_then(format_eta);

    let job = ctx.store.update(job_id, Some(phase), |job| {
        job.record_progress(percent, speed, eta);
        Ok(())
    })?;
    ctx.broadcaster.publish(JobEvent::progress(&job));
    Ok(())
}

fn enter_processing(ctx: &WorkerContext, job_id: &str) -> crate::Result<()> {
    let job = ctx.store.update(job_id, Some(JobStatus::Downloading), |job| {
        job.status = JobStatus::Processing;
        job.speed = None;
        job.eta = None;
        Ok(())
    })?;
    debug!(job_id = %job_id, "Post-processing");
    ctx.broadcaster.publish(JobEvent::status(&job));
    Ok(())
}

fn complete(ctx: &WorkerContext, job_id: &str, phase: JobStatus, filename: String) {
    match ctx.store.update(job_id, Some(phase), |job| {
        job.complete(filename.clone(), Utc::now());
        Ok(())
    }) {
        Ok(job) => {
            info!(job_id = %job_id, filename = %filename, "Download completed");
            ctx.broadcaster.publish(JobEvent::completed(&job));
        }
        Err(e) => debug!(job_id = %job_id, error = %e, "Dropping late completion"),
    }
}

fn fail(ctx: &WorkerContext, job_id: &str, phase: JobStatus, error: &str) {
    match ctx
        .supervisor
        .handle_failure(&ctx.store, job_id, phase, error, Utc::now())
    {
        Ok(job) => {
            ctx.broadcaster.publish(JobEvent::for_transition(&job));
        }
        Err(e) => debug!(job_id = %job_id, error = %e, "Dropping late failure"),
    }
}

async fn wait_for_engine(job_id: &str, attempt: Attempt) {
    if tokio::time::timeout(CANCEL_GRACE, attempt).await.is_err() {
        warn!(job_id = %job_id, "Engine ignored cancellation, dropping it");
    }
}
