//! End-to-end orchestrator scenarios against a scripted engine.
//!
//! These run in real time: activation and backoff times are wall-clock
//! timestamps, so the intervals below are kept short.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use mediaq::domain::{DownloadRequest, EventType, JobEvent, JobStatus, MediaKind};
use mediaq::engine::{EngineProgress, EngineRequest, ExtractionEngine, ExtractionError, ProgressSink};
use mediaq::retry::RetryConfig;
use mediaq::{Config, Error, Orchestrator, Subscription};

/// What the scripted engine does for a URL, chosen by its path.
#[derive(Debug, Clone, Copy)]
enum Script {
    /// Sleep, then succeed.
    Succeed(Duration),
    /// Fail right away.
    Fail,
    /// Report a burst of progress, hold, then succeed.
    Burst { samples: u64, gap: Duration, hold: Duration },
    /// Run until cancelled.
    Block,
    /// Ignore cancellation and succeed after the delay.
    Stubborn(Duration),
}

impl Script {
    fn for_url(url: &str) -> Self {
        let path = url.rsplit('/').next().unwrap_or_default();
        match path {
            "fail" => Self::Fail,
            "burst" => Self::Burst {
                samples: 10,
                gap: Duration::from_millis(5),
                hold: Duration::from_millis(600),
            },
            "block" => Self::Block,
            "stubborn" => Self::Stubborn(Duration::from_millis(300)),
            _ => Self::Succeed(Duration::from_millis(150)),
        }
    }
}

#[derive(Default)]
struct ScriptedEngine {
    running: AtomicUsize,
    peak: AtomicUsize,
    starts: Mutex<Vec<String>>,
}

impl ScriptedEngine {
    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn starts(&self) -> Vec<String> {
        self.starts.lock().clone()
    }

    fn start_count(&self, job_id: &str) -> usize {
        self.starts.lock().iter().filter(|id| *id == job_id).count()
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExtractionEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(
        &self,
        request: EngineRequest,
        sink: ProgressSink,
        cancel: CancellationToken,
    ) -> Result<String, ExtractionError> {
        self.starts.lock().push(request.job_id.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _running = RunningGuard(&self.running);

        let output = format!("/downloads/{}.mp4", request.job_id);
        match Script::for_url(&request.url) {
            Script::Succeed(delay) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ExtractionError::Cancelled),
                    _ = tokio::time::sleep(delay) => Ok(output),
                }
            }
            Script::Fail => Err(ExtractionError::failed("ERROR: Video unavailable")),
            Script::Burst { samples, gap, hold } => {
                for i in 1..=samples {
                    sink.report(EngineProgress {
                        transferred: i * 10,
                        total: Some(samples * 10),
                        rate: Some(1024.0 * 1024.0),
                        eta: Some(samples - i),
                    });
                    tokio::time::sleep(gap).await;
                }
                tokio::time::sleep(hold).await;
                Ok(output)
            }
            Script::Block => {
                cancel.cancelled().await;
                Err(ExtractionError::Cancelled)
            }
            Script::Stubborn(delay) => {
                tokio::time::sleep(delay).await;
                Ok(output)
            }
        }
    }

    fn is_available(&self) -> bool {
        true
    }

    fn version(&self) -> Option<String> {
        Some("scripted 1.0".into())
    }
}

struct Harness {
    orchestrator: Orchestrator,
    engine: Arc<ScriptedEngine>,
    events: Subscription,
    _dir: TempDir,
}

impl Harness {
    async fn start(configure: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config {
            download_dir: dir.path().join("downloads"),
            history_file: dir.path().join("history.json"),
            scheduler_interval: Duration::from_millis(20),
            progress_throttle: Duration::from_millis(250),
            subscriber_buffer: 1024,
            retry: RetryConfig {
                max_retries: 3,
                base_delay_ms: 20,
                max_delay_ms: 50,
                use_jitter: false,
            },
            ..Config::default()
        };
        configure(&mut config);

        let engine = Arc::new(ScriptedEngine::default());
        let orchestrator = Orchestrator::new(config, engine.clone()).unwrap();
        let events = orchestrator.subscribe();
        orchestrator.start().await.unwrap();

        Self {
            orchestrator,
            engine,
            events,
            _dir: dir,
        }
    }

    fn submit(&self, path: &str) -> String {
        self.orchestrator.submit(request(path)).unwrap()
    }

    fn status(&self, id: &str) -> JobStatus {
        self.orchestrator.get(id).unwrap().status
    }

    async fn wait_for(&self, what: &str, cond: impl Fn(&Orchestrator) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while !cond(&self.orchestrator) {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_status(&self, id: &str, status: JobStatus) {
        let id = id.to_string();
        self.wait_for(&format!("{id} to be {status}"), move |o| {
            o.get(&id).is_ok_and(|job| job.status == status)
        })
        .await;
    }

    fn drain(&mut self) -> Vec<JobEvent> {
        std::iter::from_fn(|| self.events.try_recv()).collect()
    }
}

fn request(path: &str) -> DownloadRequest {
    DownloadRequest::new(format!("https://media.example.com/{path}"), MediaKind::Video)
}

fn events_for<'a>(events: &'a [JobEvent], id: &str) -> Vec<&'a JobEvent> {
    events.iter().filter(|e| e.job_id == id).collect()
}

#[tokio::test]
async fn test_five_jobs_run_three_at_a_time_in_submission_order() {
    let mut h = Harness::start(|c| c.max_concurrent_downloads = 3).await;

    let ids: Vec<String> = (0..5).map(|i| h.submit(&format!("video-{i}"))).collect();

    assert_eq!(h.orchestrator.active_count(), 3);
    assert_eq!(h.status(&ids[3]), JobStatus::Queued);
    assert_eq!(h.status(&ids[4]), JobStatus::Queued);

    h.wait_for("all jobs to complete", |o| {
        o.list().iter().all(|j| j.status == JobStatus::Completed)
    })
    .await;

    assert!(h.engine.peak() <= 3, "peak concurrency {}", h.engine.peak());
    assert_eq!(h.engine.starts(), ids);
    h.wait_for("tickets to be released", |o| o.active_count() == 0).await;

    let events = h.drain();
    for id in &ids {
        let job = h.orchestrator.get(id).unwrap();
        assert_eq!(job.progress, Some(100.0));
        assert_eq!(job.filename.as_deref(), Some(format!("/downloads/{id}.mp4").as_str()));

        let last = events_for(&events, id).last().copied().unwrap();
        assert_eq!(last.event_type, EventType::Completed);
    }

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_failing_job_retries_then_fails_for_good() {
    let mut h = Harness::start(|_| {}).await;

    let id = h
        .orchestrator
        .submit(request("fail").with_max_retries(2))
        .unwrap();
    h.wait_status(&id, JobStatus::Failed).await;

    let job = h.orchestrator.get(&id).unwrap();
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.error.as_deref(), Some("ERROR: Video unavailable"));
    assert_eq!(h.engine.start_count(&id), 3);

    let events = h.drain();
    let events = events_for(&events, &id);
    let retrying: Vec<_> = events
        .iter()
        .filter(|e| e.status == Some(JobStatus::Retrying))
        .collect();
    assert_eq!(retrying.len(), 2);
    assert!(retrying.iter().all(|e| e.error.is_some()));

    let last = events.last().unwrap();
    assert_eq!(last.event_type, EventType::Error);
    assert_eq!(last.status, Some(JobStatus::Failed));

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_disabled_auto_retry_fails_on_first_error() {
    let h = Harness::start(|_| {}).await;

    let id = h
        .orchestrator
        .submit(request("fail").with_auto_retry(false))
        .unwrap();
    h.wait_status(&id, JobStatus::Failed).await;

    assert_eq!(h.orchestrator.get(&id).unwrap().retry_count, 0);
    assert_eq!(h.engine.start_count(&id), 1);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_scheduled_job_waits_for_its_activation_time() {
    let h = Harness::start(|_| {}).await;

    let at = Utc::now() + chrono::Duration::milliseconds(500);
    let id = h
        .orchestrator
        .submit(request("later").with_scheduled_time(at))
        .unwrap();
    assert_eq!(h.status(&id), JobStatus::Scheduled);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(h.status(&id), JobStatus::Scheduled);
    assert_eq!(h.engine.start_count(&id), 0);
    assert_eq!(h.orchestrator.active_count(), 0);

    h.wait_status(&id, JobStatus::Completed).await;
    assert!(Utc::now() >= at);
    assert_eq!(h.engine.start_count(&id), 1);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_progress_burst_is_throttled() {
    let mut h = Harness::start(|_| {}).await;

    let id = h.submit("burst");
    h.wait_status(&id, JobStatus::Completed).await;

    let events = h.drain();
    let progress: Vec<f64> = events_for(&events, &id)
        .iter()
        .filter(|e| e.event_type == EventType::Progress)
        .filter_map(|e| e.progress)
        .collect();

    assert!(
        !progress.is_empty() && progress.len() <= 2,
        "progress events: {progress:?}"
    );
    assert_eq!(progress.last().copied(), Some(100.0));
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_download_ignores_late_completion() {
    let mut h = Harness::start(|c| c.max_concurrent_downloads = 1).await;

    let id = h.submit("stubborn");
    let next = h.submit("video-next");
    let engine = h.engine.clone();
    let started = id.clone();
    h.wait_for("engine start", move |_| engine.start_count(&started) == 1)
        .await;

    let cancelled = h.orchestrator.cancel(&id).unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    // The engine finishes anyway; the next job only starts once it has.
    h.wait_status(&next, JobStatus::Completed).await;

    let job = h.orchestrator.get(&id).unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.filename, None);

    let events = h.drain();
    let events = events_for(&events, &id);
    assert!(events.iter().all(|e| e.event_type != EventType::Completed));
    assert_eq!(events.last().unwrap().status, Some(JobStatus::Cancelled));
    assert!(h.engine.peak() <= 1);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_cancelling_a_queued_job_never_takes_a_ticket() {
    let h = Harness::start(|c| c.max_concurrent_downloads = 1).await;

    let running = h.submit("block");
    let queued = h.submit("video-queued");
    assert_eq!(h.status(&queued), JobStatus::Queued);

    h.orchestrator.cancel(&queued).unwrap();
    assert_eq!(h.orchestrator.active_count(), 1);

    h.orchestrator.cancel(&running).unwrap();
    h.wait_for("tickets to be released", |o| o.active_count() == 0).await;

    assert_eq!(h.engine.start_count(&queued), 0);
    assert!(matches!(
        h.orchestrator.cancel(&queued),
        Err(Error::AlreadyTerminal { .. })
    ));

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_clear_history_keeps_active_jobs() {
    let h = Harness::start(|c| c.max_concurrent_downloads = 1).await;

    let done = h.submit("video-done");
    h.wait_status(&done, JobStatus::Completed).await;

    let running = h.submit("block");
    let queued = h.submit("video-queued");
    h.wait_status(&running, JobStatus::Downloading).await;

    let removed = h.orchestrator.clear_history().await.unwrap();
    assert_eq!(removed, 1);

    assert!(matches!(h.orchestrator.get(&done), Err(Error::NotFound { .. })));
    assert_eq!(h.status(&running), JobStatus::Downloading);
    assert_eq!(h.status(&queued), JobStatus::Queued);

    h.orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_history_survives_restart() {
    let dir = TempDir::new().unwrap();
    let history_file = dir.path().join("history.json");
    let config = || Config {
        download_dir: dir.path().join("downloads"),
        history_file: history_file.clone(),
        scheduler_interval: Duration::from_millis(20),
        ..Config::default()
    };

    let engine = Arc::new(ScriptedEngine::default());
    let first = Orchestrator::new(config(), engine.clone()).unwrap();
    first.start().await.unwrap();
    let id = first.submit(request("video-1")).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while first.get(&id).unwrap().status != JobStatus::Completed {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    first.shutdown().await;
    assert!(history_file.exists());

    let second = Orchestrator::new(config(), engine).unwrap();
    second.start().await.unwrap();
    let restored = second.get(&id).unwrap();
    assert_eq!(restored.status, JobStatus::Completed);
    assert_eq!(restored.filename.as_deref(), Some(format!("/downloads/{id}.mp4").as_str()));

    second.shutdown().await;
}
