//! The job router.
//!
//! [`JobQueue`] assigns ids, persists jobs and routes them to lanes. Every
//! execution outcome comes back through [`JobQueue::on_succeeded`] or
//! [`JobQueue::on_failed`], which own all persisted state transitions.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use courier_common::{AppError, AppResult, JobId, JobIdGenerator, get_metrics};
use futures::FutureExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::job::{Job, JobContext, JobError, Lane, QueuedJob};
use crate::lanes::{KeyedLanes, LaneMode, LaneRunner, spawn_lane};
use crate::registry::JobRegistry;
use crate::retry::RetryConfig;
use crate::scheduler::DelayScheduler;
use crate::storage::{JobRecord, JobStorageService};

/// Capacity of the job event broadcast channel.
const EVENT_BUFFER_SIZE: usize = 1024;

/// What happened to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEventKind {
    Submitted,
    Succeeded,
    /// Scheduled to run again after `delay`.
    Retrying { failure_count: u32, delay: Duration },
    /// Removed from storage without succeeding.
    PermanentlyFailed { error: String },
    /// A failure was ignored because the job had been canceled.
    Canceled,
}

/// Lifecycle notification broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub id: JobId,
    pub factory_key: &'static str,
    pub kind: JobEventKind,
}

struct Inner {
    storage: JobStorageService,
    registry: JobRegistry,
    retry: RetryConfig,
    ids: JobIdGenerator,
    intake: mpsc::UnboundedSender<QueuedJob>,
    intake_rx: Mutex<Option<mpsc::UnboundedReceiver<QueuedJob>>>,
    /// Send jobs resumed by id that have not finished executing yet.
    pending_sends: Mutex<HashSet<JobId>>,
    resumed: AtomicBool,
    events: broadcast::Sender<JobEvent>,
    cancel: CancellationToken,
    scheduler: DelayScheduler,
}

/// Persistent job router.
///
/// Cheap to clone; all clones share one router.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    /// Build a router. Nothing runs until [`JobQueue::start`].
    #[must_use]
    pub fn new(storage: JobStorageService, registry: JobRegistry, retry: RetryConfig) -> Self {
        let (intake, intake_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        let cancel = CancellationToken::new();
        Self {
            inner: Arc::new(Inner {
                storage,
                registry,
                retry,
                ids: JobIdGenerator::new(),
                intake,
                intake_rx: Mutex::new(Some(intake_rx)),
                pending_sends: Mutex::new(HashSet::new()),
                resumed: AtomicBool::new(false),
                events,
                scheduler: DelayScheduler::new(cancel.clone()),
                cancel,
            }),
        }
    }

    /// Spawn the routing loop and the lanes.
    ///
    /// Jobs submitted before `start` are buffered and routed once it runs.
    pub fn start(&self) -> AppResult<JoinHandle<()>> {
        let mut intake = self
            .inner
            .intake_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| AppError::Queue("job queue already started".to_string()))?;

        let runner: Arc<dyn LaneRunner> = Arc::new(self.clone());
        let cancel = self.inner.cancel.clone();

        let (rx_tx, rx_rx) = mpsc::unbounded_channel();
        let (tx_tx, tx_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();
        spawn_lane("rx", LaneMode::Serial, rx_rx, runner.clone(), cancel.clone());
        spawn_lane("tx", LaneMode::Parallel, tx_rx, runner.clone(), cancel.clone());
        spawn_lane("media", LaneMode::Parallel, media_rx, runner.clone(), cancel.clone());
        let community = KeyedLanes::new(runner, cancel.clone());

        let queue = self.clone();
        let handle = tokio::spawn(async move {
            info!("Job router started");
            loop {
                let job = tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    job = intake.recv() => match job {
                        Some(job) => job,
                        None => break,
                    },
                };

                let lane = job.job.lane();
                let sent = match &lane {
                    Lane::Receive => rx_tx.send(job).map_err(|e| e.0),
                    Lane::Send => tx_tx.send(job).map_err(|e| e.0),
                    Lane::Media => media_tx.send(job).map_err(|e| e.0),
                    Lane::Community(key) if key.is_empty() => {
                        error!(job_id = %job.id, kind = job.factory_key(), "Community job without a lane key");
                        queue
                            .fail_permanently(&job, "missing community lane key".to_string())
                            .await;
                        Ok(())
                    }
                    Lane::Community(key) => community.dispatch(key, job).await,
                };
                if let Err(job) = sent {
                    warn!(job_id = %job.id, %lane, "Lane closed, job left for resume");
                }
            }
            info!("Job router stopped");
        });
        Ok(handle)
    }

    /// Stop routing. Lanes stop dequeuing; running jobs finish.
    pub fn shutdown(&self) {
        info!("Job queue shutting down");
        self.inner.cancel.cancel();
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Receive lifecycle events for all jobs.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn storage(&self) -> &JobStorageService {
        &self.inner.storage
    }

    /// Assign an id, persist and enqueue a new job.
    pub async fn submit<J: Job + 'static>(&self, job: J) -> AppResult<JobId> {
        self.submit_shared(Arc::new(job), 0).await
    }

    /// Like [`JobQueue::submit`] for a shared job carrying prior failures.
    pub async fn submit_shared(&self, job: Arc<dyn Job>, failure_count: u32) -> AppResult<JobId> {
        let id = self.inner.ids.next_id();
        let record = JobRecord::new(id, job.factory_key(), failure_count, job.serialize()?);
        self.inner.storage.persist(&record).await?;

        let queued = QueuedJob::new(id, failure_count, job);
        let factory_key = queued.factory_key();

        // Subscribers must see Submitted before any outcome of the job.
        debug!(job_id = %id, kind = factory_key, failure_count, "Job submitted");
        get_metrics().jobs_submitted.fetch_add(1, Ordering::Relaxed);
        self.emit(id, factory_key, JobEventKind::Submitted);
        self.enqueue(queued)?;
        Ok(id)
    }

    /// Re-enqueue every persisted job of one type in submission order.
    ///
    /// Records that cannot be decoded are purged. Returns how many jobs
    /// were resumed.
    pub async fn resume_pending(&self, factory_key: &str) -> AppResult<usize> {
        let records = self.inner.storage.pending(factory_key).await?;
        let mut jobs = Vec::with_capacity(records.len());
        for record in records {
            match self.inner.registry.decode(&record) {
                Ok(job) => jobs.push(QueuedJob::new(record.id, record.failure_count, job)),
                Err(e) => {
                    warn!(job_id = %record.id, kind = factory_key, error = %e, "Purging undecodable job");
                    self.inner.storage.mark_failed_permanently(record.id).await?;
                    get_metrics()
                        .jobs_failed_permanently
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        jobs.sort_by_key(|job| job.id);
        let count = jobs.len();
        for job in jobs {
            info!(job_id = %job.id, kind = factory_key, "Resuming pending job");
            self.enqueue(job)?;
        }
        get_metrics()
            .jobs_resumed
            .fetch_add(count as u64, Ordering::Relaxed);
        Ok(count)
    }

    /// Resume every registered job type. Only the first call does anything.
    ///
    /// A type whose jobs cannot be loaded is logged and skipped.
    pub async fn resume_all(&self) -> AppResult<usize> {
        if self.inner.resumed.swap(true, Ordering::SeqCst) {
            debug!("Pending jobs already resumed");
            return Ok(0);
        }
        let mut total = 0;
        for key in self.inner.registry.keys() {
            match self.resume_pending(key).await {
                Ok(count) => total += count,
                Err(e) => error!(kind = key, error = %e, "Failed to resume pending jobs"),
            }
        }
        info!(count = total, "Resumed pending jobs");
        Ok(total)
    }

    /// Re-enqueue a persisted send job that another job was blocking.
    ///
    /// Does nothing if the job is already queued this way and has not
    /// finished executing. Returns whether the job was enqueued.
    pub async fn resume_pending_send(&self, id: JobId) -> AppResult<bool> {
        if !self.pending_sends().insert(id) {
            warn!(job_id = %id, "Send job already pending");
            return Ok(false);
        }

        let job = match self.inner.storage.load(id).await {
            Ok(Some(record)) => self.inner.registry.decode(&record).map(|job| (record, job)),
            Ok(None) => Err(AppError::NotFound(format!("job {id}"))),
            Err(e) => Err(e),
        };
        let enqueued =
            job.and_then(|(record, job)| self.enqueue(QueuedJob::new(record.id, record.failure_count, job)));
        match enqueued {
            Ok(()) => {
                debug!(job_id = %id, "Resumed pending send");
                Ok(true)
            }
            Err(e) => {
                self.pending_sends().remove(&id);
                Err(e)
            }
        }
    }

    fn pending_sends(&self) -> std::sync::MutexGuard<'_, HashSet<JobId>> {
        self.inner
            .pending_sends
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(&self, job: QueuedJob) -> AppResult<()> {
        self.inner
            .intake
            .send(job)
            .map_err(|_| AppError::Queue("job queue is closed".to_string()))
    }

    fn emit(&self, id: JobId, factory_key: &'static str, kind: JobEventKind) {
        // No subscribers is fine.
        let _ = self.inner.events.send(JobEvent {
            id,
            factory_key,
            kind,
        });
    }

    /// Record a successful execution.
    pub async fn on_succeeded(&self, job: &QueuedJob) {
        if let Err(e) = self.inner.storage.mark_succeeded(job.id).await {
            error!(job_id = %job.id, error = %e, "Failed to mark job succeeded");
        }
        debug!(job_id = %job.id, kind = job.factory_key(), "Job succeeded");
        get_metrics().jobs_succeeded.fetch_add(1, Ordering::Relaxed);
        self.emit(job.id, job.factory_key(), JobEventKind::Succeeded);
    }

    /// Record a failed execution and decide whether the job runs again.
    pub async fn on_failed(&self, mut job: QueuedJob, error: JobError) {
        let kind = job.factory_key();
        match self.inner.storage.is_canceled(job.id).await {
            Ok(true) => {
                info!(job_id = %job.id, kind, "Job canceled");
                get_metrics().jobs_canceled.fetch_add(1, Ordering::Relaxed);
                self.emit(job.id, kind, JobEventKind::Canceled);
                return;
            }
            Ok(false) => {}
            Err(e) => warn!(job_id = %job.id, error = %e, "Could not check job cancellation"),
        }

        match &error {
            JobError::AwaitingDependency(what) => {
                info!(job_id = %job.id, kind, waiting_on = %what, "Job waiting on dependency");
                return;
            }
            JobError::Permanent(message) => {
                self.fail_permanently(&job, message.clone()).await;
                return;
            }
            JobError::PartialBatch {
                replacement: Some(replacement),
                failed,
                total,
            } if job.failure_count == 0 => {
                info!(job_id = %job.id, failed, total, "Submitting replacement for failed items");
                if let Err(e) = self
                    .submit_shared(replacement.clone(), job.failure_count + 1)
                    .await
                {
                    error!(job_id = %job.id, error = %e, "Failed to submit replacement job");
                }
            }
            _ => {}
        }

        job.failure_count += 1;
        if !RetryConfig::should_retry(job.failure_count, job.job.max_failure_count()) {
            self.fail_permanently(&job, error.to_string()).await;
            return;
        }

        match job.job.serialize() {
            Ok(payload) => {
                let record = JobRecord::new(job.id, kind, job.failure_count, payload);
                if let Err(e) = self.inner.storage.persist(&record).await {
                    error!(job_id = %job.id, error = %e, "Failed to persist failure count");
                }
            }
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to serialize job for retry"),
        }

        let delay = self.inner.retry.delay_for_attempt(job.failure_count);
        info!(
            job_id = %job.id,
            kind,
            failure_count = job.failure_count,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Job failed; scheduling retry"
        );
        get_metrics().jobs_retried.fetch_add(1, Ordering::Relaxed);
        self.emit(
            job.id,
            kind,
            JobEventKind::Retrying {
                failure_count: job.failure_count,
                delay,
            },
        );
        self.inner
            .scheduler
            .schedule(delay, self.inner.intake.clone(), job);
    }

    async fn fail_permanently(&self, job: &QueuedJob, error: String) {
        if let Err(e) = self.inner.storage.mark_failed_permanently(job.id).await {
            error!(job_id = %job.id, error = %e, "Failed to remove permanently failed job");
        }
        warn!(job_id = %job.id, kind = job.factory_key(), error = %error, "Job failed permanently");
        get_metrics()
            .jobs_failed_permanently
            .fetch_add(1, Ordering::Relaxed);
        self.emit(
            job.id,
            job.factory_key(),
            JobEventKind::PermanentlyFailed { error },
        );
    }
}

#[async_trait]
impl LaneRunner for JobQueue {
    async fn run(&self, job: QueuedJob, lane: &'static str) {
        debug!(lane, job_id = %job.id, kind = job.factory_key(), "Processing job");
        let ctx = JobContext {
            id: job.id,
            failure_count: job.failure_count,
            queue: self.clone(),
        };

        let result = AssertUnwindSafe(job.job.execute(&ctx)).catch_unwind().await;

        // Ids are unique across job types, so clear unconditionally.
        self.pending_sends().remove(&job.id);

        match result {
            Ok(Ok(())) => self.on_succeeded(&job).await,
            Ok(Err(e)) => self.on_failed(job, e).await,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(lane, job_id = %job.id, panic = %message, "Job panicked");
                self.on_failed(job, JobError::Retryable(format!("job panicked: {message}")))
                    .await;
            }
        }
    }
}
