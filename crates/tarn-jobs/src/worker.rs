//! Job worker: claims jobs from the ledger and drives handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use tarn_core::{defaults, Error, Job, JobError, JobKind, JobStatus, Result};
use tarn_db::Database;

use crate::handler::{JobContext, JobHandler, JobOutcome};

/// Configuration for the job worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Polling interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Maximum number of concurrent jobs.
    pub max_concurrent_jobs: usize,
    /// Per-job execution timeout in seconds.
    pub job_timeout_secs: u64,
    /// Whether to enable job processing.
    pub enabled: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: defaults::JOB_POLL_INTERVAL_MS,
            max_concurrent_jobs: defaults::JOB_MAX_CONCURRENT,
            job_timeout_secs: defaults::JOB_TIMEOUT_SECS,
            enabled: true,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_WORKER_ENABLED` | `true` | Enable/disable job processing |
    /// | `JOB_MAX_CONCURRENT` | `4` | Max concurrent jobs |
    /// | `JOB_POLL_INTERVAL_MS` | `500` | Polling interval when queue is empty |
    /// | `JOB_TIMEOUT_SECS` | `300` | Per-job execution timeout |
    pub fn from_env() -> Self {
        let enabled = std::env::var("JOB_WORKER_ENABLED")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let max_concurrent_jobs = std::env::var("JOB_MAX_CONCURRENT")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(defaults::JOB_MAX_CONCURRENT)
            .max(1);

        let poll_interval_ms = std::env::var("JOB_POLL_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_POLL_INTERVAL_MS);

        let job_timeout_secs = std::env::var("JOB_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(defaults::JOB_TIMEOUT_SECS);

        Self {
            poll_interval_ms,
            max_concurrent_jobs,
            job_timeout_secs,
            enabled,
        }
    }

    /// Create a new config with custom poll interval.
    pub fn with_poll_interval(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set maximum concurrent jobs.
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = max;
        self
    }

    /// Set the per-job execution timeout.
    pub fn with_job_timeout(mut self, secs: u64) -> Self {
        self.job_timeout_secs = secs;
        self
    }

    /// Enable or disable job processing.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// Event emitted by the job worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A claimed job was handed to its handler.
    JobStarted { job_id: Uuid, kind: JobKind },
    /// A job completed successfully.
    JobCompleted { job_id: Uuid, kind: JobKind },
    /// An orchestrator dispatched children and went back to waiting.
    JobSuspended { job_id: Uuid, kind: JobKind },
    /// A job failed.
    JobFailed {
        job_id: Uuid,
        kind: JobKind,
        error: String,
        /// Whether the job was re-queued for another attempt.
        will_retry: bool,
    },
    /// Worker started.
    WorkerStarted,
    /// Worker stopped.
    WorkerStopped,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    event_rx: broadcast::Receiver<WorkerEvent>,
}

impl WorkerHandle {
    /// Signal the worker to shut down gracefully.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_tx
            .send(())
            .await
            .map_err(|_| Error::Internal("Failed to send shutdown signal".into()))?;
        Ok(())
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_rx.resubscribe()
    }
}

/// Job worker that processes jobs from the ledger.
pub struct JobWorker {
    db: Database,
    config: WorkerConfig,
    handlers: Arc<RwLock<HashMap<JobKind, Arc<dyn JobHandler>>>>,
    event_tx: broadcast::Sender<WorkerEvent>,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(db: Database, config: WorkerConfig) -> Self {
        let (event_tx, _) = broadcast::channel(defaults::EVENT_BUS_CAPACITY);
        Self {
            db,
            config,
            handlers: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }
    }

    /// Register a handler for a job kind.
    pub async fn register_handler<H: JobHandler + 'static>(&self, handler: H) {
        let kind = handler.kind();
        let mut handlers = self.handlers.write().await;
        handlers.insert(kind, Arc::new(handler));
        debug!(?kind, "Registered job handler");
    }

    /// Start the worker and return a handle for control.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let event_rx = self.event_tx.subscribe();

        let worker = Arc::new(self);
        let worker_clone = worker.clone();

        tokio::spawn(async move {
            worker_clone.run(&mut shutdown_rx).await;
        });

        WorkerHandle {
            shutdown_tx,
            event_rx,
        }
    }

    /// Run the worker loop with concurrent job processing.
    ///
    /// Claims up to `max_concurrent_jobs` at a time and processes them
    /// concurrently. Only sleeps when the queue is empty.
    #[instrument(skip(self, shutdown_rx))]
    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        if !self.config.enabled {
            info!("Job worker is disabled, not starting");
            return;
        }

        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            max_concurrent = self.config.max_concurrent_jobs,
            "Job worker started"
        );

        let _ = self.event_tx.send(WorkerEvent::WorkerStarted);

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        let max_concurrent = self.config.max_concurrent_jobs;

        loop {
            if shutdown_rx.try_recv().is_ok() {
                info!("Job worker received shutdown signal");
                break;
            }

            let mut claimed = 0;
            let mut tasks = tokio::task::JoinSet::new();

            for _ in 0..max_concurrent {
                match self.claim_job().await {
                    Some(job) => {
                        claimed += 1;
                        let worker = self.clone_refs();
                        tasks.spawn(async move {
                            worker.execute_job(job).await;
                        });
                    }
                    None => break,
                }
            }

            if claimed == 0 {
                // Queue empty, sleep before polling again
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Job worker received shutdown signal");
                        break;
                    }
                    _ = sleep(poll_interval) => {}
                }
            } else {
                debug!(claimed, "Processing concurrent job batch");
                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result {
                        error!(error = ?e, "Job task panicked");
                    }
                }
            }
        }

        let _ = self.event_tx.send(WorkerEvent::WorkerStopped);
        info!("Job worker stopped");
    }

    /// Process jobs serially until the queue has nothing runnable.
    ///
    /// Deterministic alternative to [`JobWorker::start`] for tests and batch
    /// runs: orchestrator wakeups are claimed in the same loop, so one call
    /// drives a lake request to its terminal state.
    pub async fn run_until_idle(&self) -> usize {
        let mut processed = 0;
        while let Some(job) = self.claim_job().await {
            self.clone_refs().execute_job(job).await;
            processed += 1;
        }
        processed
    }

    /// Claim the next available job without processing it.
    async fn claim_job(&self) -> Option<Job> {
        let kinds: Vec<JobKind> = {
            let handlers = self.handlers.read().await;
            handlers.keys().copied().collect()
        };

        match self.db.jobs.claim_next(&kinds).await {
            Ok(Some(job)) => Some(job),
            Ok(None) => None,
            Err(e) => {
                error!(error = ?e, "Failed to claim job");
                None
            }
        }
    }

    /// Clone references needed for spawned job tasks.
    fn clone_refs(&self) -> JobWorkerRef {
        JobWorkerRef {
            db: self.db.clone(),
            handlers: self.handlers.clone(),
            event_tx: self.event_tx.clone(),
            job_timeout_secs: self.config.job_timeout_secs,
        }
    }

    /// Get a receiver for worker events.
    pub fn events(&self) -> broadcast::Receiver<WorkerEvent> {
        self.event_tx.subscribe()
    }

    /// Get the pending job count.
    pub async fn pending_count(&self) -> Result<i64> {
        self.db.jobs.pending_count().await
    }
}

/// Lightweight reference bundle for executing a single job in a spawned task.
struct JobWorkerRef {
    db: Database,
    handlers: Arc<RwLock<HashMap<JobKind, Arc<dyn JobHandler>>>>,
    event_tx: broadcast::Sender<WorkerEvent>,
    job_timeout_secs: u64,
}

impl JobWorkerRef {
    /// Execute a single claimed job and apply its outcome to the ledger.
    async fn execute_job(self, job: Job) {
        let start = Instant::now();
        let job_id = job.id;
        let kind = job.kind;
        let retries_left = !job.retries_exhausted();

        info!(?job_id, ?kind, "Processing job");
        let _ = self.event_tx.send(WorkerEvent::JobStarted { job_id, kind });

        let handler = {
            let handlers = self.handlers.read().await;
            handlers.get(&kind).cloned()
        };

        let outcome = match handler {
            Some(handler) => {
                let ctx = JobContext::new(job);
                let job_timeout = Duration::from_secs(self.job_timeout_secs);
                match tokio::time::timeout(job_timeout, handler.execute(ctx)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(?job_id, ?kind, "Job exceeded timeout of {}s", self.job_timeout_secs);
                        JobOutcome::Retry(JobError::new(
                            tarn_core::ErrorKind::CapabilityTimeout,
                            format!("job exceeded timeout of {}s", self.job_timeout_secs),
                        ))
                    }
                }
            }
            None => {
                warn!(?kind, "No handler registered for job kind");
                JobOutcome::Fail(JobError::new(
                    tarn_core::ErrorKind::Internal,
                    format!("no handler for job kind {kind:?}"),
                ))
            }
        };

        match outcome {
            JobOutcome::Complete(result) => {
                if let Some(result) = result {
                    if let Err(e) = self.db.jobs.set_result(job_id, result).await {
                        error!(error = ?e, ?job_id, "Failed to store job result");
                    }
                }
                match self.db.jobs.transition(job_id, JobStatus::Succeeded, None).await {
                    Ok(_) => {
                        info!(
                            ?job_id,
                            ?kind,
                            duration_ms = start.elapsed().as_millis() as u64,
                            "Job completed"
                        );
                        let _ = self.event_tx.send(WorkerEvent::JobCompleted { job_id, kind });
                    }
                    // Stale worker losing the race to a cancel or sweep.
                    Err(Error::InvalidTransition { from, to, .. }) => {
                        warn!(?job_id, ?from, ?to, "Discarding stale completion");
                    }
                    Err(e) => error!(error = ?e, ?job_id, "Failed to mark job succeeded"),
                }
            }
            JobOutcome::Suspend => {
                debug!(?job_id, ?kind, "Job suspended awaiting children");
                let _ = self.event_tx.send(WorkerEvent::JobSuspended { job_id, kind });
            }
            JobOutcome::Retry(err) => {
                let will_retry = err.kind.is_retryable() && retries_left;
                let message = err.to_string();
                match self
                    .db
                    .jobs
                    .transition(job_id, JobStatus::Failed, Some(err))
                    .await
                {
                    Ok(_) => {
                        if will_retry {
                            if let Err(e) = self.db.jobs.retry(job_id).await {
                                error!(error = ?e, ?job_id, "Failed to re-queue job");
                            }
                        }
                        warn!(
                            ?job_id,
                            ?kind,
                            error = %message,
                            will_retry,
                            duration_ms = start.elapsed().as_millis() as u64,
                            "Job failed"
                        );
                        let _ = self.event_tx.send(WorkerEvent::JobFailed {
                            job_id,
                            kind,
                            error: message,
                            will_retry,
                        });
                    }
                    Err(Error::InvalidTransition { from, to, .. }) => {
                        warn!(?job_id, ?from, ?to, "Discarding stale failure");
                    }
                    Err(e) => error!(error = ?e, ?job_id, "Failed to mark job failed"),
                }
            }
            JobOutcome::Fail(err) => {
                let message = err.to_string();
                match self
                    .db
                    .jobs
                    .transition(job_id, JobStatus::Failed, Some(err))
                    .await
                {
                    Ok(_) => {
                        warn!(
                            ?job_id,
                            ?kind,
                            error = %message,
                            duration_ms = start.elapsed().as_millis() as u64,
                            "Job failed permanently"
                        );
                        let _ = self.event_tx.send(WorkerEvent::JobFailed {
                            job_id,
                            kind,
                            error: message,
                            will_retry: false,
                        });
                    }
                    Err(Error::InvalidTransition { from, to, .. }) => {
                        warn!(?job_id, ?from, ?to, "Discarding stale failure");
                    }
                    Err(e) => error!(error = ?e, ?job_id, "Failed to mark job failed"),
                }
            }
        }
    }
}

/// Builder for creating a job worker with handlers.
pub struct WorkerBuilder {
    db: Database,
    config: WorkerConfig,
    handlers: Vec<Box<dyn JobHandler>>,
}

impl WorkerBuilder {
    /// Create a new worker builder.
    pub fn new(db: Database) -> Self {
        Self {
            db,
            config: WorkerConfig::default(),
            handlers: Vec::new(),
        }
    }

    /// Set the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a handler.
    pub fn with_handler<H: JobHandler + 'static>(mut self, handler: H) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Build and return the worker.
    pub async fn build(self) -> JobWorker {
        let worker = JobWorker::new(self.db, self.config);

        for handler in self.handlers {
            let kind = handler.kind();
            let mut handlers = worker.handlers.write().await;
            handlers.insert(kind, Arc::from(handler));
        }

        worker
    }
}
