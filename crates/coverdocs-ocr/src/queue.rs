//! The OCR job queue.
//!
//! Converts pending job rows into OCR results with bounded concurrency.
//! Authoritative state lives in the metadata store; every in-process
//! structure here is advisory. Correctness under concurrent workers and
//! concurrent processes derives from the store's atomic lease operation.
//!
//! Each worker loops: lease -> heartbeat in the background -> process with a
//! deadline -> complete or classified fail. A sweeper task returns crashed
//! workers' jobs to the queue by expiring their leases.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value as JsonValue;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use coverdocs_core::{
    defaults, BlobStore, Clock, DocumentStore, EnqueueJobRequest, Error, JobFilter, OcrJob,
    OcrJobStore, OcrResultData, QueueStats, Result, RetryConfig, SystemClock, WorkerConfig,
};

use crate::backoff::backoff_delay;
use crate::service::OcrService;

const EVENT_CAPACITY: usize = 256;

/// Configuration for the queue.
#[derive(Debug, Clone, Default)]
pub struct QueueConfig {
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
}

impl QueueConfig {
    pub fn from_env() -> Self {
        Self {
            worker: WorkerConfig::from_env(),
            retry: RetryConfig::from_env(),
        }
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// Event emitted by the queue.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    WorkerStarted { worker_id: String },
    WorkerStopped { worker_id: String },
    JobStarted {
        job_id: Uuid,
        document_id: Uuid,
        worker_id: String,
    },
    JobCompleted { job_id: Uuid, duration_ms: u64 },
    JobRetried {
        job_id: Uuid,
        retry_count: i32,
        error: String,
    },
    JobFailed { job_id: Uuid, error: String },
    /// The worker lost its claim mid-flight (lease stolen or job cancelled)
    /// and walked away without finalizing.
    JobAbandoned { job_id: Uuid, reason: String },
    LeasesExpired { count: u64 },
}

/// Outcome of a batch enqueue; failures are per-document, not atomic.
#[derive(Debug)]
pub struct BatchEnqueueOutcome {
    pub enqueued: Vec<OcrJob>,
    pub failures: Vec<(Uuid, String)>,
}

/// Handle for controlling a running queue.
pub struct QueueHandle {
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    event_tx: broadcast::Sender<QueueEvent>,
}

impl QueueHandle {
    /// Get a receiver for queue events.
    pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.event_tx.subscribe()
    }

    /// Signal all workers and the sweeper to stop, then wait for them.
    /// Workers abandon in-flight jobs cooperatively; their leases make the
    /// jobs re-leasable.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// The OCR job queue.
pub struct OcrQueue {
    jobs: Arc<dyn OcrJobStore>,
    documents: Arc<dyn DocumentStore>,
    blobs: Arc<dyn BlobStore>,
    ocr: Arc<OcrService>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    event_tx: broadcast::Sender<QueueEvent>,
}

impl OcrQueue {
    pub fn new(
        jobs: Arc<dyn OcrJobStore>,
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        ocr: Arc<OcrService>,
        config: QueueConfig,
    ) -> Self {
        Self::with_clock(jobs, documents, blobs, ocr, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        jobs: Arc<dyn OcrJobStore>,
        documents: Arc<dyn DocumentStore>,
        blobs: Arc<dyn BlobStore>,
        ocr: Arc<OcrService>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            jobs,
            documents,
            blobs,
            ocr,
            config,
            clock,
            event_tx,
        }
    }

    /// Get a receiver for queue events.
    pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.event_tx.subscribe()
    }

    // ------------------------------------------------------------------
    // Admin surface
    // ------------------------------------------------------------------

    /// Enqueue an OCR job for a document.
    pub async fn enqueue(
        &self,
        document_id: Uuid,
        priority: i32,
        options: JsonValue,
    ) -> Result<OcrJob> {
        let language = options
            .get("language")
            .and_then(|v| v.as_str())
            .unwrap_or("auto")
            .to_string();
        let req = EnqueueJobRequest {
            document_id,
            priority,
            language,
            engine: self.ocr.engine_name().to_string(),
            options,
            max_retries: self.config.retry.max_retries,
        };
        self.jobs.enqueue(req).await
    }

    /// Enqueue OCR jobs for up to 100 documents; partial failures are
    /// reported per document.
    pub async fn enqueue_batch(
        &self,
        document_ids: &[Uuid],
        priority: i32,
        options: JsonValue,
    ) -> Result<BatchEnqueueOutcome> {
        if document_ids.is_empty() {
            return Err(Error::Validation("empty document batch".to_string()));
        }
        if document_ids.len() > defaults::BATCH_ENQUEUE_MAX {
            return Err(Error::Validation(format!(
                "batch of {} exceeds limit {}",
                document_ids.len(),
                defaults::BATCH_ENQUEUE_MAX
            )));
        }

        let mut outcome = BatchEnqueueOutcome {
            enqueued: Vec::new(),
            failures: Vec::new(),
        };
        for &document_id in document_ids {
            match self.enqueue(document_id, priority, options.clone()).await {
                Ok(job) => outcome.enqueued.push(job),
                Err(e) => outcome.failures.push((document_id, e.to_string())),
            }
        }
        Ok(outcome)
    }

    /// Cancel a job at source. Processing workers observe the cancellation
    /// through their next heartbeat.
    pub async fn cancel(&self, job_id: Uuid) -> Result<OcrJob> {
        self.jobs.cancel(job_id).await
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<OcrJob> {
        self.jobs.get(job_id).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<OcrJob>> {
        self.jobs.list(filter).await
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        self.jobs.stats().await
    }

    // ------------------------------------------------------------------
    // Worker pool
    // ------------------------------------------------------------------

    /// Start the worker pool and the lease-expiry sweeper.
    pub fn start(self: Arc<Self>) -> QueueHandle {
        let cancel = CancellationToken::new();
        let token = coverdocs_core::new_id().simple().to_string();
        let process_token = &token[..8];
        let mut tasks = Vec::with_capacity(self.config.worker.worker_count + 1);

        info!(
            subsystem = "queue",
            component = "pool",
            op = "start",
            worker_count = self.config.worker.worker_count,
            lease_ttl_secs = self.config.worker.lease_ttl.as_secs(),
            "Starting OCR worker pool"
        );

        for i in 0..self.config.worker.worker_count {
            let worker_id = format!("{process_token}-w{i}");
            let queue = self.clone();
            let shutdown = cancel.clone();
            tasks.push(tokio::spawn(async move {
                queue.worker_loop(worker_id, shutdown).await;
            }));
        }

        let queue = self.clone();
        let shutdown = cancel.clone();
        tasks.push(tokio::spawn(async move {
            queue.sweeper_loop(shutdown).await;
        }));

        QueueHandle {
            cancel,
            tasks,
            event_tx: self.event_tx.clone(),
        }
    }

    async fn worker_loop(self: Arc<Self>, worker_id: String, shutdown: CancellationToken) {
        let notify = self.jobs.job_notify();
        let _ = self.event_tx.send(QueueEvent::WorkerStarted {
            worker_id: worker_id.clone(),
        });
        debug!(
            subsystem = "queue",
            component = "worker",
            worker_id = %worker_id,
            "Worker started"
        );

        while !shutdown.is_cancelled() {
            match self
                .jobs
                .lease_one(&worker_id, self.config.worker.lease_ttl)
                .await
            {
                Ok(Some(job)) => {
                    self.run_job(&worker_id, job, &shutdown).await;
                }
                Ok(None) => {
                    // Queue empty: wait for an enqueue signal, the sweeper
                    // re-pending something, or the poll tick.
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = notify.notified() => {}
                        _ = sleep(self.config.worker.empty_poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(
                        subsystem = "queue",
                        component = "worker",
                        worker_id = %worker_id,
                        error = %e,
                        "Failed to lease job"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = sleep(self.config.worker.empty_poll_interval) => {}
                    }
                }
            }
        }

        let _ = self.event_tx.send(QueueEvent::WorkerStopped {
            worker_id: worker_id.clone(),
        });
        debug!(
            subsystem = "queue",
            component = "worker",
            worker_id = %worker_id,
            "Worker stopped"
        );
    }

    /// Process one leased job to a terminal outcome for this attempt.
    async fn run_job(&self, worker_id: &str, job: OcrJob, shutdown: &CancellationToken) {
        let started = Instant::now();
        let _ = self.event_tx.send(QueueEvent::JobStarted {
            job_id: job.id,
            document_id: job.document_id,
            worker_id: worker_id.to_string(),
        });
        info!(
            subsystem = "queue",
            component = "worker",
            worker_id = %worker_id,
            job_id = %job.id,
            document_id = %job.document_id,
            priority = job.priority,
            retry_count = job.retry_count,
            "Processing job"
        );

        // The heartbeat renews the lease and doubles as the cancellation
        // poll: cancel-at-source clears the lease, so the next renew comes
        // back LeaseLost and trips `abort`.
        let abort = CancellationToken::new();
        let stop_heartbeat = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.jobs.clone(),
            job.id,
            worker_id.to_string(),
            self.config.worker.lease_ttl,
            self.config.worker.heartbeat_interval(),
            abort.clone(),
            stop_heartbeat.clone(),
        ));

        let deadline = self.config.worker.processing_deadline();
        let outcome = tokio::select! {
            res = self.execute(&job, deadline) => Some(res),
            _ = abort.cancelled() => None,
            _ = shutdown.cancelled() => None,
        };

        stop_heartbeat.cancel();
        let _ = heartbeat.await;

        match outcome {
            Some(Ok(result)) => {
                match self.jobs.complete(job.id, worker_id, result).await {
                    Ok(()) => {
                        let duration_ms = started.elapsed().as_millis() as u64;
                        info!(
                            subsystem = "queue",
                            component = "worker",
                            worker_id = %worker_id,
                            job_id = %job.id,
                            duration_ms,
                            success = true,
                            "Job completed"
                        );
                        let _ = self.event_tx.send(QueueEvent::JobCompleted {
                            job_id: job.id,
                            duration_ms,
                        });
                    }
                    Err(Error::LeaseLost(_)) => self.abandon(job.id, "lease lost at completion"),
                    Err(e) => error!(
                        subsystem = "queue",
                        component = "worker",
                        job_id = %job.id,
                        error = %e,
                        "Failed to record completion"
                    ),
                }
            }
            Some(Err(e)) => self.record_failure(worker_id, &job, e).await,
            None => {
                // Shutdown or cancellation: hand the attempt back as
                // retryable. If the job was cancelled at source the store
                // reports LeaseLost here, which is exactly abandonment.
                match self
                    .jobs
                    .fail(
                        job.id,
                        worker_id,
                        "cancelled",
                        "worker abandoned the attempt",
                        true,
                        Duration::ZERO,
                    )
                    .await
                {
                    Ok(()) => self.abandon(job.id, "cancellation observed"),
                    Err(Error::LeaseLost(_)) => self.abandon(job.id, "lease already released"),
                    Err(e) => error!(
                        subsystem = "queue",
                        component = "worker",
                        job_id = %job.id,
                        error = %e,
                        "Failed to record abandonment"
                    ),
                }
            }
        }
    }

    /// Load the document and its bytes, then run OCR.
    async fn execute(&self, job: &OcrJob, deadline: Duration) -> Result<OcrResultData> {
        let document = self.documents.get(job.document_id, true).await?;
        if document.is_deleted() {
            return Err(Error::Permanent("document was deleted".to_string()));
        }
        let bytes = self
            .blobs
            .get(&document.storage_key)
            .await
            .map_err(|e| match e {
                // A referenced blob that is gone will not come back.
                Error::NotFound(m) => Error::Permanent(m),
                Error::Io(io) => Error::Upstream {
                    service: "blobstore",
                    message: io.to_string(),
                    retryable: true,
                },
                other => other,
            })?;
        self.ocr
            .process(&bytes, &document.mime_type, &job.options, deadline)
            .await
    }

    async fn record_failure(&self, worker_id: &str, job: &OcrJob, e: Error) {
        let retryable = e.retryable();
        let backoff = if retryable {
            backoff_delay(job.retry_count as u32 + 1, &self.config.retry)
        } else {
            Duration::ZERO
        };

        warn!(
            subsystem = "queue",
            component = "worker",
            worker_id = %worker_id,
            job_id = %job.id,
            retry_count = job.retry_count,
            retryable,
            error = %e,
            "Job attempt failed"
        );

        match self
            .jobs
            .fail(job.id, worker_id, e.code(), &e.to_string(), retryable, backoff)
            .await
        {
            Ok(()) => {
                if retryable && job.retry_count < job.max_retries {
                    let _ = self.event_tx.send(QueueEvent::JobRetried {
                        job_id: job.id,
                        retry_count: job.retry_count + 1,
                        error: e.to_string(),
                    });
                } else {
                    let _ = self.event_tx.send(QueueEvent::JobFailed {
                        job_id: job.id,
                        error: e.to_string(),
                    });
                }
            }
            Err(Error::LeaseLost(_)) => self.abandon(job.id, "lease lost at failure"),
            Err(err) => error!(
                subsystem = "queue",
                component = "worker",
                job_id = %job.id,
                error = %err,
                "Failed to record job failure"
            ),
        }
    }

    fn abandon(&self, job_id: Uuid, reason: &str) {
        warn!(
            subsystem = "queue",
            component = "worker",
            job_id = %job_id,
            reason,
            "Abandoning job attempt"
        );
        let _ = self.event_tx.send(QueueEvent::JobAbandoned {
            job_id,
            reason: reason.to_string(),
        });
    }

    /// Return crashed workers' jobs to the queue. Runs at a quarter of the
    /// lease TTL so an expired lease is re-leasable within one lease period.
    async fn sweeper_loop(self: Arc<Self>, cancel: CancellationToken) {
        let interval = self.config.worker.sweeper_interval();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(interval) => {}
            }
            match self.jobs.expire_leases(self.clock.utc_now()).await {
                Ok(0) => {}
                Ok(count) => {
                    info!(
                        subsystem = "queue",
                        component = "sweeper",
                        affected = count,
                        "Expired stale leases"
                    );
                    let _ = self.event_tx.send(QueueEvent::LeasesExpired { count });
                }
                Err(e) => error!(
                    subsystem = "queue",
                    component = "sweeper",
                    error = %e,
                    "Lease sweep failed"
                ),
            }
        }
    }
}

/// Renew the lease several times per TTL until stopped; trip `abort` when
/// the lease is lost (sweeper reclaim or cancel-at-source).
async fn heartbeat_loop(
    jobs: Arc<dyn OcrJobStore>,
    job_id: Uuid,
    worker_id: String,
    lease_ttl: Duration,
    interval: Duration,
    abort: CancellationToken,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = sleep(interval) => {}
        }
        match jobs.renew_lease(job_id, &worker_id, lease_ttl).await {
            Ok(()) => {}
            Err(Error::LeaseLost(_)) => {
                warn!(
                    subsystem = "queue",
                    component = "heartbeat",
                    job_id = %job_id,
                    worker_id = %worker_id,
                    "Lease lost, aborting work"
                );
                abort.cancel();
                return;
            }
            Err(e) => {
                // Transient store trouble: keep the attempt alive and retry
                // at the next beat; the lease still has headroom.
                warn!(
                    subsystem = "queue",
                    component = "heartbeat",
                    job_id = %job_id,
                    error = %e,
                    "Heartbeat failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_config_builders() {
        let cfg = QueueConfig::default()
            .with_worker(WorkerConfig::default().with_worker_count(2))
            .with_retry(RetryConfig {
                max_retries: 1,
                backoff_base: Duration::ZERO,
                backoff_max: Duration::ZERO,
            });
        assert_eq!(cfg.worker.worker_count, 2);
        assert_eq!(cfg.retry.max_retries, 1);
    }

    #[test]
    fn test_events_are_cloneable() {
        let event = QueueEvent::JobCompleted {
            job_id: Uuid::nil(),
            duration_ms: 5,
        };
        let cloned = event.clone();
        assert!(matches!(cloned, QueueEvent::JobCompleted { duration_ms: 5, .. }));
    }
}
