//! Asynchronous audit logging.
//!
//! Appends flow through a bounded in-memory queue drained by a background
//! task, so a slow metadata store never blocks the request path. Transient
//! append failures are retried a bounded number of times; overflow and
//! exhausted retries increment a dropped counter instead of blocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use coverdocs_core::{defaults, AccessLogEntry, AccessLogStore};

/// Cloneable, non-blocking handle for emitting audit entries.
#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::Sender<AccessLogEntry>,
    dropped: Arc<AtomicU64>,
}

impl AuditHandle {
    /// Enqueue an entry. Never blocks; overflow is counted, not propagated.
    pub fn log(&self, entry: AccessLogEntry) {
        if self.tx.try_send(entry).is_err() {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                subsystem = "audit",
                component = "logger",
                affected = total,
                "Access log queue full, dropping entry"
            );
        }
    }

    /// Entries lost to overflow or exhausted retries.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Background access logger owning the drain task.
pub struct AccessLogger {
    handle: AuditHandle,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl AccessLogger {
    /// Spawn the drain task over the given store.
    pub fn start(store: Arc<dyn AccessLogStore>) -> Self {
        Self::with_capacity(store, defaults::ACCESS_LOG_QUEUE_CAPACITY)
    }

    pub fn with_capacity(store: Arc<dyn AccessLogStore>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(drain_loop(store, rx, dropped.clone(), cancel.clone()));

        Self {
            handle: AuditHandle { tx, dropped },
            cancel,
            task,
        }
    }

    pub fn handle(&self) -> AuditHandle {
        self.handle.clone()
    }

    pub fn dropped(&self) -> u64 {
        self.handle.dropped()
    }

    /// Stop the drain task after flushing whatever is already queued.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn drain_loop(
    store: Arc<dyn AccessLogStore>,
    mut rx: mpsc::Receiver<AccessLogEntry>,
    dropped: Arc<AtomicU64>,
    cancel: CancellationToken,
) {
    loop {
        let entry = tokio::select! {
            biased;
            maybe = rx.recv() => match maybe {
                Some(entry) => entry,
                None => return,
            },
            _ = cancel.cancelled() => {
                // Flush entries already queued, then stop.
                while let Ok(entry) = rx.try_recv() {
                    persist(&*store, entry, &dropped).await;
                }
                return;
            }
        };
        persist(&*store, entry, &dropped).await;
    }
}

async fn persist(store: &dyn AccessLogStore, entry: AccessLogEntry, dropped: &AtomicU64) {
    for attempt in 1..=defaults::ACCESS_LOG_MAX_ATTEMPTS {
        match store.append(entry.clone()).await {
            Ok(()) => return,
            Err(e) if e.retryable() && attempt < defaults::ACCESS_LOG_MAX_ATTEMPTS => {
                debug!(
                    subsystem = "audit",
                    component = "logger",
                    retry_count = attempt,
                    error = %e,
                    "Retrying access log append"
                );
                tokio::time::sleep(Duration::from_millis(10 * attempt as u64)).await;
            }
            Err(e) => {
                dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subsystem = "audit",
                    component = "logger",
                    document_id = %entry.document_id,
                    error = %e,
                    "Dropping access log entry"
                );
                return;
            }
        }
    }
}
