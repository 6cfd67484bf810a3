//! The core context.
//!
//! One explicit object, constructed at startup, holding every capability
//! handle the services need: no hidden globals, no module-level state.
//! Pass it by reference.

use std::sync::Arc;

use coverdocs_core::{
    AccessLogStore, BlobStore, Clock, CoreConfig, DocumentStore, OcrEngine, OcrJobStore,
    SystemClock,
};
use coverdocs_ocr::{OcrQueue, OcrService, QueueConfig, QueueHandle};
use coverdocs_storage::StorageService;

use crate::access_log::AccessLogger;
use crate::documents::DocumentService;
use crate::validation::ValidationService;

/// Capability handles wired into the service graph.
pub struct Core {
    pub config: CoreConfig,
    pub clock: Arc<dyn Clock>,
    pub storage: Arc<StorageService>,
    pub documents: Arc<DocumentService>,
    pub queue: Arc<OcrQueue>,
    pub audit: AccessLogger,
}

impl Core {
    /// Wire the service graph from its capabilities.
    pub fn new(
        config: CoreConfig,
        document_store: Arc<dyn DocumentStore>,
        job_store: Arc<dyn OcrJobStore>,
        access_log_store: Arc<dyn AccessLogStore>,
        blob_store: Arc<dyn BlobStore>,
        engine: Arc<dyn OcrEngine>,
    ) -> Self {
        Self::with_clock(
            config,
            document_store,
            job_store,
            access_log_store,
            blob_store,
            engine,
            Arc::new(SystemClock),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_clock(
        config: CoreConfig,
        document_store: Arc<dyn DocumentStore>,
        job_store: Arc<dyn OcrJobStore>,
        access_log_store: Arc<dyn AccessLogStore>,
        blob_store: Arc<dyn BlobStore>,
        engine: Arc<dyn OcrEngine>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let storage = Arc::new(StorageService::new(
            blob_store.clone(),
            config.storage.clone(),
            clock.clone(),
        ));
        let ocr = Arc::new(OcrService::new(engine, config.ocr.clone()));
        let default_engine = ocr.engine_name().to_string();

        let queue = Arc::new(OcrQueue::with_clock(
            job_store.clone(),
            document_store.clone(),
            blob_store,
            ocr,
            QueueConfig::default()
                .with_worker(config.worker.clone())
                .with_retry(config.retry.clone()),
            clock.clone(),
        ));

        let audit = AccessLogger::start(access_log_store);
        let documents = Arc::new(DocumentService::new(
            document_store,
            job_store,
            storage.clone(),
            ValidationService::new(config.storage.clone()),
            audit.handle(),
            clock.clone(),
            &config,
            default_engine,
        ));

        Self {
            config,
            clock,
            storage,
            documents,
            queue,
            audit,
        }
    }

    /// Start the OCR worker pool and sweeper.
    pub fn start_queue(&self) -> QueueHandle {
        self.queue.clone().start()
    }
}
