//! Document service: upload, read, download, update, delete.
//!
//! Orchestrates validation, quota, storage, metadata, OCR enqueueing and
//! audit emission. Multi-step flows compose the typed store operations
//! explicitly; hard deletes tolerate partial failure and lean on the orphan
//! sweeper to finish the job.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};
use uuid::Uuid;

use coverdocs_core::{
    defaults, sha256_hex, AccessLogEntry, AccessType, Clock, CoreConfig, Document, DocumentFilter,
    DocumentPage, DocumentPatch, DocumentStore, EnqueueJobRequest, Error, JobFilter, NewDocument,
    OcrJobStore, PresignOp, Principal, Result,
};
use coverdocs_storage::StorageService;

use crate::access_log::AuditHandle;
use crate::validation::ValidationService;

/// How a delete should be carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Mark deleted; the blob stays until a sweeper collects it.
    Soft,
    /// Cancel open jobs, remove the blob, remove the row (cascading).
    Hard,
}

/// An upload request.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub filename: String,
    pub content: Vec<u8>,
    pub declared_mime: Option<String>,
    pub document_type: Option<String>,
    pub tags: Vec<String>,
    pub metadata: JsonValue,
    pub client_id: Option<Uuid>,
    pub insurer_id: Option<Uuid>,
    /// Queue OCR immediately after the upload lands.
    pub auto_ocr: bool,
    pub priority: Option<i32>,
    pub language: Option<String>,
}

impl UploadRequest {
    pub fn new(filename: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content,
            declared_mime: None,
            document_type: None,
            tags: Vec::new(),
            metadata: JsonValue::Object(serde_json::Map::new()),
            client_id: None,
            insurer_id: None,
            auto_ocr: true,
            priority: None,
            language: None,
        }
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.declared_mime = Some(mime.into());
        self
    }

    pub fn with_auto_ocr(mut self, auto_ocr: bool) -> Self {
        self.auto_ocr = auto_ocr;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Result of a download request: a short-lived URL, never the bytes.
#[derive(Debug, Clone)]
pub struct DownloadGrant {
    pub presigned_url: String,
    pub expires_at: DateTime<Utc>,
    pub file_size: i64,
}

/// Document orchestration over the metadata and storage capabilities.
pub struct DocumentService {
    documents: Arc<dyn DocumentStore>,
    jobs: Arc<dyn OcrJobStore>,
    storage: Arc<StorageService>,
    validation: ValidationService,
    audit: AuditHandle,
    clock: Arc<dyn Clock>,
    quota_bytes: i64,
    max_retries: i32,
    default_engine: String,
}

impl DocumentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        jobs: Arc<dyn OcrJobStore>,
        storage: Arc<StorageService>,
        validation: ValidationService,
        audit: AuditHandle,
        clock: Arc<dyn Clock>,
        config: &CoreConfig,
        default_engine: impl Into<String>,
    ) -> Self {
        Self {
            documents,
            jobs,
            storage,
            validation,
            audit,
            clock,
            quota_bytes: config.storage.owner_quota_bytes,
            max_retries: config.retry.max_retries,
            default_engine: default_engine.into(),
        }
    }

    /// Upload a document: validate, check quota, store, persist, and
    /// optionally queue OCR.
    ///
    /// Re-uploading content an owner already holds returns the existing
    /// document; the blob is stored exactly once either way.
    pub async fn upload(&self, principal: &Principal, req: UploadRequest) -> Result<Document> {
        let started = self.clock.instant_now();
        let owner = principal.user_id.as_str();

        let validated =
            self.validation
                .validate_upload(&req.filename, &req.content, req.declared_mime.as_deref())?;

        // Deleted rows are included: a soft-deleted duplicate still
        // reserves its storage key, so it is revived rather than re-created.
        let hash = sha256_hex(&req.content);
        if let Some(existing) = self
            .documents
            .find_by_owner_and_hash(owner, &hash, true)
            .await?
        {
            let document = self.revive_duplicate(existing).await?;
            debug!(
                subsystem = "documents",
                op = "upload",
                owner_id = %owner,
                document_id = %document.id,
                "Duplicate content, returning existing document"
            );
            self.audit.log(
                AccessLogEntry::new(document.id, owner, AccessType::Upload)
                    .with_response_time(started.elapsed().as_millis() as i64),
            );
            return Ok(document);
        }

        let size = req.content.len() as i64;
        let used_bytes = self.documents.owner_usage_bytes(owner).await?;
        if used_bytes + size > self.quota_bytes {
            return Err(Error::QuotaExceeded {
                used_bytes,
                quota_bytes: self.quota_bytes,
            });
        }

        let stored = self
            .storage
            .store(owner, &validated.file_name, &req.content, &validated.mime_type)
            .await?;

        let new_doc = NewDocument {
            file_name: validated.file_name,
            original_filename: req.filename.clone(),
            file_size: stored.size,
            mime_type: stored.mime_type.clone(),
            file_type: validated.file_type,
            file_hash: stored.hash.clone(),
            storage_key: stored.key.clone(),
            storage_bucket: stored.bucket.clone(),
            document_type: req.document_type.clone(),
            owner_id: owner.to_string(),
            client_id: req.client_id,
            insurer_id: req.insurer_id,
            content_validated: true,
            tags: req.tags.clone(),
            metadata: req.metadata.clone(),
        };

        let document = match self.documents.insert(new_doc).await {
            Ok(doc) => doc,
            Err(Error::Conflict(msg)) => {
                // A concurrent identical upload won the race; the blob is
                // shared, so just hand back the winner's row.
                let existing = self
                    .documents
                    .find_by_owner_and_hash(owner, &hash, true)
                    .await?
                    .ok_or(Error::Conflict(msg))?;
                self.revive_duplicate(existing).await?
            }
            Err(e) => return Err(e),
        };

        if req.auto_ocr {
            let priority = req.priority.unwrap_or(defaults::DEFAULT_JOB_PRIORITY);
            let language = req.language.clone().unwrap_or_else(|| "auto".to_string());
            let enqueue = EnqueueJobRequest {
                document_id: document.id,
                priority,
                language: language.clone(),
                engine: self.default_engine.clone(),
                options: serde_json::json!({ "language": language }),
                max_retries: self.max_retries,
            };
            match self.jobs.enqueue(enqueue).await {
                Ok(job) => debug!(
                    subsystem = "documents",
                    op = "upload",
                    document_id = %document.id,
                    job_id = %job.id,
                    priority,
                    "Queued OCR job"
                ),
                // The upload itself stands; OCR can be enqueued again.
                Err(e) => warn!(
                    subsystem = "documents",
                    op = "upload",
                    document_id = %document.id,
                    error = %e,
                    "Failed to queue OCR job"
                ),
            }
        }

        self.audit.log(
            AccessLogEntry::new(document.id, owner, AccessType::Upload)
                .with_response_time(started.elapsed().as_millis() as i64),
        );
        info!(
            subsystem = "documents",
            op = "upload",
            owner_id = %owner,
            document_id = %document.id,
            file_size = document.file_size,
            success = true,
            "Document uploaded"
        );
        Ok(document)
    }

    /// Read a document, enforcing owner-or-admin access.
    pub async fn get(&self, id: Uuid, principal: &Principal) -> Result<Document> {
        let document = self.documents.get(id, false).await?;
        self.authorize(&document, principal, AccessType::View)?;
        self.audit
            .log(AccessLogEntry::new(id, &principal.user_id, AccessType::View));
        Ok(document)
    }

    /// Page through an owner's documents.
    pub async fn list(
        &self,
        principal: &Principal,
        owner_id: &str,
        cursor: Option<&str>,
        filter: &DocumentFilter,
        limit: i64,
    ) -> Result<DocumentPage> {
        if !principal.can_access(owner_id) {
            return Err(Error::Forbidden(format!(
                "{} may not list documents of {}",
                principal.user_id, owner_id
            )));
        }
        self.documents
            .list_by_owner(owner_id, cursor, filter, limit)
            .await
    }

    /// Issue a short-lived download URL and record the access.
    pub async fn download(&self, id: Uuid, principal: &Principal) -> Result<DownloadGrant> {
        let started = self.clock.instant_now();
        let document = self.documents.get(id, false).await?;
        self.authorize(&document, principal, AccessType::Download)?;

        let presigned = self
            .storage
            .presign(
                &document.storage_key,
                PresignOp::Get,
                std::time::Duration::from_secs(defaults::DOWNLOAD_URL_TTL_SECS),
            )
            .await?;

        self.documents.increment_access_counters(id, 1).await?;
        self.audit.log(
            AccessLogEntry::new(id, &principal.user_id, AccessType::Download)
                .with_downloaded(document.file_size)
                .with_response_time(started.elapsed().as_millis() as i64),
        );

        Ok(DownloadGrant {
            presigned_url: presigned.url,
            expires_at: presigned.expires_at,
            file_size: document.file_size,
        })
    }

    /// Apply an allow-listed patch guarded by the document's ETag.
    pub async fn update(
        &self,
        id: Uuid,
        patch: DocumentPatch,
        if_match: &str,
        principal: &Principal,
    ) -> Result<Document> {
        let current = self.documents.get(id, false).await?;
        self.authorize(&current, principal, AccessType::Update)?;

        match self.documents.update(id, patch, if_match).await {
            Ok(document) => {
                self.audit
                    .log(AccessLogEntry::new(id, &principal.user_id, AccessType::Update));
                Ok(document)
            }
            Err(e) => {
                self.audit.log(
                    AccessLogEntry::new(id, &principal.user_id, AccessType::Update)
                        .failed(e.code(), e.to_string()),
                );
                Err(e)
            }
        }
    }

    /// Delete a document.
    ///
    /// Hard deletes tolerate partial failure: when the blob removal fails,
    /// the document stays in place and the error is surfaced; the orphan
    /// sweeper retries the blob later.
    pub async fn delete(&self, id: Uuid, mode: DeleteMode, principal: &Principal) -> Result<()> {
        let document = self.documents.get(id, true).await?;
        self.authorize(&document, principal, AccessType::Delete)?;

        match mode {
            DeleteMode::Soft => {
                if document.is_deleted() {
                    return Ok(());
                }
                self.documents.soft_delete(id, &document.etag).await?;
                self.audit
                    .log(AccessLogEntry::new(id, &principal.user_id, AccessType::Delete));
                info!(
                    subsystem = "documents",
                    op = "soft_delete",
                    document_id = %id,
                    "Document soft-deleted"
                );
                Ok(())
            }
            DeleteMode::Hard => {
                // Cancel whatever the queue still holds for this document.
                let open_jobs = self
                    .jobs
                    .list(&JobFilter {
                        document_id: Some(id),
                        ..Default::default()
                    })
                    .await?;
                for job in open_jobs.iter().filter(|j| !j.status.is_terminal()) {
                    if let Err(e) = self.jobs.cancel(job.id).await {
                        warn!(
                            subsystem = "documents",
                            op = "hard_delete",
                            job_id = %job.id,
                            error = %e,
                            "Failed to cancel job before hard delete"
                        );
                    }
                }

                self.storage.delete(&document.storage_key).await?;
                self.documents.hard_delete(id).await?;
                // The audit trail for this document cascades away with the
                // row; there is nothing durable left to record against.
                info!(
                    subsystem = "documents",
                    op = "hard_delete",
                    document_id = %id,
                    storage_key = %document.storage_key,
                    "Document hard-deleted"
                );
                Ok(())
            }
        }
    }

    /// Un-delete a soft-deleted document.
    pub async fn restore(&self, id: Uuid, principal: &Principal) -> Result<Document> {
        let document = self.documents.get(id, true).await?;
        self.authorize(&document, principal, AccessType::Update)?;
        let restored = self.documents.restore(id).await?;
        self.audit
            .log(AccessLogEntry::new(id, &principal.user_id, AccessType::Update));
        Ok(restored)
    }

    /// Hand back a duplicate-content document, un-deleting it first when
    /// the earlier copy was soft-deleted.
    async fn revive_duplicate(&self, existing: Document) -> Result<Document> {
        if !existing.is_deleted() {
            return Ok(existing);
        }
        info!(
            subsystem = "documents",
            op = "upload",
            document_id = %existing.id,
            "Restoring soft-deleted duplicate"
        );
        self.documents.restore(existing.id).await
    }

    fn authorize(
        &self,
        document: &Document,
        principal: &Principal,
        access_type: AccessType,
    ) -> Result<()> {
        if principal.can_access(&document.owner_id) {
            return Ok(());
        }
        self.audit.log(
            AccessLogEntry::new(document.id, &principal.user_id, access_type)
                .failed("forbidden", "principal is not the owner"),
        );
        Err(Error::Forbidden(format!(
            "{} may not access document {}",
            principal.user_id, document.id
        )))
    }
}
