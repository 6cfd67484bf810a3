//! In-memory MetaStore.
//!
//! A single-process implementation of the three store traits behind one
//! mutex, with the same transition semantics as the PostgreSQL stores.
//! Used by the queue and service test suites and by embedded deployments
//! that do not need durability.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use coverdocs_core::{
    compute_etag, defaults, models::set_not_before, new_id, AccessLogEntry, AccessLogStore, Clock,
    Document, DocumentFilter, DocumentPage, DocumentPatch, DocumentStatus, DocumentStore,
    EnqueueJobRequest, Error, JobFilter, NewDocument, OcrJob, OcrJobStatus, OcrJobStore,
    OcrResultData, QueueStats, Result, ScanStatus, SystemClock,
};

use crate::documents::{decode_cursor, encode_cursor};

#[derive(Default)]
struct Inner {
    documents: HashMap<Uuid, Document>,
    jobs: HashMap<Uuid, OcrJob>,
    access_logs: Vec<AccessLogEntry>,
    /// Remaining appends to reject, for audit retry-path tests.
    append_failures: u32,
}

/// In-memory implementation of all three metadata store traits.
pub struct MemoryMetaStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    notify: Arc<Notify>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Make the next `n` access-log appends fail with a retryable error.
    pub async fn fail_next_appends(&self, n: u32) {
        self.inner.lock().await.append_failures = n;
    }

    fn now(&self) -> DateTime<Utc> {
        // Truncate to microseconds, matching timestamptz precision, so the
        // keyset cursor round-trips identically against both stores.
        let now = self.clock.utc_now();
        DateTime::from_timestamp_micros(now.timestamp_micros()).unwrap_or(now)
    }
}

impl Default for MemoryMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

fn matches_filter(doc: &Document, filter: &DocumentFilter) -> bool {
    if let Some(status) = filter.status {
        if doc.status != status {
            return false;
        }
    }
    if let Some(file_type) = &filter.file_type {
        if &doc.file_type != file_type {
            return false;
        }
    }
    if let Some(tag) = &filter.tag {
        if !doc.tags.contains(tag) {
            return false;
        }
    }
    if let Some(needle) = &filter.filename_contains {
        if !doc
            .file_name
            .to_lowercase()
            .contains(&needle.to_lowercase())
        {
            return false;
        }
    }
    if let Some(has_ocr) = filter.has_ocr {
        if doc.ocr_completed != has_ocr {
            return false;
        }
    }
    if let Some(after) = filter.created_after {
        if doc.created_at < after {
            return false;
        }
    }
    if let Some(before) = filter.created_before {
        if doc.created_at > before {
            return false;
        }
    }
    true
}

/// Apply a completed or terminally-failed OCR outcome to the document.
fn patch_document_ocr(
    documents: &mut HashMap<Uuid, Document>,
    document_id: Uuid,
    job_id: Uuid,
    result: Option<&OcrResultData>,
    now: DateTime<Utc>,
) {
    let Some(doc) = documents.get_mut(&document_id) else {
        return;
    };
    // Soft-deleted mid-processing: leave the row untouched. The outcome is
    // preserved on the job row, and a deleted document must keep
    // status = deleted.
    if doc.is_deleted() {
        return;
    }
    match result {
        Some(res) => {
            doc.ocr_completed = true;
            doc.ocr_job_id = Some(job_id);
            doc.ocr_text = Some(res.text.clone());
            doc.ocr_confidence = Some(res.confidence);
            doc.ocr_language = Some(res.language.clone());
            doc.ocr_page_count = Some(res.page_count);
            doc.ocr_word_count = Some(res.word_count);
            doc.status = DocumentStatus::Completed;
        }
        None if !doc.ocr_completed => {
            doc.status = DocumentStatus::Failed;
        }
        None => return,
    }
    doc.version += 1;
    doc.etag = compute_etag(document_id, doc.version);
    doc.updated_at = now;
}

#[async_trait]
impl DocumentStore for MemoryMetaStore {
    async fn insert(&self, doc: NewDocument) -> Result<Document> {
        let mut inner = self.inner.lock().await;
        if inner
            .documents
            .values()
            .any(|d| d.storage_key == doc.storage_key)
        {
            return Err(Error::Conflict(format!(
                "storage_key {} already exists",
                doc.storage_key
            )));
        }

        let id = new_id();
        let now = self.now();
        let document = Document {
            id,
            file_name: doc.file_name,
            original_filename: doc.original_filename,
            file_size: doc.file_size,
            mime_type: doc.mime_type,
            file_type: doc.file_type,
            file_hash: doc.file_hash,
            storage_key: doc.storage_key,
            storage_bucket: doc.storage_bucket,
            document_type: doc.document_type,
            status: DocumentStatus::Uploaded,
            owner_id: doc.owner_id,
            client_id: doc.client_id,
            insurer_id: doc.insurer_id,
            version: 1,
            etag: compute_etag(id, 1),
            security_scan_status: ScanStatus::Pending,
            virus_scan_status: ScanStatus::Pending,
            content_validated: doc.content_validated,
            ocr_completed: false,
            ocr_job_id: None,
            ocr_text: None,
            ocr_confidence: None,
            ocr_language: None,
            ocr_page_count: None,
            ocr_word_count: None,
            download_count: 0,
            last_accessed: None,
            tags: doc.tags,
            metadata: doc.metadata,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        inner.documents.insert(id, document.clone());
        Ok(document)
    }

    async fn get(&self, id: Uuid, include_deleted: bool) -> Result<Document> {
        let inner = self.inner.lock().await;
        match inner.documents.get(&id) {
            Some(doc) if include_deleted || !doc.is_deleted() => Ok(doc.clone()),
            _ => Err(Error::DocumentNotFound(id)),
        }
    }

    async fn list_by_owner(
        &self,
        owner_id: &str,
        cursor: Option<&str>,
        filter: &DocumentFilter,
        limit: i64,
    ) -> Result<DocumentPage> {
        let limit = limit.clamp(1, 500) as usize;
        let boundary = cursor.map(decode_cursor).transpose()?;

        let inner = self.inner.lock().await;
        let mut docs: Vec<Document> = inner
            .documents
            .values()
            .filter(|d| d.owner_id == owner_id && !d.is_deleted() && matches_filter(d, filter))
            .filter(|d| match boundary {
                Some((ts, id)) => (d.created_at, d.id) < (ts, id),
                None => true,
            })
            .cloned()
            .collect();
        docs.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));

        let next_cursor = if docs.len() > limit {
            docs.truncate(limit);
            docs.last().map(|d| encode_cursor(d.created_at, d.id))
        } else {
            None
        };

        Ok(DocumentPage {
            items: docs,
            next_cursor,
        })
    }

    async fn update(&self, id: Uuid, patch: DocumentPatch, if_match: &str) -> Result<Document> {
        if patch.is_empty() {
            return Err(Error::Validation("empty update patch".to_string()));
        }

        let now = self.now();
        let mut inner = self.inner.lock().await;
        let doc = inner
            .documents
            .get_mut(&id)
            .filter(|d| !d.is_deleted())
            .ok_or(Error::DocumentNotFound(id))?;
        if doc.etag != if_match {
            return Err(Error::PreconditionFailed(format!(
                "etag mismatch on document {}",
                id
            )));
        }
        if let Some(next) = patch.status {
            let allowed = matches!(
                (doc.status, next),
                (DocumentStatus::Uploaded, DocumentStatus::Completed)
                    | (DocumentStatus::Completed, DocumentStatus::Uploaded)
                    | (DocumentStatus::Uploaded, DocumentStatus::Uploaded)
                    | (DocumentStatus::Completed, DocumentStatus::Completed)
            );
            if !allowed {
                return Err(Error::Validation(format!(
                    "status may not move from {} to {} through update",
                    doc.status.as_str(),
                    next.as_str()
                )));
            }
            doc.status = next;
        }

        if let Some(file_name) = patch.file_name {
            doc.file_name = file_name;
        }
        if let Some(document_type) = patch.document_type {
            doc.document_type = Some(document_type);
        }
        if let Some(tags) = patch.tags {
            doc.tags = tags;
        }
        if let Some(metadata) = patch.metadata {
            doc.metadata = metadata;
        }
        if let Some(scan) = patch.security_scan_status {
            doc.security_scan_status = scan;
        }
        if let Some(scan) = patch.virus_scan_status {
            doc.virus_scan_status = scan;
        }
        doc.version += 1;
        doc.etag = compute_etag(id, doc.version);
        doc.updated_at = now;
        Ok(doc.clone())
    }

    async fn soft_delete(&self, id: Uuid, if_match: &str) -> Result<()> {
        let now = self.now();
        let mut inner = self.inner.lock().await;
        let doc = inner
            .documents
            .get_mut(&id)
            .ok_or(Error::DocumentNotFound(id))?;
        if doc.is_deleted() {
            return Ok(());
        }
        if doc.etag != if_match {
            return Err(Error::PreconditionFailed(format!(
                "etag mismatch on document {}",
                id
            )));
        }
        doc.status = DocumentStatus::Deleted;
        doc.deleted_at = Some(now);
        doc.version += 1;
        doc.etag = compute_etag(id, doc.version);
        doc.updated_at = now;
        Ok(())
    }

    async fn restore(&self, id: Uuid) -> Result<Document> {
        let now = self.now();
        let mut inner = self.inner.lock().await;
        let doc = inner
            .documents
            .get_mut(&id)
            .ok_or(Error::DocumentNotFound(id))?;
        if doc.is_deleted() {
            doc.status = DocumentStatus::Uploaded;
            doc.deleted_at = None;
            doc.version += 1;
            doc.etag = compute_etag(id, doc.version);
            doc.updated_at = now;
        }
        Ok(doc.clone())
    }

    async fn hard_delete(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.documents.remove(&id).is_none() {
            return Err(Error::DocumentNotFound(id));
        }
        // Foreign-key cascade semantics.
        inner.jobs.retain(|_, job| job.document_id != id);
        inner.access_logs.retain(|log| log.document_id != id);
        Ok(())
    }

    async fn increment_access_counters(&self, id: Uuid, delta_downloads: i64) -> Result<()> {
        let now = self.now();
        let mut inner = self.inner.lock().await;
        if let Some(doc) = inner.documents.get_mut(&id) {
            doc.download_count += delta_downloads.max(0);
            doc.last_accessed = Some(now);
        }
        Ok(())
    }

    async fn owner_usage_bytes(&self, owner_id: &str) -> Result<i64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .documents
            .values()
            .filter(|d| d.owner_id == owner_id && !d.is_deleted())
            .map(|d| d.file_size)
            .sum())
    }

    async fn find_by_owner_and_hash(
        &self,
        owner_id: &str,
        file_hash: &str,
        include_deleted: bool,
    ) -> Result<Option<Document>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .documents
            .values()
            .filter(|d| {
                d.owner_id == owner_id
                    && d.file_hash == file_hash
                    && (include_deleted || !d.is_deleted())
            })
            // Live rows win over revivable deleted ones.
            .min_by_key(|d| (d.is_deleted(), d.created_at, d.id))
            .cloned())
    }

    async fn storage_key_exists(&self, storage_key: &str) -> Result<bool> {
        let inner = self.inner.lock().await;
        Ok(inner
            .documents
            .values()
            .any(|d| d.storage_key == storage_key))
    }
}

#[async_trait]
impl OcrJobStore for MemoryMetaStore {
    async fn enqueue(&self, req: EnqueueJobRequest) -> Result<OcrJob> {
        if !(defaults::JOB_PRIORITY_MIN..=defaults::JOB_PRIORITY_MAX).contains(&req.priority) {
            return Err(Error::Validation(format!(
                "priority {} outside 1..=10",
                req.priority
            )));
        }

        let now = self.now();
        let mut inner = self.inner.lock().await;
        let linkable = inner
            .documents
            .get(&req.document_id)
            .map(|d| !d.is_deleted())
            .unwrap_or(false);
        if !linkable {
            return Err(Error::DocumentNotFound(req.document_id));
        }

        let job = OcrJob {
            id: new_id(),
            document_id: req.document_id,
            status: OcrJobStatus::Pending,
            priority: req.priority,
            language: req.language,
            engine: req.engine,
            options: req.options,
            result: None,
            extracted_text: None,
            confidence_score: None,
            page_count: None,
            word_count: None,
            character_count: None,
            error_message: None,
            error_code: None,
            retry_count: 0,
            max_retries: req.max_retries,
            lease_owner: None,
            lease_expires_at: None,
            processing_started_at: None,
            processing_completed_at: None,
            created_at: now,
            updated_at: now,
        };
        inner.jobs.insert(job.id, job.clone());
        drop(inner);
        self.notify.notify_waiters();
        Ok(job)
    }

    async fn lease_one(
        &self,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<Option<OcrJob>> {
        let now = self.now();
        let expires = now
            + chrono::Duration::from_std(lease_duration)
                .map_err(|e| Error::Config(e.to_string()))?;

        let mut inner = self.inner.lock().await;
        let next_id = inner
            .jobs
            .values()
            .filter(|job| {
                job.status == OcrJobStatus::Pending
                    && job.retry_count <= job.max_retries
                    && job.not_before().map(|nb| nb <= now).unwrap_or(true)
            })
            .min_by_key(|job| (job.priority, job.created_at, job.id))
            .map(|job| job.id);

        let Some(id) = next_id else { return Ok(None) };
        let job = inner
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::Internal("leased job vanished".to_string()))?;
        job.status = OcrJobStatus::Processing;
        job.lease_owner = Some(worker_id.to_string());
        job.lease_expires_at = Some(expires);
        job.processing_started_at.get_or_insert(now);
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn renew_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<()> {
        let now = self.now();
        let expires = now
            + chrono::Duration::from_std(lease_duration)
                .map_err(|e| Error::Config(e.to_string()))?;

        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get_mut(&job_id).ok_or(Error::LeaseLost(job_id))?;
        if job.status != OcrJobStatus::Processing || job.lease_owner.as_deref() != Some(worker_id)
        {
            return Err(Error::LeaseLost(job_id));
        }
        job.lease_expires_at = Some(expires);
        job.updated_at = now;
        Ok(())
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str, result: OcrResultData) -> Result<()> {
        let now = self.now();
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;
        let job = inner.jobs.get_mut(&job_id).ok_or(Error::LeaseLost(job_id))?;
        if job.status != OcrJobStatus::Processing || job.lease_owner.as_deref() != Some(worker_id)
        {
            return Err(Error::LeaseLost(job_id));
        }

        job.status = OcrJobStatus::Completed;
        job.result = Some(result.raw.clone());
        job.extracted_text = Some(result.text.clone());
        job.confidence_score = Some(result.confidence);
        job.page_count = Some(result.page_count);
        job.word_count = Some(result.word_count);
        job.character_count = Some(result.character_count);
        job.lease_owner = None;
        job.lease_expires_at = None;
        job.processing_completed_at = Some(now);
        job.updated_at = now;
        let document_id = job.document_id;

        patch_document_ocr(&mut inner.documents, document_id, job_id, Some(&result), now);
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error_code: &str,
        error_message: &str,
        retryable: bool,
        retry_backoff: Duration,
    ) -> Result<()> {
        let now = self.now();
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;
        let job = inner.jobs.get_mut(&job_id).ok_or(Error::LeaseLost(job_id))?;
        if job.status != OcrJobStatus::Processing || job.lease_owner.as_deref() != Some(worker_id)
        {
            return Err(Error::LeaseLost(job_id));
        }

        job.error_code = Some(error_code.to_string());
        job.error_message = Some(error_message.to_string());
        job.lease_owner = None;
        job.lease_expires_at = None;
        job.updated_at = now;

        if retryable && job.retry_count < job.max_retries {
            job.status = OcrJobStatus::Pending;
            job.retry_count += 1;
            let not_before = now
                + chrono::Duration::from_std(retry_backoff)
                    .map_err(|e| Error::Config(e.to_string()))?;
            set_not_before(&mut job.options, not_before);
            self.notify.notify_waiters();
        } else {
            job.status = OcrJobStatus::Failed;
            job.processing_completed_at = Some(now);
            let document_id = job.document_id;
            patch_document_ocr(&mut inner.documents, document_id, job_id, None, now);
        }
        Ok(())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<OcrJob> {
        let now = self.now();
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get_mut(&job_id).ok_or(Error::JobNotFound(job_id))?;
        match job.status {
            OcrJobStatus::Pending | OcrJobStatus::Processing => {
                job.status = OcrJobStatus::Cancelled;
                job.lease_owner = None;
                job.lease_expires_at = None;
                job.processing_completed_at.get_or_insert(now);
                job.updated_at = now;
                Ok(job.clone())
            }
            OcrJobStatus::Cancelled => Ok(job.clone()),
            status => Err(Error::Conflict(format!(
                "job {} is already {}",
                job_id,
                status.as_str()
            ))),
        }
    }

    async fn expire_leases(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let inner = &mut *inner;
        let expired: Vec<Uuid> = inner
            .jobs
            .values()
            .filter(|job| {
                job.status == OcrJobStatus::Processing
                    && job.lease_expires_at.map(|at| at < now).unwrap_or(false)
            })
            .map(|job| job.id)
            .collect();

        let mut repended = false;
        for id in &expired {
            let Some(job) = inner.jobs.get_mut(id) else {
                continue;
            };
            job.retry_count += 1;
            job.lease_owner = None;
            job.lease_expires_at = None;
            job.error_code = Some("lease_expired".to_string());
            job.error_message = Some("worker lease expired".to_string());
            job.updated_at = now;
            if job.retry_count <= job.max_retries {
                job.status = OcrJobStatus::Pending;
                repended = true;
            } else {
                job.status = OcrJobStatus::Failed;
                job.processing_completed_at = Some(now);
                let document_id = job.document_id;
                let job_id = job.id;
                patch_document_ocr(&mut inner.documents, document_id, job_id, None, now);
            }
        }
        if repended {
            self.notify.notify_waiters();
        }
        Ok(expired.len() as u64)
    }

    async fn get(&self, job_id: Uuid) -> Result<OcrJob> {
        let inner = self.inner.lock().await;
        inner
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(Error::JobNotFound(job_id))
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<OcrJob>> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<OcrJob> = inner
            .jobs
            .values()
            .filter(|job| {
                filter.status.map(|s| job.status == s).unwrap_or(true)
                    && filter
                        .document_id
                        .map(|d| job.document_id == d)
                        .unwrap_or(true)
            })
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.unwrap_or(defaults::JOB_PAGE_LIMIT).max(0) as usize;
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let now = self.now();
        let hour_ago = now - chrono::Duration::hours(1);
        let inner = self.inner.lock().await;

        let mut stats = QueueStats {
            pending: 0,
            processing: 0,
            completed_last_hour: 0,
            failed_last_hour: 0,
            total: inner.jobs.len() as i64,
        };
        for job in inner.jobs.values() {
            match job.status {
                OcrJobStatus::Pending => stats.pending += 1,
                OcrJobStatus::Processing => stats.processing += 1,
                OcrJobStatus::Completed => {
                    if job.processing_completed_at.map(|t| t > hour_ago).unwrap_or(false) {
                        stats.completed_last_hour += 1;
                    }
                }
                OcrJobStatus::Failed => {
                    if job.processing_completed_at.map(|t| t > hour_ago).unwrap_or(false) {
                        stats.failed_last_hour += 1;
                    }
                }
                OcrJobStatus::Cancelled => {}
            }
        }
        Ok(stats)
    }

    async fn cleanup(&self, keep_count: i64) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut terminal: Vec<(Option<DateTime<Utc>>, Uuid)> = inner
            .jobs
            .values()
            .filter(|job| job.status.is_terminal())
            .map(|job| (job.processing_completed_at, job.id))
            .collect();
        // Newest completions first; unfinished timestamps sort last.
        terminal.sort_by(|a, b| b.0.cmp(&a.0));

        let doomed: Vec<Uuid> = terminal
            .into_iter()
            .skip(keep_count.max(0) as usize)
            .map(|(_, id)| id)
            .collect();
        for id in &doomed {
            inner.jobs.remove(id);
        }
        Ok(doomed.len() as u64)
    }

    fn job_notify(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

#[async_trait]
impl AccessLogStore for MemoryMetaStore {
    async fn append(&self, entry: AccessLogEntry) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.append_failures > 0 {
            inner.append_failures -= 1;
            return Err(Error::upstream("metastore", "injected append failure"));
        }
        inner.access_logs.push(entry);
        Ok(())
    }

    async fn list_for_document(
        &self,
        document_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AccessLogEntry>> {
        let inner = self.inner.lock().await;
        let mut logs: Vec<AccessLogEntry> = inner
            .access_logs
            .iter()
            .filter(|log| log.document_id == document_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.accessed_at.cmp(&a.accessed_at));
        logs.truncate(limit.max(0) as usize);
        Ok(logs)
    }

    async fn count(&self) -> Result<i64> {
        let inner = self.inner.lock().await;
        Ok(inner.access_logs.len() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coverdocs_core::TestClock;
    use serde_json::json;

    fn new_document(owner: &str, key: &str, hash: &str) -> NewDocument {
        NewDocument {
            file_name: "claim.pdf".into(),
            original_filename: "claim.pdf".into(),
            file_size: 1024,
            mime_type: "application/pdf".into(),
            file_type: "pdf".into(),
            file_hash: hash.into(),
            storage_key: key.into(),
            storage_bucket: "test-bucket".into(),
            document_type: None,
            owner_id: owner.into(),
            client_id: None,
            insurer_id: None,
            content_validated: true,
            tags: vec!["claims".into()],
            metadata: json!({}),
        }
    }

    async fn store_with_doc() -> (MemoryMetaStore, Document) {
        let store = MemoryMetaStore::new();
        let doc = store
            .insert(new_document("u1", "documents/u1/2026/abc.pdf", &"a".repeat(64)))
            .await
            .unwrap();
        (store, doc)
    }

    #[tokio::test]
    async fn test_insert_assigns_version_and_etag() {
        let (_, doc) = store_with_doc().await;
        assert_eq!(doc.version, 1);
        assert_eq!(doc.etag, compute_etag(doc.id, 1));
        assert_eq!(doc.status, DocumentStatus::Uploaded);
    }

    #[tokio::test]
    async fn test_insert_rejects_storage_key_collision() {
        let (store, _) = store_with_doc().await;
        let err = store
            .insert(new_document("u2", "documents/u1/2026/abc.pdf", &"b".repeat(64)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_update_bumps_version_and_etag() {
        let (store, doc) = store_with_doc().await;
        let patch = DocumentPatch {
            file_name: Some("renamed.pdf".into()),
            ..Default::default()
        };
        let updated = store.update(doc.id, patch, &doc.etag).await.unwrap();
        assert_eq!(updated.version, 2);
        assert_ne!(updated.etag, doc.etag);
        assert_eq!(updated.file_name, "renamed.pdf");
    }

    #[tokio::test]
    async fn test_update_stale_etag_fails_without_changes() {
        let (store, doc) = store_with_doc().await;
        let patch = DocumentPatch {
            file_name: Some("a.pdf".into()),
            ..Default::default()
        };
        let after_first = store.update(doc.id, patch.clone(), &doc.etag).await.unwrap();

        // Second writer still holds the original etag.
        let err = store.update(doc.id, patch, &doc.etag).await.unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(_)));

        let current = DocumentStore::get(&store, doc.id, false).await.unwrap();
        assert_eq!(current.version, after_first.version);
        assert_eq!(current.etag, after_first.etag);
    }

    #[tokio::test]
    async fn test_update_rejects_disallowed_status_transition() {
        let (store, doc) = store_with_doc().await;
        let patch = DocumentPatch {
            status: Some(DocumentStatus::Deleted),
            ..Default::default()
        };
        let err = store.update(doc.id, patch, &doc.etag).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_soft_delete_idempotent() {
        let (store, doc) = store_with_doc().await;
        store.soft_delete(doc.id, &doc.etag).await.unwrap();
        // Second delete with a stale etag is still Ok on already-deleted.
        store.soft_delete(doc.id, &doc.etag).await.unwrap();

        assert!(matches!(
            DocumentStore::get(&store, doc.id, false).await,
            Err(Error::DocumentNotFound(_))
        ));
        let deleted = DocumentStore::get(&store, doc.id, true).await.unwrap();
        assert_eq!(deleted.status, DocumentStatus::Deleted);
        assert!(deleted.deleted_at.is_some());
    }

    #[tokio::test]
    async fn test_restore_round_trip() {
        let (store, doc) = store_with_doc().await;
        store.soft_delete(doc.id, &doc.etag).await.unwrap();
        let restored = store.restore(doc.id).await.unwrap();
        assert_eq!(restored.status, DocumentStatus::Uploaded);
        assert!(restored.deleted_at.is_none());
        assert_eq!(restored.version, 3);
    }

    #[tokio::test]
    async fn test_hard_delete_cascades() {
        let (store, doc) = store_with_doc().await;
        let job = store
            .enqueue(EnqueueJobRequest::new(doc.id))
            .await
            .unwrap();
        store
            .append(AccessLogEntry::new(
                doc.id,
                "u1",
                coverdocs_core::AccessType::Upload,
            ))
            .await
            .unwrap();

        store.hard_delete(doc.id).await.unwrap();
        assert!(matches!(
            OcrJobStore::get(&store, job.id).await,
            Err(Error::JobNotFound(_))
        ));
        assert_eq!(AccessLogStore::count(&store).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_download_counter_monotone() {
        let (store, doc) = store_with_doc().await;
        store.increment_access_counters(doc.id, 1).await.unwrap();
        store.increment_access_counters(doc.id, 1).await.unwrap();
        // Negative deltas never decrease the counter.
        store.increment_access_counters(doc.id, -5).await.unwrap();

        let current = DocumentStore::get(&store, doc.id, false).await.unwrap();
        assert_eq!(current.download_count, 2);
        assert!(current.last_accessed.is_some());
    }

    #[tokio::test]
    async fn test_owner_usage_excludes_deleted() {
        let (store, doc) = store_with_doc().await;
        store
            .insert(new_document("u1", "documents/u1/2026/def.pdf", &"c".repeat(64)))
            .await
            .unwrap();
        assert_eq!(store.owner_usage_bytes("u1").await.unwrap(), 2048);

        store.soft_delete(doc.id, &doc.etag).await.unwrap();
        assert_eq!(store.owner_usage_bytes("u1").await.unwrap(), 1024);
    }

    #[tokio::test]
    async fn test_lease_ordering_priority_then_fifo() {
        let clock = TestClock::new();
        let store = MemoryMetaStore::with_clock(clock.clone());
        let doc = store
            .insert(new_document("u1", "documents/u1/2026/abc.pdf", &"a".repeat(64)))
            .await
            .unwrap();

        let j1 = store
            .enqueue(EnqueueJobRequest::new(doc.id).with_priority(9))
            .await
            .unwrap();
        clock.advance(chrono::Duration::milliseconds(1));
        let j2 = store
            .enqueue(EnqueueJobRequest::new(doc.id).with_priority(1))
            .await
            .unwrap();
        clock.advance(chrono::Duration::milliseconds(1));
        let j3 = store
            .enqueue(EnqueueJobRequest::new(doc.id).with_priority(1))
            .await
            .unwrap();

        let lease = Duration::from_secs(600);
        let first = store.lease_one("w1", lease).await.unwrap().unwrap();
        let second = store.lease_one("w1", lease).await.unwrap().unwrap();
        let third = store.lease_one("w1", lease).await.unwrap().unwrap();
        assert_eq!(first.id, j2.id);
        assert_eq!(second.id, j3.id);
        assert_eq!(third.id, j1.id);
        assert!(store.lease_one("w1", lease).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lease_sets_processing_state() {
        let (store, doc) = store_with_doc().await;
        store.enqueue(EnqueueJobRequest::new(doc.id)).await.unwrap();

        let job = store
            .lease_one("w1", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, OcrJobStatus::Processing);
        assert_eq!(job.lease_owner.as_deref(), Some("w1"));
        assert!(job.lease_expires_at.is_some());
        assert!(job.processing_started_at.is_some());
    }

    #[tokio::test]
    async fn test_backoff_hides_job_until_not_before() {
        let clock = TestClock::new();
        let store = MemoryMetaStore::with_clock(clock.clone());
        let doc = store
            .insert(new_document("u1", "documents/u1/2026/abc.pdf", &"a".repeat(64)))
            .await
            .unwrap();
        store.enqueue(EnqueueJobRequest::new(doc.id)).await.unwrap();

        let lease = Duration::from_secs(600);
        let job = store.lease_one("w1", lease).await.unwrap().unwrap();
        store
            .fail(job.id, "w1", "upstream", "engine 503", true, Duration::from_secs(30))
            .await
            .unwrap();

        // Invisible while backing off.
        assert!(store.lease_one("w1", lease).await.unwrap().is_none());

        clock.advance(chrono::Duration::seconds(31));
        let retried = store.lease_one("w1", lease).await.unwrap().unwrap();
        assert_eq!(retried.id, job.id);
        assert_eq!(retried.retry_count, 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_finalizes_job_and_document() {
        let (store, doc) = store_with_doc().await;
        store.enqueue(EnqueueJobRequest::new(doc.id)).await.unwrap();

        let lease = Duration::from_secs(600);
        // Attempts 0..=3: three retries, then terminal failure.
        for attempt in 0..4 {
            let job = store.lease_one("w1", lease).await.unwrap().unwrap();
            assert_eq!(job.retry_count, attempt);
            store
                .fail(job.id, "w1", "upstream", "engine down", true, Duration::ZERO)
                .await
                .unwrap();
        }

        assert!(store.lease_one("w1", lease).await.unwrap().is_none());
        let jobs = store.list(&JobFilter::default()).await.unwrap();
        assert_eq!(jobs[0].status, OcrJobStatus::Failed);
        assert_eq!(jobs[0].retry_count, 3);

        let document = DocumentStore::get(&store, doc.id, false).await.unwrap();
        assert_eq!(document.status, DocumentStatus::Failed);
        assert!(!document.ocr_completed);
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let (store, doc) = store_with_doc().await;
        store.enqueue(EnqueueJobRequest::new(doc.id)).await.unwrap();

        let job = store
            .lease_one("w1", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        store
            .fail(job.id, "w1", "permanent", "unreadable", false, Duration::ZERO)
            .await
            .unwrap();

        let failed = OcrJobStore::get(&store, job.id).await.unwrap();
        assert_eq!(failed.status, OcrJobStatus::Failed);
        assert_eq!(failed.retry_count, 0);
    }

    #[tokio::test]
    async fn test_complete_updates_document_atomically() {
        let (store, doc) = store_with_doc().await;
        store.enqueue(EnqueueJobRequest::new(doc.id)).await.unwrap();
        let job = store
            .lease_one("w1", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();

        let result = OcrResultData {
            text: "Invoice #42".into(),
            confidence: 0.95,
            language: "en".into(),
            page_count: 1,
            word_count: 2,
            character_count: 11,
            raw: json!({"text": "Invoice #42"}),
        };
        store.complete(job.id, "w1", result).await.unwrap();

        let document = DocumentStore::get(&store, doc.id, false).await.unwrap();
        assert!(document.ocr_completed);
        assert_eq!(document.ocr_job_id, Some(job.id));
        assert_eq!(document.ocr_text.as_deref(), Some("Invoice #42"));
        assert_eq!(document.ocr_confidence, Some(0.95));
        assert_eq!(document.status, DocumentStatus::Completed);
        assert_eq!(document.version, 2);

        let completed = OcrJobStore::get(&store, job.id).await.unwrap();
        assert_eq!(completed.status, OcrJobStatus::Completed);
        assert!(completed.lease_owner.is_none());
    }

    #[tokio::test]
    async fn test_complete_after_soft_delete_leaves_document_untouched() {
        let (store, doc) = store_with_doc().await;
        store.enqueue(EnqueueJobRequest::new(doc.id)).await.unwrap();
        let job = store
            .lease_one("w1", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();

        // The owner deletes the document while OCR is in flight.
        store.soft_delete(doc.id, &doc.etag).await.unwrap();
        let deleted = DocumentStore::get(&store, doc.id, true).await.unwrap();

        let result = OcrResultData {
            text: "late result".into(),
            confidence: 0.9,
            language: "en".into(),
            page_count: 1,
            word_count: 2,
            character_count: 11,
            raw: json!({}),
        };
        store.complete(job.id, "w1", result).await.unwrap();

        // The outcome lives on the job row; the deleted row is untouched.
        let finished = OcrJobStore::get(&store, job.id).await.unwrap();
        assert_eq!(finished.status, OcrJobStatus::Completed);
        assert_eq!(finished.extracted_text.as_deref(), Some("late result"));

        let after = DocumentStore::get(&store, doc.id, true).await.unwrap();
        assert_eq!(after.status, DocumentStatus::Deleted);
        assert!(!after.ocr_completed);
        assert!(after.ocr_text.is_none());
        assert_eq!(after.version, deleted.version);
        assert_eq!(after.etag, deleted.etag);
    }

    #[tokio::test]
    async fn test_fail_after_soft_delete_leaves_document_untouched() {
        let (store, doc) = store_with_doc().await;
        store.enqueue(EnqueueJobRequest::new(doc.id)).await.unwrap();
        let job = store
            .lease_one("w1", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();

        store.soft_delete(doc.id, &doc.etag).await.unwrap();
        let deleted = DocumentStore::get(&store, doc.id, true).await.unwrap();

        store
            .fail(job.id, "w1", "permanent", "unreadable", false, Duration::ZERO)
            .await
            .unwrap();

        let after = DocumentStore::get(&store, doc.id, true).await.unwrap();
        assert_eq!(after.status, DocumentStatus::Deleted);
        assert_eq!(after.version, deleted.version);
    }

    #[tokio::test]
    async fn test_find_by_owner_and_hash_revives_deleted_only_on_request() {
        let (store, doc) = store_with_doc().await;
        store.soft_delete(doc.id, &doc.etag).await.unwrap();

        // Live-only lookup misses the soft-deleted duplicate.
        assert!(store
            .find_by_owner_and_hash("u1", &"a".repeat(64), false)
            .await
            .unwrap()
            .is_none());

        // Including deleted rows finds it.
        let found = store
            .find_by_owner_and_hash("u1", &"a".repeat(64), true)
            .await
            .unwrap()
            .expect("deleted duplicate should be visible");
        assert_eq!(found.id, doc.id);
        assert!(found.is_deleted());
    }

    #[tokio::test]
    async fn test_complete_by_non_owner_is_lease_lost() {
        let (store, doc) = store_with_doc().await;
        store.enqueue(EnqueueJobRequest::new(doc.id)).await.unwrap();
        let job = store
            .lease_one("w1", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();

        let result = OcrResultData {
            text: "x".into(),
            confidence: 0.9,
            language: "en".into(),
            page_count: 1,
            word_count: 1,
            character_count: 1,
            raw: json!({}),
        };
        let err = store.complete(job.id, "w2", result).await.unwrap_err();
        assert!(matches!(err, Error::LeaseLost(_)));
    }

    #[tokio::test]
    async fn test_terminal_status_never_changes() {
        let (store, doc) = store_with_doc().await;
        store.enqueue(EnqueueJobRequest::new(doc.id)).await.unwrap();
        let job = store
            .lease_one("w1", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        store
            .fail(job.id, "w1", "permanent", "bad", false, Duration::ZERO)
            .await
            .unwrap();

        // A worker that somehow retained the job cannot move it again.
        assert!(matches!(
            store.renew_lease(job.id, "w1", Duration::from_secs(1)).await,
            Err(Error::LeaseLost(_))
        ));
        assert!(matches!(
            store.cancel(job.id).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_pending_and_idempotency() {
        let (store, doc) = store_with_doc().await;
        let job = store.enqueue(EnqueueJobRequest::new(doc.id)).await.unwrap();

        let cancelled = store.cancel(job.id).await.unwrap();
        assert_eq!(cancelled.status, OcrJobStatus::Cancelled);
        // Cancelling again is a no-op, not an error.
        let again = store.cancel(job.id).await.unwrap();
        assert_eq!(again.status, OcrJobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_expire_leases_repends_with_incremented_retry() {
        let clock = TestClock::new();
        let store = MemoryMetaStore::with_clock(clock.clone());
        let doc = store
            .insert(new_document("u1", "documents/u1/2026/abc.pdf", &"a".repeat(64)))
            .await
            .unwrap();
        store.enqueue(EnqueueJobRequest::new(doc.id)).await.unwrap();

        let job = store
            .lease_one("w1", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();

        // Nothing expires while the lease is live.
        assert_eq!(store.expire_leases(clock.utc_now()).await.unwrap(), 0);

        clock.advance(chrono::Duration::seconds(601));
        assert_eq!(store.expire_leases(clock.utc_now()).await.unwrap(), 1);

        let repended = OcrJobStore::get(&store, job.id).await.unwrap();
        assert_eq!(repended.status, OcrJobStatus::Pending);
        assert_eq!(repended.retry_count, 1);
        assert!(repended.lease_owner.is_none());

        // The crashed worker's stale handle is dead.
        assert!(matches!(
            store.renew_lease(job.id, "w1", Duration::from_secs(600)).await,
            Err(Error::LeaseLost(_))
        ));

        // Another worker picks the job up.
        let released = store
            .lease_one("w2", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(released.id, job.id);
        assert_eq!(released.lease_owner.as_deref(), Some("w2"));
    }

    #[tokio::test]
    async fn test_expired_lease_with_exhausted_budget_fails_job() {
        let clock = TestClock::new();
        let store = MemoryMetaStore::with_clock(clock.clone());
        let doc = store
            .insert(new_document("u1", "documents/u1/2026/abc.pdf", &"a".repeat(64)))
            .await
            .unwrap();
        let mut req = EnqueueJobRequest::new(doc.id);
        req.max_retries = 0;
        store.enqueue(req).await.unwrap();

        let job = store
            .lease_one("w1", Duration::from_secs(600))
            .await
            .unwrap()
            .unwrap();
        clock.advance(chrono::Duration::seconds(601));
        store.expire_leases(clock.utc_now()).await.unwrap();

        let finalized = OcrJobStore::get(&store, job.id).await.unwrap();
        assert_eq!(finalized.status, OcrJobStatus::Failed);
        assert_eq!(finalized.error_code.as_deref(), Some("lease_expired"));
    }

    #[tokio::test]
    async fn test_enqueue_requires_live_document() {
        let (store, doc) = store_with_doc().await;
        store.soft_delete(doc.id, &doc.etag).await.unwrap();
        let err = store
            .enqueue(EnqueueJobRequest::new(doc.id))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DocumentNotFound(_)));
    }

    #[tokio::test]
    async fn test_enqueue_rejects_bad_priority() {
        let (store, doc) = store_with_doc().await;
        let err = store
            .enqueue(EnqueueJobRequest::new(doc.id).with_priority(0))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        let err = store
            .enqueue(EnqueueJobRequest::new(doc.id).with_priority(11))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_list_pagination_with_cursor() {
        let clock = TestClock::new();
        let store = MemoryMetaStore::with_clock(clock.clone());
        for i in 0..5 {
            store
                .insert(new_document(
                    "u1",
                    &format!("documents/u1/2026/{i}.pdf"),
                    &format!("{i}").repeat(64),
                ))
                .await
                .unwrap();
            clock.advance(chrono::Duration::seconds(1));
        }

        let filter = DocumentFilter::default();
        let page1 = store.list_by_owner("u1", None, &filter, 2).await.unwrap();
        assert_eq!(page1.items.len(), 2);
        let cursor = page1.next_cursor.clone().expect("more pages");

        let page2 = store
            .list_by_owner("u1", Some(&cursor), &filter, 2)
            .await
            .unwrap();
        assert_eq!(page2.items.len(), 2);

        let cursor = page2.next_cursor.clone().expect("one more page");
        let page3 = store
            .list_by_owner("u1", Some(&cursor), &filter, 2)
            .await
            .unwrap();
        assert_eq!(page3.items.len(), 1);
        assert!(page3.next_cursor.is_none());

        // Newest first, no duplicates across pages.
        let mut seen: Vec<Uuid> = Vec::new();
        for page in [&page1, &page2, &page3] {
            for doc in &page.items {
                assert!(!seen.contains(&doc.id));
                seen.push(doc.id);
            }
        }
        assert_eq!(seen.len(), 5);
    }

    #[tokio::test]
    async fn test_queue_stats() {
        let (store, doc) = store_with_doc().await;
        store.enqueue(EnqueueJobRequest::new(doc.id)).await.unwrap();
        store.enqueue(EnqueueJobRequest::new(doc.id)).await.unwrap();
        store.lease_one("w1", Duration::from_secs(600)).await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.total, 2);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_newest_terminal_jobs() {
        let clock = TestClock::new();
        let store = MemoryMetaStore::with_clock(clock.clone());
        let doc = store
            .insert(new_document("u1", "documents/u1/2026/abc.pdf", &"a".repeat(64)))
            .await
            .unwrap();

        for _ in 0..3 {
            let job = store.enqueue(EnqueueJobRequest::new(doc.id)).await.unwrap();
            store.cancel(job.id).await.unwrap();
            clock.advance(chrono::Duration::seconds(1));
        }
        let live = store.enqueue(EnqueueJobRequest::new(doc.id)).await.unwrap();

        let removed = store.cleanup(1).await.unwrap();
        assert_eq!(removed, 2);
        // Pending jobs are never cleaned up.
        assert!(OcrJobStore::get(&store, live.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_access_log_append_only_ordering() {
        let (store, doc) = store_with_doc().await;
        let clock_entries = 3;
        for i in 0..clock_entries {
            let mut entry =
                AccessLogEntry::new(doc.id, "u1", coverdocs_core::AccessType::View);
            entry.accessed_at = Utc::now() + chrono::Duration::seconds(i);
            store.append(entry).await.unwrap();
        }
        let logs = store.list_for_document(doc.id, 10).await.unwrap();
        assert_eq!(logs.len(), 3);
        assert!(logs[0].accessed_at >= logs[1].accessed_at);
        assert_eq!(AccessLogStore::count(&store).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_injected_append_failures() {
        let (store, doc) = store_with_doc().await;
        store.fail_next_appends(1).await;

        let entry = AccessLogEntry::new(doc.id, "u1", coverdocs_core::AccessType::View);
        let err = store.append(entry.clone()).await.unwrap_err();
        assert!(err.retryable());
        store.append(entry).await.unwrap();
        assert_eq!(AccessLogStore::count(&store).await.unwrap(), 1);
    }
}
