//! Capability traits for coverdocs abstractions.
//!
//! These traits define the seams between the core and its collaborators:
//! the metadata store, the blob store, the OCR engine, and the identity
//! provider. Concrete implementations are pluggable; all correctness
//! guarantees (atomic leasing, single-transaction completion, optimistic
//! concurrency) are obligations of the implementations.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// METADATA STORE: DOCUMENTS
// =============================================================================

/// Typed operations over document rows.
///
/// Every mutation is one transaction. `version` increases by exactly 1 per
/// successful mutation and `etag` is recomputed from `(id, version)`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document at version 1. Rejects on `storage_key` collision.
    async fn insert(&self, doc: NewDocument) -> Result<Document>;

    /// Fetch by id. Soft-deleted rows are invisible unless `include_deleted`.
    async fn get(&self, id: Uuid, include_deleted: bool) -> Result<Document>;

    /// Page through an owner's live documents, `created_at DESC, id DESC`.
    /// The cursor is opaque to callers.
    async fn list_by_owner(
        &self,
        owner_id: &str,
        cursor: Option<&str>,
        filter: &DocumentFilter,
        limit: i64,
    ) -> Result<DocumentPage>;

    /// Apply an allow-listed patch guarded by the current ETag.
    async fn update(&self, id: Uuid, patch: DocumentPatch, if_match: &str) -> Result<Document>;

    /// Soft-delete guarded by the current ETag. Idempotent when already
    /// deleted.
    async fn soft_delete(&self, id: Uuid, if_match: &str) -> Result<()>;

    /// Un-delete a soft-deleted document.
    async fn restore(&self, id: Uuid) -> Result<Document>;

    /// Remove the row; OCR jobs and access logs cascade.
    async fn hard_delete(&self, id: Uuid) -> Result<()>;

    /// Atomically bump `download_count` and set `last_accessed`.
    async fn increment_access_counters(&self, id: Uuid, delta_downloads: i64) -> Result<()>;

    /// Sum of `file_size` over the owner's live documents.
    async fn owner_usage_bytes(&self, owner_id: &str) -> Result<i64>;

    /// Dedup candidate lookup by `(owner_id, file_hash)`. With
    /// `include_deleted`, soft-deleted rows are returned as well (live rows
    /// win when both exist): a deleted duplicate still reserves its
    /// `storage_key`, so upload revives it instead of colliding.
    async fn find_by_owner_and_hash(
        &self,
        owner_id: &str,
        file_hash: &str,
        include_deleted: bool,
    ) -> Result<Option<Document>>;

    /// Whether any document (including soft-deleted) references the key.
    /// Drives the orphan-blob sweeper.
    async fn storage_key_exists(&self, storage_key: &str) -> Result<bool>;
}

// =============================================================================
// METADATA STORE: OCR JOBS
// =============================================================================

/// Typed operations over OCR job rows — the scheduler's source of truth.
#[async_trait]
pub trait OcrJobStore: Send + Sync {
    /// Create a pending job. Fails unless the document exists and is not
    /// deleted (checked in the same transaction).
    async fn enqueue(&self, req: EnqueueJobRequest) -> Result<OcrJob>;

    /// Atomically claim the next visible pending job:
    /// `status = pending AND retry_count <= max_retries AND
    /// not_before <= now`, ordered `priority ASC, created_at ASC, id ASC`.
    /// At most one worker ever holds an active lease on a given job.
    async fn lease_one(&self, worker_id: &str, lease_duration: Duration)
        -> Result<Option<OcrJob>>;

    /// Extend a held lease. Returns `Error::LeaseLost` if the worker no
    /// longer holds it or the job left `processing`.
    async fn renew_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease_duration: Duration,
    ) -> Result<()>;

    /// In ONE transaction: finalize the job as completed with its result,
    /// clear the lease, and apply the OCR fields to the document (bumping
    /// its version/etag). Returns `Error::LeaseLost` if not the lease owner.
    async fn complete(&self, job_id: Uuid, worker_id: &str, result: OcrResultData) -> Result<()>;

    /// Record a failed attempt. If `retryable` and budget remains, the job
    /// returns to `pending` with `retry_count + 1` and a `_not_before`
    /// visibility timestamp `now + retry_backoff`. Otherwise the job
    /// finalizes as `failed` and the document status is set to `failed`
    /// when it has no prior completed OCR.
    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error_code: &str,
        error_message: &str,
        retryable: bool,
        retry_backoff: Duration,
    ) -> Result<()>;

    /// Transition `pending | processing -> cancelled`, clearing any lease.
    async fn cancel(&self, job_id: Uuid) -> Result<OcrJob>;

    /// Reset jobs whose lease expired before `now`. Expiry counts as a
    /// failed attempt; jobs that exhaust their budget finalize as `failed`.
    /// Returns the number of jobs touched.
    async fn expire_leases(&self, now: DateTime<Utc>) -> Result<u64>;

    async fn get(&self, job_id: Uuid) -> Result<OcrJob>;

    async fn list(&self, filter: &JobFilter) -> Result<Vec<OcrJob>>;

    async fn stats(&self) -> Result<QueueStats>;

    /// Delete oldest terminal jobs beyond `keep_count`; returns rows removed.
    /// Called by external retention sweepers.
    async fn cleanup(&self, keep_count: i64) -> Result<u64>;

    /// Wake handle signalled on every enqueue, so idle workers lease new
    /// work without waiting out the poll interval.
    fn job_notify(&self) -> Arc<Notify>;
}

// =============================================================================
// METADATA STORE: ACCESS LOG
// =============================================================================

/// Append-only audit log. The core never updates or deletes rows.
#[async_trait]
pub trait AccessLogStore: Send + Sync {
    async fn append(&self, entry: AccessLogEntry) -> Result<()>;

    /// Most recent entries for a document, newest first.
    async fn list_for_document(
        &self,
        document_id: Uuid,
        limit: i64,
    ) -> Result<Vec<AccessLogEntry>>;

    async fn count(&self) -> Result<i64>;
}

// =============================================================================
// BLOB STORE
// =============================================================================

/// Durable content-addressed object storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write an object; returns its etag. Overwrites are idempotent because
    /// keys are content-addressed.
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<String>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Issue a short-lived credential-free URL for the key and operation.
    async fn presign(&self, key: &str, op: PresignOp, ttl: Duration) -> Result<PresignedUrl>;

    /// Unconditional and idempotent.
    async fn delete(&self, key: &str) -> Result<()>;

    async fn head(&self, key: &str) -> Result<Option<BlobInfo>>;
}

// =============================================================================
// OCR ENGINE
// =============================================================================

/// How an engine failure should be treated by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineErrorKind {
    /// Timeouts, rate limits, 5xx — the attempt burns a retry.
    Transient,
    /// Unreadable or unsupported input — the job finalizes as failed.
    Permanent,
}

/// Typed error from an OCR engine.
#[derive(Debug, Clone, thiserror::Error)]
#[error("OCR engine error ({kind:?}): {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: EngineErrorKind::Permanent,
            message: message.into(),
        }
    }
}

/// Unvalidated output of an engine call.
#[derive(Debug, Clone)]
pub struct RawExtract {
    pub text: String,
    pub confidence: f64,
    pub page_count: i32,
    pub word_count: Option<i32>,
    pub language: Option<String>,
    /// Explicit "scanned page contains no text" marker; distinguishes an
    /// empty result from a failed one.
    pub no_text: bool,
    pub raw: JsonValue,
}

/// The external OCR capability.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Engine identifier recorded on jobs (e.g. "mistral").
    fn name(&self) -> &str;

    /// Extract text from a document within the given deadline.
    async fn extract(
        &self,
        data: &[u8],
        mime_type: &str,
        options: &JsonValue,
        deadline: Duration,
    ) -> std::result::Result<RawExtract, EngineError>;
}

// =============================================================================
// IDENTITY
// =============================================================================

/// Validates bearer tokens and returns principals.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Returns `Error::Unauthenticated` for unknown or expired tokens.
    async fn validate(&self, token: &str) -> Result<Principal>;
}
