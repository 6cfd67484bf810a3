//! Core data models for coverdocs.
//!
//! These types are shared across all coverdocs crates and represent
//! the core domain entities: documents, OCR jobs, and access-log rows.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

// =============================================================================
// DOCUMENT TYPES
// =============================================================================

/// Document lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploaded,
    Processing,
    Completed,
    Failed,
    Deleted,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
            DocumentStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => DocumentStatus::Processing,
            "completed" => DocumentStatus::Completed,
            "failed" => DocumentStatus::Failed,
            "deleted" => DocumentStatus::Deleted,
            _ => DocumentStatus::Uploaded,
        }
    }
}

/// Security/virus scan status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Pending,
    Scanning,
    Clean,
    Threat,
    Infected,
    Error,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Scanning => "scanning",
            ScanStatus::Clean => "clean",
            ScanStatus::Threat => "threat",
            ScanStatus::Infected => "infected",
            ScanStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "scanning" => ScanStatus::Scanning,
            "clean" => ScanStatus::Clean,
            "threat" => ScanStatus::Threat,
            "infected" => ScanStatus::Infected,
            "error" => ScanStatus::Error,
            _ => ScanStatus::Pending,
        }
    }
}

/// A stored document with its metadata, OCR linkage and usage counters.
///
/// Rows are owned by the metadata store; services hold read-through copies
/// and every mutation goes through a typed store operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub file_name: String,
    pub original_filename: String,
    pub file_size: i64,
    pub mime_type: String,
    /// Extension class (pdf, jpeg, png, tiff).
    pub file_type: String,
    /// SHA-256 of the content, 64 lower-hex. Never rewritten in place.
    pub file_hash: String,
    pub storage_key: String,
    pub storage_bucket: String,
    /// Business document classification (invoice, policy, claim, ...).
    pub document_type: Option<String>,
    pub status: DocumentStatus,
    pub owner_id: String,
    pub client_id: Option<Uuid>,
    pub insurer_id: Option<Uuid>,
    /// Monotone version, starts at 1; bumped by exactly 1 on every mutation.
    pub version: i32,
    /// Opaque token derived from `(id, version)`.
    pub etag: String,
    pub security_scan_status: ScanStatus,
    pub virus_scan_status: ScanStatus,
    pub content_validated: bool,
    pub ocr_completed: bool,
    pub ocr_job_id: Option<Uuid>,
    pub ocr_text: Option<String>,
    pub ocr_confidence: Option<f64>,
    pub ocr_language: Option<String>,
    pub ocr_page_count: Option<i32>,
    pub ocr_word_count: Option<i32>,
    pub download_count: i64,
    pub last_accessed: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Non-null iff the document is soft-deleted.
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Document {
    /// Whether the document is soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Request for inserting a new document.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub file_name: String,
    pub original_filename: String,
    pub file_size: i64,
    pub mime_type: String,
    pub file_type: String,
    pub file_hash: String,
    pub storage_key: String,
    pub storage_bucket: String,
    pub document_type: Option<String>,
    pub owner_id: String,
    pub client_id: Option<Uuid>,
    pub insurer_id: Option<Uuid>,
    pub content_validated: bool,
    pub tags: Vec<String>,
    pub metadata: JsonValue,
}

/// Allow-listed document update.
///
/// Only these fields may change through `update_document`; OCR fields and
/// usage counters go through their dedicated operations.
#[derive(Debug, Clone, Default)]
pub struct DocumentPatch {
    pub file_name: Option<String>,
    pub document_type: Option<String>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<JsonValue>,
    /// Restricted to `uploaded` <-> `completed` transitions.
    pub status: Option<DocumentStatus>,
    pub security_scan_status: Option<ScanStatus>,
    pub virus_scan_status: Option<ScanStatus>,
}

impl DocumentPatch {
    pub fn is_empty(&self) -> bool {
        self.file_name.is_none()
            && self.document_type.is_none()
            && self.tags.is_none()
            && self.metadata.is_none()
            && self.status.is_none()
            && self.security_scan_status.is_none()
            && self.virus_scan_status.is_none()
    }
}

/// Filters for owner document listings.
#[derive(Debug, Clone, Default)]
pub struct DocumentFilter {
    pub status: Option<DocumentStatus>,
    pub file_type: Option<String>,
    pub tag: Option<String>,
    pub filename_contains: Option<String>,
    pub has_ocr: Option<bool>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

/// One page of an owner document listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentPage {
    pub items: Vec<Document>,
    /// Opaque cursor for the next page; `None` when exhausted.
    pub next_cursor: Option<String>,
}

// =============================================================================
// OCR JOB TYPES
// =============================================================================

/// OCR job processing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OcrJobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl OcrJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OcrJobStatus::Pending => "pending",
            OcrJobStatus::Processing => "processing",
            OcrJobStatus::Completed => "completed",
            OcrJobStatus::Failed => "failed",
            OcrJobStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => OcrJobStatus::Processing,
            "completed" => OcrJobStatus::Completed,
            "failed" => OcrJobStatus::Failed,
            "cancelled" => OcrJobStatus::Cancelled,
            _ => OcrJobStatus::Pending,
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OcrJobStatus::Completed | OcrJobStatus::Failed | OcrJobStatus::Cancelled
        )
    }
}

/// Options key holding the backoff visibility timestamp (RFC 3339).
///
/// Jobs whose `_not_before` lies in the future are invisible to the lease
/// predicate; this is how exponential backoff is implemented.
pub const NOT_BEFORE_KEY: &str = "_not_before";

/// An OCR job row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrJob {
    pub id: Uuid,
    pub document_id: Uuid,
    pub status: OcrJobStatus,
    /// 1 = highest, 10 = lowest.
    pub priority: i32,
    pub language: String,
    pub engine: String,
    /// Engine-specific options, passed through opaquely.
    pub options: JsonValue,
    pub result: Option<JsonValue>,
    pub extracted_text: Option<String>,
    pub confidence_score: Option<f64>,
    pub page_count: Option<i32>,
    pub word_count: Option<i32>,
    pub character_count: Option<i32>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    /// Non-null iff status = processing.
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub processing_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OcrJob {
    /// The backoff visibility timestamp, if one is set.
    pub fn not_before(&self) -> Option<DateTime<Utc>> {
        self.options
            .get(NOT_BEFORE_KEY)
            .and_then(|v| v.as_str())
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Write the backoff visibility timestamp into a job options map.
pub fn set_not_before(options: &mut JsonValue, at: DateTime<Utc>) {
    if !options.is_object() {
        *options = JsonValue::Object(serde_json::Map::new());
    }
    if let Some(map) = options.as_object_mut() {
        map.insert(NOT_BEFORE_KEY.to_string(), JsonValue::String(at.to_rfc3339()));
    }
}

/// Request for enqueueing an OCR job.
#[derive(Debug, Clone)]
pub struct EnqueueJobRequest {
    pub document_id: Uuid,
    pub priority: i32,
    pub language: String,
    pub engine: String,
    pub options: JsonValue,
    pub max_retries: i32,
}

impl EnqueueJobRequest {
    pub fn new(document_id: Uuid) -> Self {
        Self {
            document_id,
            priority: crate::defaults::DEFAULT_JOB_PRIORITY,
            language: "auto".to_string(),
            engine: crate::defaults::DEFAULT_OCR_ENGINE.to_string(),
            options: JsonValue::Object(serde_json::Map::new()),
            max_retries: crate::defaults::JOB_MAX_RETRIES,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = language.into();
        self
    }

    pub fn with_options(mut self, options: JsonValue) -> Self {
        self.options = options;
        self
    }
}

/// Validated OCR output applied to job and document in one transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrResultData {
    pub text: String,
    pub confidence: f64,
    pub language: String,
    pub page_count: i32,
    pub word_count: i32,
    pub character_count: i32,
    /// Raw engine payload, retained for audit and reprocessing.
    pub raw: JsonValue,
}

/// Filters for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<OcrJobStatus>,
    pub document_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Aggregate queue counters for the ops surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed_last_hour: i64,
    pub failed_last_hour: i64,
    pub total: i64,
}

// =============================================================================
// ACCESS LOG TYPES
// =============================================================================

/// Type of document access being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessType {
    View,
    Download,
    Upload,
    Update,
    Delete,
    Share,
    Copy,
}

impl AccessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessType::View => "view",
            AccessType::Download => "download",
            AccessType::Upload => "upload",
            AccessType::Update => "update",
            AccessType::Delete => "delete",
            AccessType::Share => "share",
            AccessType::Copy => "copy",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "download" => AccessType::Download,
            "upload" => AccessType::Upload,
            "update" => AccessType::Update,
            "delete" => AccessType::Delete,
            "share" => AccessType::Share,
            "copy" => AccessType::Copy,
            _ => AccessType::View,
        }
    }
}

/// One audit row. Append-only: the core never updates or deletes these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub id: Uuid,
    pub document_id: Uuid,
    pub user_id: String,
    pub access_type: AccessType,
    pub success: bool,
    pub http_status_code: Option<i32>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub response_time_ms: Option<i64>,
    pub file_size_downloaded: Option<i64>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
    pub session_id: Option<String>,
    pub accessed_at: DateTime<Utc>,
}

impl AccessLogEntry {
    pub fn new(document_id: Uuid, user_id: impl Into<String>, access_type: AccessType) -> Self {
        Self {
            id: crate::ids::new_id(),
            document_id,
            user_id: user_id.into(),
            access_type,
            success: true,
            http_status_code: None,
            error_code: None,
            error_message: None,
            response_time_ms: None,
            file_size_downloaded: None,
            ip_address: None,
            user_agent: None,
            request_id: None,
            session_id: None,
            accessed_at: Utc::now(),
        }
    }

    pub fn failed(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.success = false;
        self.error_code = Some(code.into());
        self.error_message = Some(message.into());
        self
    }

    pub fn with_response_time(mut self, ms: i64) -> Self {
        self.response_time_ms = Some(ms);
        self
    }

    pub fn with_downloaded(mut self, bytes: i64) -> Self {
        self.file_size_downloaded = Some(bytes);
        self
    }

    pub fn with_request_context(
        mut self,
        request_id: Option<String>,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Self {
        self.request_id = request_id;
        self.ip_address = ip_address;
        self.user_agent = user_agent;
        self
    }
}

// =============================================================================
// STORAGE TYPES
// =============================================================================

/// Descriptor of durably stored file content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredFile {
    pub bucket: String,
    pub key: String,
    /// SHA-256 of the content, 64 lower-hex.
    pub hash: String,
    pub size: i64,
    pub mime_type: String,
}

/// Metadata returned by a blob `head` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub size: i64,
    pub etag: String,
}

/// Operation a presigned URL authorizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresignOp {
    Get,
    Put,
}

impl PresignOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresignOp::Get => "get",
            PresignOp::Put => "put",
        }
    }
}

/// A short-lived credential-free URL for a specific key and operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresignedUrl {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

// =============================================================================
// IDENTITY TYPES
// =============================================================================

/// Role of an authenticated principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
    Service,
}

/// An authenticated actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    pub role: Role,
    pub permissions: Vec<String>,
}

impl Principal {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::User,
            permissions: Vec::new(),
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: Role::Admin,
            permissions: Vec::new(),
        }
    }

    /// Owner-or-admin authorization check.
    pub fn can_access(&self, owner_id: &str) -> bool {
        matches!(self.role, Role::Admin | Role::Service) || self.user_id == owner_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_status_round_trip() {
        for status in [
            DocumentStatus::Uploaded,
            DocumentStatus::Processing,
            DocumentStatus::Completed,
            DocumentStatus::Failed,
            DocumentStatus::Deleted,
        ] {
            assert_eq!(DocumentStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn test_document_status_unknown_fallback() {
        assert_eq!(DocumentStatus::parse("bogus"), DocumentStatus::Uploaded);
    }

    #[test]
    fn test_ocr_job_status_round_trip() {
        for status in [
            OcrJobStatus::Pending,
            OcrJobStatus::Processing,
            OcrJobStatus::Completed,
            OcrJobStatus::Failed,
            OcrJobStatus::Cancelled,
        ] {
            assert_eq!(OcrJobStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(OcrJobStatus::Completed.is_terminal());
        assert!(OcrJobStatus::Failed.is_terminal());
        assert!(OcrJobStatus::Cancelled.is_terminal());
        assert!(!OcrJobStatus::Pending.is_terminal());
        assert!(!OcrJobStatus::Processing.is_terminal());
    }

    #[test]
    fn test_access_type_round_trip() {
        for at in [
            AccessType::View,
            AccessType::Download,
            AccessType::Upload,
            AccessType::Update,
            AccessType::Delete,
            AccessType::Share,
            AccessType::Copy,
        ] {
            assert_eq!(AccessType::parse(at.as_str()), at);
        }
    }

    #[test]
    fn test_not_before_round_trip() {
        let mut options = serde_json::json!({"dpi": 300});
        let at = Utc::now() + chrono::Duration::seconds(90);
        set_not_before(&mut options, at);

        let job = sample_job(options);
        let parsed = job.not_before().expect("not_before should parse");
        assert_eq!(parsed.timestamp(), at.timestamp());
        // Existing keys survive.
        assert_eq!(job.options["dpi"], 300);
    }

    #[test]
    fn test_not_before_absent() {
        let job = sample_job(serde_json::json!({}));
        assert!(job.not_before().is_none());
    }

    #[test]
    fn test_set_not_before_on_non_object() {
        let mut options = JsonValue::Null;
        set_not_before(&mut options, Utc::now());
        assert!(options.get(NOT_BEFORE_KEY).is_some());
    }

    #[test]
    fn test_enqueue_request_defaults() {
        let req = EnqueueJobRequest::new(Uuid::nil());
        assert_eq!(req.priority, 5);
        assert_eq!(req.language, "auto");
        assert_eq!(req.max_retries, 3);
    }

    #[test]
    fn test_principal_access() {
        let owner = Principal::user("u1");
        assert!(owner.can_access("u1"));
        assert!(!owner.can_access("u2"));

        let admin = Principal::admin("ops");
        assert!(admin.can_access("u1"));
    }

    #[test]
    fn test_patch_is_empty() {
        assert!(DocumentPatch::default().is_empty());
        let patch = DocumentPatch {
            file_name: Some("renamed.pdf".into()),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }

    #[test]
    fn test_access_log_builder() {
        let entry = AccessLogEntry::new(Uuid::nil(), "u1", AccessType::Download)
            .with_response_time(12)
            .with_downloaded(1024);
        assert!(entry.success);
        assert_eq!(entry.response_time_ms, Some(12));
        assert_eq!(entry.file_size_downloaded, Some(1024));

        let failed = AccessLogEntry::new(Uuid::nil(), "u1", AccessType::View)
            .failed("forbidden", "not the owner");
        assert!(!failed.success);
        assert_eq!(failed.error_code.as_deref(), Some("forbidden"));
    }

    fn sample_job(options: JsonValue) -> OcrJob {
        OcrJob {
            id: Uuid::nil(),
            document_id: Uuid::nil(),
            status: OcrJobStatus::Pending,
            priority: 5,
            language: "auto".into(),
            engine: "mistral".into(),
            options,
            result: None,
            extracted_text: None,
            confidence_score: None,
            page_count: None,
            word_count: None,
            character_count: None,
            error_message: None,
            error_code: None,
            retry_count: 0,
            max_retries: 3,
            lease_owner: None,
            lease_expires_at: None,
            processing_started_at: None,
            processing_completed_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}
