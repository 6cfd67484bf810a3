//! Structured logging schema and field name constants for coverdocs.
//!
//! All crates use these constants for consistent structured logging fields,
//! so log aggregation tools can query by standardized field names across
//! every subsystem.
//!
//! ## Log Level Contract
//!
//! | Level | Usage |
//! |-------|-------|
//! | ERROR | Degraded service, requires operator attention |
//! | WARN  | Recoverable issue, automatic fallback applied |
//! | INFO  | Lifecycle events (startup, shutdown), operation completions |
//! | DEBUG | Decision points, intermediate values, config choices |
//! | TRACE | Per-item iteration, high-volume data |

// ─── Identity fields ───────────────────────────────────────────────────────

/// Correlation ID propagated across request → job → sub-calls.
pub const REQUEST_ID: &str = "request_id";

/// Subsystem originating the log event.
/// Values: "storage", "db", "ocr", "queue", "documents", "audit"
pub const SUBSYSTEM: &str = "subsystem";

/// Component within a subsystem.
/// Examples: "worker", "sweeper", "pool", "blobstore", "engine"
pub const COMPONENT: &str = "component";

/// Logical operation name.
/// Examples: "upload", "lease_one", "complete", "presign"
pub const OPERATION: &str = "op";

// ─── Entity fields ─────────────────────────────────────────────────────────

/// Document UUID being operated on.
pub const DOCUMENT_ID: &str = "document_id";

/// OCR job UUID being processed.
pub const JOB_ID: &str = "job_id";

/// Worker id holding (or contending for) a lease.
pub const WORKER_ID: &str = "worker_id";

/// Principal on whose behalf the operation runs.
pub const OWNER_ID: &str = "owner_id";

/// Blob storage key.
pub const STORAGE_KEY: &str = "storage_key";

// ─── Measurement fields ────────────────────────────────────────────────────

/// Wall-clock duration in milliseconds.
pub const DURATION_MS: &str = "duration_ms";

/// File or payload size in bytes.
pub const FILE_SIZE: &str = "file_size";

/// Job priority (1 = highest).
pub const PRIORITY: &str = "priority";

/// Retry attempt number.
pub const RETRY_COUNT: &str = "retry_count";

/// Number of rows/jobs affected by a bulk operation.
pub const AFFECTED: &str = "affected";

// ─── Outcome fields ────────────────────────────────────────────────────────

/// Boolean success/failure indicator.
pub const SUCCESS: &str = "success";

/// Error message when an operation fails.
pub const ERROR_MSG: &str = "error";

/// Whether a failure is classified retryable.
pub const RETRYABLE: &str = "retryable";
