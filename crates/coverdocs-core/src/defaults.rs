//! Centralized default constants for the coverdocs system.
//!
//! **This module is the single source of truth** for all shared default
//! values. Crates reference these constants instead of defining their own
//! magic numbers. When adding new constants, place them in the appropriate
//! section and document the rationale for the chosen value.

// =============================================================================
// WORKER POOL
// =============================================================================

/// Number of concurrent OCR workers per process.
pub const WORKER_COUNT: usize = 5;

/// Lease duration for a claimed job (2x the expected OCR latency).
pub const LEASE_TTL_SECS: u64 = 600;

/// Grace window subtracted from the lease when computing the processing
/// deadline, so a worker aborts before its lease can expire underneath it.
pub const LEASE_GRACE_SECS: u64 = 30;

/// Poll interval when the queue is empty and no wake signal arrives.
pub const EMPTY_POLL_INTERVAL_MS: u64 = 1000;

/// Heartbeats renew the lease this many times per lease period.
pub const HEARTBEATS_PER_LEASE: u32 = 3;

/// The lease-expiry sweeper runs this many times per lease period.
pub const SWEEPS_PER_LEASE: u32 = 4;

// =============================================================================
// RETRY
// =============================================================================

/// Default maximum retry count for failed jobs (total attempts = retries + 1).
pub const JOB_MAX_RETRIES: i32 = 3;

/// Exponential backoff base delay.
pub const BACKOFF_BASE_SECS: u64 = 30;

/// Exponential backoff ceiling.
pub const BACKOFF_MAX_SECS: u64 = 1800;

// =============================================================================
// STORAGE
// =============================================================================

/// Global upload size ceiling (50 MiB).
pub const MAX_FILE_SIZE_BYTES: i64 = 50 * 1024 * 1024;

/// Per-extension-class upload limits. Image scans are bounded tighter than
/// PDFs, which may legitimately run to hundreds of pages.
pub const FILE_TYPE_SIZE_LIMITS: &[(&str, i64)] = &[
    ("pdf", 50 * 1024 * 1024),
    ("jpeg", 20 * 1024 * 1024),
    ("jpg", 20 * 1024 * 1024),
    ("png", 20 * 1024 * 1024),
    ("tiff", 30 * 1024 * 1024),
    ("tif", 30 * 1024 * 1024),
];

/// Closed set of accepted upload MIME types.
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "image/jpeg",
    "image/png",
    "image/tiff",
];

/// Hard ceiling on presigned URL lifetime.
pub const PRESIGN_TTL_MAX_SECS: u64 = 3600;

/// Lifetime of download URLs issued by the document service.
pub const DOWNLOAD_URL_TTL_SECS: u64 = 3600;

/// Per-owner storage quota (1 GiB). Sum of live document sizes.
pub const OWNER_QUOTA_BYTES: i64 = 1024 * 1024 * 1024;

/// Default storage bucket name.
pub const STORAGE_BUCKET: &str = "coverdocs-documents";

// =============================================================================
// OCR
// =============================================================================

/// Per-call timeout for the external OCR engine.
pub const OCR_TIMEOUT_SECS: u64 = 300;

/// MIME types the OCR pipeline accepts.
pub const OCR_SUPPORTED_FORMATS: &[&str] = &[
    "application/pdf",
    "image/jpeg",
    "image/png",
    "image/tiff",
];

/// Default OCR engine identifier.
pub const DEFAULT_OCR_ENGINE: &str = "mistral";

/// Default job priority (1 = highest, 10 = lowest).
pub const DEFAULT_JOB_PRIORITY: i32 = 5;

/// Valid job priority range.
pub const JOB_PRIORITY_MIN: i32 = 1;
pub const JOB_PRIORITY_MAX: i32 = 10;

/// Maximum documents per batch enqueue request.
pub const BATCH_ENQUEUE_MAX: usize = 100;

/// Minimum confidence below which a result is logged as low-quality.
pub const OCR_MIN_CONFIDENCE: f64 = 0.5;

// =============================================================================
// AUDIT
// =============================================================================

/// Capacity of the bounded in-memory access-log retry queue. Overflow
/// increments a dropped counter but never blocks the request path.
pub const ACCESS_LOG_QUEUE_CAPACITY: usize = 1000;

/// Append attempts per entry before it is dropped.
pub const ACCESS_LOG_MAX_ATTEMPTS: u32 = 3;

// =============================================================================
// CACHING
// =============================================================================

/// TTL for cached secrets.
pub const SECRETS_CACHE_TTL_SECS: u64 = 300;

/// TTL for cached token-to-principal resolutions.
pub const AUTH_TOKEN_CACHE_TTL_SECS: u64 = 300;

// =============================================================================
// PAGINATION
// =============================================================================

/// Default page size for document listings.
pub const PAGE_LIMIT: i64 = 50;

/// Default page size for job listings.
pub const JOB_PAGE_LIMIT: i64 = 50;

/// Size limit per file type, falling back to the global ceiling.
pub fn size_limit_for(file_type: &str) -> i64 {
    FILE_TYPE_SIZE_LIMITS
        .iter()
        .find(|(ext, _)| *ext == file_type)
        .map(|(_, limit)| *limit)
        .unwrap_or(MAX_FILE_SIZE_BYTES)
}
