//! Runtime configuration for the coverdocs core.
//!
//! Every section has sensible defaults from [`crate::defaults`] and a
//! `from_env()` constructor reading `COVERDOCS_*` variables, so embedded
//! deployments can construct configs in code while services configure
//! through the environment.

use std::time::Duration;

use crate::defaults;

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Worker pool and scheduler timing.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub worker_count: usize,
    /// Lease duration for a claimed job.
    pub lease_ttl: Duration,
    /// Safety window subtracted from the lease for the processing deadline.
    pub lease_grace: Duration,
    /// Poll interval when the queue is empty.
    pub empty_poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: defaults::WORKER_COUNT,
            lease_ttl: Duration::from_secs(defaults::LEASE_TTL_SECS),
            lease_grace: Duration::from_secs(defaults::LEASE_GRACE_SECS),
            empty_poll_interval: Duration::from_millis(defaults::EMPTY_POLL_INTERVAL_MS),
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `COVERDOCS_WORKER_COUNT` | `5` | Concurrent OCR workers |
    /// | `COVERDOCS_LEASE_TTL_SECS` | `600` | Job lease duration |
    /// | `COVERDOCS_LEASE_GRACE_SECS` | `30` | Deadline safety window |
    /// | `COVERDOCS_EMPTY_POLL_INTERVAL_MS` | `1000` | Empty-queue poll |
    pub fn from_env() -> Self {
        Self {
            worker_count: env_usize("COVERDOCS_WORKER_COUNT", defaults::WORKER_COUNT).max(1),
            lease_ttl: Duration::from_secs(env_u64(
                "COVERDOCS_LEASE_TTL_SECS",
                defaults::LEASE_TTL_SECS,
            )),
            lease_grace: Duration::from_secs(env_u64(
                "COVERDOCS_LEASE_GRACE_SECS",
                defaults::LEASE_GRACE_SECS,
            )),
            empty_poll_interval: Duration::from_millis(env_u64(
                "COVERDOCS_EMPTY_POLL_INTERVAL_MS",
                defaults::EMPTY_POLL_INTERVAL_MS,
            )),
        }
    }

    /// Heartbeat period: leases are renewed several times per lease TTL.
    pub fn heartbeat_interval(&self) -> Duration {
        self.lease_ttl / defaults::HEARTBEATS_PER_LEASE
    }

    /// Sweeper period: expired leases become re-leasable within one TTL.
    pub fn sweeper_interval(&self) -> Duration {
        self.lease_ttl / defaults::SWEEPS_PER_LEASE
    }

    /// Deadline handed to the OCR call: lease TTL minus the grace window.
    /// A grace at or above the TTL would leave no time to work at all, so
    /// the full TTL is used instead.
    pub fn processing_deadline(&self) -> Duration {
        let deadline = self.lease_ttl.saturating_sub(self.lease_grace);
        if deadline.is_zero() {
            self.lease_ttl
        } else {
            deadline
        }
    }

    pub fn with_worker_count(mut self, n: usize) -> Self {
        self.worker_count = n.max(1);
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    pub fn with_lease_grace(mut self, grace: Duration) -> Self {
        self.lease_grace = grace;
        self
    }

    pub fn with_empty_poll_interval(mut self, interval: Duration) -> Self {
        self.empty_poll_interval = interval;
        self
    }
}

/// Retry budget and backoff shape.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: i32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: defaults::JOB_MAX_RETRIES,
            backoff_base: Duration::from_secs(defaults::BACKOFF_BASE_SECS),
            backoff_max: Duration::from_secs(defaults::BACKOFF_MAX_SECS),
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Self {
        Self {
            max_retries: env_i64("COVERDOCS_MAX_RETRIES", defaults::JOB_MAX_RETRIES as i64) as i32,
            backoff_base: Duration::from_secs(env_u64(
                "COVERDOCS_BACKOFF_BASE_SECS",
                defaults::BACKOFF_BASE_SECS,
            )),
            backoff_max: Duration::from_secs(env_u64(
                "COVERDOCS_BACKOFF_MAX_SECS",
                defaults::BACKOFF_MAX_SECS,
            )),
        }
    }
}

/// Storage limits and URL issuance policy.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    pub max_file_size: i64,
    pub allowed_mime_types: Vec<String>,
    pub presign_ttl_max: Duration,
    pub owner_quota_bytes: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: defaults::STORAGE_BUCKET.to_string(),
            max_file_size: defaults::MAX_FILE_SIZE_BYTES,
            allowed_mime_types: defaults::ALLOWED_MIME_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            presign_ttl_max: Duration::from_secs(defaults::PRESIGN_TTL_MAX_SECS),
            owner_quota_bytes: defaults::OWNER_QUOTA_BYTES,
        }
    }
}

impl StorageConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self {
            max_file_size: env_i64(
                "COVERDOCS_MAX_FILE_SIZE_BYTES",
                defaults::MAX_FILE_SIZE_BYTES,
            ),
            presign_ttl_max: Duration::from_secs(env_u64(
                "COVERDOCS_PRESIGN_TTL_MAX_SECS",
                defaults::PRESIGN_TTL_MAX_SECS,
            )),
            owner_quota_bytes: env_i64("COVERDOCS_OWNER_QUOTA_BYTES", defaults::OWNER_QUOTA_BYTES),
            ..Default::default()
        };
        if let Ok(bucket) = std::env::var("COVERDOCS_STORAGE_BUCKET") {
            cfg.bucket = bucket;
        }
        cfg
    }
}

/// OCR pipeline limits.
#[derive(Debug, Clone)]
pub struct OcrConfig {
    pub timeout: Duration,
    pub supported_formats: Vec<String>,
    pub default_engine: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(defaults::OCR_TIMEOUT_SECS),
            supported_formats: defaults::OCR_SUPPORTED_FORMATS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            default_engine: defaults::DEFAULT_OCR_ENGINE.to_string(),
        }
    }
}

impl OcrConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self {
            timeout: Duration::from_secs(env_u64(
                "COVERDOCS_OCR_TIMEOUT_SECS",
                defaults::OCR_TIMEOUT_SECS,
            )),
            ..Default::default()
        };
        if let Ok(engine) = std::env::var("COVERDOCS_OCR_ENGINE") {
            cfg.default_engine = engine;
        }
        cfg
    }
}

/// Top-level configuration handed to the `Core` context at startup.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub storage: StorageConfig,
    pub ocr: OcrConfig,
}

impl CoreConfig {
    pub fn from_env() -> Self {
        Self {
            worker: WorkerConfig::from_env(),
            retry: RetryConfig::from_env(),
            storage: StorageConfig::from_env(),
            ocr: OcrConfig::from_env(),
        }
    }
}
