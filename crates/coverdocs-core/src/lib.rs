//! # coverdocs-core
//!
//! Core types, traits, and abstractions for the coverdocs document service.
//!
//! This crate provides the foundational data structures, capability traits
//! and error taxonomy that the other coverdocs crates depend on.

pub mod clock;
pub mod config;
pub mod defaults;
pub mod error;
pub mod file_safety;
pub mod ids;
pub mod logging;
pub mod models;
pub mod secrets;
pub mod traits;

// Re-export commonly used types at crate root
pub use clock::{Clock, SystemClock, TestClock};
pub use config::{CoreConfig, OcrConfig, RetryConfig, StorageConfig, WorkerConfig};
pub use error::{Error, Result};
pub use file_safety::{
    check_file_safety, detect_content_type, extension_of, is_valid_mime_type, sanitize_filename,
    scan_text_for_threats, SafetyVerdict, ThreatKind,
};
pub use ids::{compute_etag, new_id, sha256_hex};
pub use models::*;
pub use secrets::{CachedSecrets, EnvSecretsProvider, SecretValue, SecretsProvider};
pub use traits::*;
