//! # coverdocs-storage
//!
//! Blob storage for the coverdocs document service:
//! - [`FsBlobStore`]: filesystem-backed blob store with atomic writes and
//!   HMAC-signed presigned URLs
//! - [`MemoryBlobStore`]: in-memory store for tests
//! - [`StorageService`]: hashing, deduplication, size policy, URL issuance
//!   and orphan sweeping over any [`coverdocs_core::BlobStore`]

pub mod fs;
pub mod memory;
pub mod service;
pub mod sign;

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;
pub use service::StorageService;
