//! # coverdocs-services
//!
//! Service layer for the coverdocs document service:
//! - [`DocumentService`]: upload / read / download / update / delete
//!   orchestration with quota and authorization
//! - [`ValidationService`]: upload validation policy
//! - [`AccessLogger`]: non-blocking audit pipeline
//! - [`CachedIdentity`]: TTL token cache over the identity capability
//! - [`Core`]: the explicit context object wiring the capabilities together

pub mod access_log;
pub mod context;
pub mod documents;
pub mod identity;
pub mod validation;

pub use access_log::{AccessLogger, AuditHandle};
pub use context::Core;
pub use documents::{DeleteMode, DocumentService, DownloadGrant, UploadRequest};
pub use identity::{CachedIdentity, StaticIdentity};
pub use validation::{ValidatedUpload, ValidationService};
