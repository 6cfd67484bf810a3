//! # coverdocs-ocr
//!
//! OCR pipeline for the coverdocs document service:
//! - [`engine`]: OCR engine adapters (HTTP provider + scriptable stub)
//! - [`service`]: validation and normalization over an engine
//! - [`queue`]: the priority job queue with leases, heartbeats, retry
//!   backoff, cancellation, and crash-safe resumption
//! - [`backoff`]: the retry delay schedule

pub mod backoff;
pub mod engine;
pub mod queue;
pub mod service;

pub use backoff::{backoff_delay, backoff_delay_with_jitter};
pub use engine::{HttpOcrEngine, StubOcrEngine};
pub use queue::{BatchEnqueueOutcome, OcrQueue, QueueConfig, QueueEvent, QueueHandle};
pub use service::{normalize_text, OcrService};
