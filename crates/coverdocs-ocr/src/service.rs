//! OCR processing service.
//!
//! Adapts the external engine behind a validate/normalize layer: gates on
//! supported formats, enforces a per-call deadline, validates the engine's
//! output, and shapes it into the [`OcrResultData`] that the metadata store
//! applies to job and document in one transaction.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use coverdocs_core::{
    defaults, EngineErrorKind, Error, OcrConfig, OcrEngine, OcrResultData, RawExtract, Result,
};

/// Validation and normalization over an [`OcrEngine`] capability.
pub struct OcrService {
    engine: Arc<dyn OcrEngine>,
    config: OcrConfig,
}

impl OcrService {
    pub fn new(engine: Arc<dyn OcrEngine>, config: OcrConfig) -> Self {
        Self { engine, config }
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    /// Run OCR over document bytes within `deadline`.
    ///
    /// Transient engine failures, timeouts and malformed results surface as
    /// retryable upstream errors; undecodable input surfaces as permanent.
    pub async fn process(
        &self,
        data: &[u8],
        mime_type: &str,
        options: &JsonValue,
        deadline: Duration,
    ) -> Result<OcrResultData> {
        if data.is_empty() {
            return Err(Error::Permanent("document content is empty".to_string()));
        }
        if !self.is_supported_format(mime_type) {
            return Err(Error::Permanent(format!(
                "unsupported format for OCR: {mime_type}"
            )));
        }

        let deadline = deadline.min(self.config.timeout);
        let call = self.engine.extract(data, mime_type, options, deadline);
        let raw = match tokio::time::timeout(deadline, call).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                return Err(match e.kind {
                    EngineErrorKind::Transient => Error::Upstream {
                        service: "ocr",
                        message: e.message,
                        retryable: true,
                    },
                    EngineErrorKind::Permanent => Error::Permanent(e.message),
                });
            }
            Err(_) => {
                warn!(
                    subsystem = "ocr",
                    component = "service",
                    op = "process",
                    deadline_ms = deadline.as_millis() as u64,
                    "OCR call exceeded deadline"
                );
                return Err(Error::upstream("ocr", "OCR call exceeded deadline"));
            }
        };

        self.validate_and_shape(raw, options)
    }

    fn is_supported_format(&self, mime_type: &str) -> bool {
        self.config
            .supported_formats
            .iter()
            .any(|f| f == mime_type)
    }

    /// Validate the engine output and normalize the extracted text.
    fn validate_and_shape(&self, raw: RawExtract, options: &JsonValue) -> Result<OcrResultData> {
        if !(0.0..=1.0).contains(&raw.confidence) {
            return Err(Error::upstream(
                "ocr",
                format!("confidence {} outside [0, 1]", raw.confidence),
            ));
        }
        if raw.page_count < 1 {
            return Err(Error::upstream(
                "ocr",
                format!("page_count {} below 1", raw.page_count),
            ));
        }

        let text = normalize_text(&raw.text);
        if text.is_empty() && !raw.no_text {
            // An empty result without the explicit no-text marker is an
            // engine glitch, not a blank document.
            return Err(Error::upstream("ocr", "empty text without no_text flag"));
        }

        if raw.confidence < defaults::OCR_MIN_CONFIDENCE {
            debug!(
                subsystem = "ocr",
                component = "service",
                confidence = raw.confidence,
                "Low-confidence OCR result"
            );
        }

        let word_count = raw
            .word_count
            .unwrap_or_else(|| text.split_whitespace().count() as i32);
        let language = raw
            .language
            .or_else(|| {
                options
                    .get("language")
                    .and_then(|v| v.as_str())
                    .map(String::from)
            })
            .unwrap_or_else(|| "auto".to_string());

        Ok(OcrResultData {
            character_count: text.chars().count() as i32,
            word_count,
            page_count: raw.page_count,
            confidence: raw.confidence,
            language,
            text,
            raw: raw.raw,
        })
    }
}

/// Normalize extracted text: unify line endings, strip control characters,
/// collapse runs of spaces and tabs, trim.
pub fn normalize_text(text: &str) -> String {
    let unified = text.replace("\r\n", "\n").replace('\r', "\n");

    let mut out = String::with_capacity(unified.len());
    let mut pending_space = false;
    for c in unified.chars() {
        match c {
            ' ' | '\t' => pending_space = true,
            '\n' => {
                // Newlines swallow pending horizontal whitespace.
                out.push('\n');
                pending_space = false;
            }
            c if c.is_control() => {}
            c => {
                if pending_space && !out.is_empty() && !out.ends_with('\n') {
                    out.push(' ');
                }
                pending_space = false;
                out.push(c);
            }
        }
    }
    out.trim_matches('\n').trim().to_string()
}
