//! OCR engine adapters.
//!
//! [`HttpOcrEngine`] speaks to an external OCR API over JSON; status codes
//! classify into transient (retry) or permanent (finalize) failures.
//! [`StubOcrEngine`] is a scriptable engine for tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use coverdocs_core::{EngineError, OcrEngine, RawExtract};

/// Request body sent to the OCR API.
#[derive(Debug, Serialize)]
struct ExtractRequest<'a> {
    document: String,
    mime_type: &'a str,
    #[serde(skip_serializing_if = "JsonValue::is_null")]
    options: &'a JsonValue,
}

/// Response body from the OCR API.
#[derive(Debug, Deserialize)]
struct ExtractResponse {
    text: Option<String>,
    confidence: Option<f64>,
    #[serde(default)]
    pages: Option<i32>,
    word_count: Option<i32>,
    language: Option<String>,
    #[serde(default)]
    no_text: bool,
}

/// HTTP adapter for an external OCR provider.
pub struct HttpOcrEngine {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    name: String,
}

impl HttpOcrEngine {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self::with_name(base_url, api_key, coverdocs_core::defaults::DEFAULT_OCR_ENGINE)
    }

    pub fn with_name(
        base_url: impl Into<String>,
        api_key: Option<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key,
            name: name.into(),
        }
    }

    fn classify_status(status: StatusCode) -> EngineError {
        let message = format!("OCR API returned {status}");
        if status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            EngineError::transient(message)
        } else {
            EngineError::permanent(message)
        }
    }
}

#[async_trait]
impl OcrEngine for HttpOcrEngine {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(
        &self,
        data: &[u8],
        mime_type: &str,
        options: &JsonValue,
        deadline: Duration,
    ) -> Result<RawExtract, EngineError> {
        let body = ExtractRequest {
            document: STANDARD.encode(data),
            mime_type,
            options,
        };

        let mut request = self
            .client
            .post(format!("{}/v1/ocr", self.base_url.trim_end_matches('/')))
            .timeout(deadline)
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                EngineError::transient(e.to_string())
            } else {
                EngineError::permanent(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            warn!(
                subsystem = "ocr",
                component = "engine",
                op = "extract",
                status = status.as_u16(),
                "OCR API error"
            );
            return Err(Self::classify_status(status));
        }

        let raw: JsonValue = response
            .json()
            .await
            .map_err(|e| EngineError::transient(format!("malformed OCR response: {e}")))?;
        let parsed: ExtractResponse = serde_json::from_value(raw.clone())
            .map_err(|e| EngineError::transient(format!("malformed OCR response: {e}")))?;

        debug!(
            subsystem = "ocr",
            component = "engine",
            op = "extract",
            pages = parsed.pages.unwrap_or(0),
            "OCR extraction returned"
        );

        Ok(RawExtract {
            text: parsed.text.unwrap_or_default(),
            confidence: parsed.confidence.unwrap_or(0.0),
            page_count: parsed.pages.unwrap_or(1),
            word_count: parsed.word_count,
            language: parsed.language,
            no_text: parsed.no_text,
            raw,
        })
    }
}

/// Scriptable engine for tests: queue outcomes, count calls, add latency.
pub struct StubOcrEngine {
    outcomes: Mutex<VecDeque<Result<RawExtract, EngineError>>>,
    fallback: RawExtract,
    delay: Duration,
    calls: AtomicUsize,
}

impl StubOcrEngine {
    /// An engine that always succeeds with the given text and confidence.
    pub fn succeeding(text: &str, confidence: f64) -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::new()),
            fallback: RawExtract {
                text: text.to_string(),
                confidence,
                page_count: 1,
                word_count: None,
                language: Some("en".to_string()),
                no_text: false,
                raw: serde_json::json!({ "text": text, "confidence": confidence }),
            },
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Queue an outcome consumed before the fallback applies.
    pub async fn push_outcome(&self, outcome: Result<RawExtract, EngineError>) {
        self.outcomes.lock().await.push_back(outcome);
    }

    /// Simulated per-call latency.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OcrEngine for StubOcrEngine {
    fn name(&self) -> &str {
        "stub"
    }

    async fn extract(
        &self,
        _data: &[u8],
        _mime_type: &str,
        _options: &JsonValue,
        _deadline: Duration,
    ) -> Result<RawExtract, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(outcome) = self.outcomes.lock().await.pop_front() {
            return outcome;
        }
        Ok(self.fallback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coverdocs_core::EngineErrorKind;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_status_classification() {
        assert_eq!(
            HttpOcrEngine::classify_status(StatusCode::SERVICE_UNAVAILABLE).kind,
            EngineErrorKind::Transient
        );
        assert_eq!(
            HttpOcrEngine::classify_status(StatusCode::TOO_MANY_REQUESTS).kind,
            EngineErrorKind::Transient
        );
        assert_eq!(
            HttpOcrEngine::classify_status(StatusCode::REQUEST_TIMEOUT).kind,
            EngineErrorKind::Transient
        );
        assert_eq!(
            HttpOcrEngine::classify_status(StatusCode::UNPROCESSABLE_ENTITY).kind,
            EngineErrorKind::Permanent
        );
        assert_eq!(
            HttpOcrEngine::classify_status(StatusCode::BAD_REQUEST).kind,
            EngineErrorKind::Permanent
        );
    }

    #[tokio::test]
    async fn test_extract_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/ocr"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "text": "Invoice #42",
                "confidence": 0.95,
                "pages": 2,
                "word_count": 2,
                "language": "en"
            })))
            .mount(&server)
            .await;

        let engine = HttpOcrEngine::new(server.uri(), Some("key".into()));
        let result = engine
            .extract(
                b"%PDF-1.7",
                "application/pdf",
                &serde_json::json!({}),
                Duration::from_secs(5),
            )
            .await
            .unwrap();

        assert_eq!(result.text, "Invoice #42");
        assert_eq!(result.confidence, 0.95);
        assert_eq!(result.page_count, 2);
        assert_eq!(result.language.as_deref(), Some("en"));
    }

    #[tokio::test]
    async fn test_extract_maps_5xx_to_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/ocr"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let engine = HttpOcrEngine::new(server.uri(), None);
        let err = engine
            .extract(b"x", "application/pdf", &JsonValue::Null, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Transient);
    }

    #[tokio::test]
    async fn test_extract_maps_422_to_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/ocr"))
            .respond_with(ResponseTemplate::new(422))
            .mount(&server)
            .await;

        let engine = HttpOcrEngine::new(server.uri(), None);
        let err = engine
            .extract(b"x", "application/pdf", &JsonValue::Null, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Permanent);
    }

    #[tokio::test]
    async fn test_stub_scripted_then_fallback() {
        let stub = StubOcrEngine::succeeding("ok", 0.9);
        stub.push_outcome(Err(EngineError::transient("503"))).await;

        let first = stub
            .extract(b"x", "application/pdf", &JsonValue::Null, Duration::from_secs(1))
            .await;
        assert!(first.is_err());

        let second = stub
            .extract(b"x", "application/pdf", &JsonValue::Null, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(second.text, "ok");
        assert_eq!(stub.calls(), 2);
    }
}
