//! Upload validation policy.
//!
//! Layers the safety primitives into the service-level gate: closed MIME
//! allow-list, magic-byte agreement with the claim, per-type size limits,
//! filename sanitization, and a threat scan over text-bearing inputs.

use coverdocs_core::{
    check_file_safety, detect_content_type, extension_of, file_safety, is_valid_mime_type,
    sanitize_filename, scan_text_for_threats, Error, Result, StorageConfig,
};

/// Outcome of validating an upload.
#[derive(Debug, Clone)]
pub struct ValidatedUpload {
    /// Sanitized name the document will carry.
    pub file_name: String,
    /// Detected (not claimed) MIME type.
    pub mime_type: String,
    /// Extension class (pdf, jpeg, png, tiff).
    pub file_type: String,
}

/// Service-level validation over uploads.
pub struct ValidationService {
    config: StorageConfig,
}

impl ValidationService {
    pub fn new(config: StorageConfig) -> Self {
        Self { config }
    }

    /// Validate an upload, returning its sanitized identity.
    ///
    /// Hard errors short-circuit the upload path; nothing is stored for a
    /// rejected file.
    pub fn validate_upload(
        &self,
        filename: &str,
        data: &[u8],
        declared_mime: Option<&str>,
    ) -> Result<ValidatedUpload> {
        if data.is_empty() {
            return Err(Error::Validation("file is empty".to_string()));
        }
        if filename.trim().is_empty() {
            return Err(Error::Validation("filename is empty".to_string()));
        }
        if let Some(mime) = declared_mime {
            if !is_valid_mime_type(mime) {
                return Err(Error::Validation(format!("malformed MIME type: {mime}")));
            }
        }
        if scan_text_for_threats(filename).is_some() {
            return Err(Error::Validation(
                "filename contains a suspicious pattern".to_string(),
            ));
        }

        let verdict = check_file_safety(filename, data, self.config.max_file_size);
        if !verdict.allowed {
            return Err(Error::Validation(
                verdict
                    .block_reason
                    .unwrap_or_else(|| "file blocked by safety policy".to_string()),
            ));
        }

        // Trust the bytes over the claim.
        let detected = detect_content_type(data, declared_mime.unwrap_or("application/octet-stream"));
        if !self.config.allowed_mime_types.iter().any(|m| *m == detected) {
            return Err(Error::Validation(format!(
                "unsupported content type: {detected}"
            )));
        }

        let file_type = file_type_for(&detected, filename);
        let limit = coverdocs_core::defaults::size_limit_for(&file_type);
        if data.len() as i64 > limit {
            return Err(Error::Validation(format!(
                "file size {} exceeds {} limit of {}",
                data.len(),
                file_type,
                limit
            )));
        }

        // Text-bearing payloads get the injection scan; binary formats are
        // covered by the signature checks above.
        if detected.starts_with("text/") {
            if let Ok(text) = std::str::from_utf8(data) {
                if let Some(threat) = scan_text_for_threats(text) {
                    return Err(Error::Validation(format!(
                        "content failed security scan: {}",
                        threat.as_str()
                    )));
                }
            }
        }

        Ok(ValidatedUpload {
            file_name: sanitize_filename(filename),
            mime_type: detected,
            file_type,
        })
    }
}

/// Extension class for a detected MIME type, preferring the filename's own
/// extension when it agrees with the detection.
fn file_type_for(mime: &str, filename: &str) -> String {
    let canonical = match mime {
        "application/pdf" => "pdf",
        "image/jpeg" => "jpeg",
        "image/png" => "png",
        "image/tiff" => "tiff",
        _ => "bin",
    };
    if let Some(ext) = extension_of(filename) {
        let agrees = matches!(
            (canonical, ext.as_str()),
            ("pdf", "pdf")
                | ("jpeg", "jpg" | "jpeg")
                | ("png", "png")
                | ("tiff", "tif" | "tiff")
        );
        if agrees {
            return ext;
        }
    }
    canonical.to_string()
}

// Re-exported so callers can reach the signature table without a second
// import path.
pub use file_safety::SafetyVerdict;

#[cfg(test)]
mod tests {
    use super::*;

    const PDF: &[u8] = b"%PDF-1.7 minimal body";
    const PNG: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00];

    fn service() -> ValidationService {
        ValidationService::new(StorageConfig::default())
    }

    #[test]
    fn test_accepts_pdf() {
        let validated = service()
            .validate_upload("claim.pdf", PDF, Some("application/pdf"))
            .unwrap();
        assert_eq!(validated.file_name, "claim.pdf");
        assert_eq!(validated.mime_type, "application/pdf");
        assert_eq!(validated.file_type, "pdf");
    }

    #[test]
    fn test_accepts_png_with_wrong_claim() {
        // Magic bytes win over the declared type.
        let validated = service()
            .validate_upload("scan.png", PNG, Some("application/pdf"))
            .unwrap();
        assert_eq!(validated.mime_type, "image/png");
        assert_eq!(validated.file_type, "png");
    }

    #[test]
    fn test_rejects_empty_file() {
        assert!(matches!(
            service().validate_upload("a.pdf", b"", None),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_empty_filename() {
        assert!(matches!(
            service().validate_upload("   ", PDF, None),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_malformed_mime() {
        assert!(matches!(
            service().validate_upload("a.pdf", PDF, Some("not a mime")),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_executable() {
        let err = service()
            .validate_upload("update.pdf", b"MZ\x90\x00payload", None)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_rejects_unsupported_type() {
        // GIF magic bytes detect fine but are outside the allow-list.
        let gif = b"GIF89a\x01\x00\x01\x00";
        assert!(matches!(
            service().validate_upload("anim.gif", gif, Some("image/gif")),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_mismatched_binary_claim() {
        // Claimed PDF but no PDF magic bytes: downgraded, then rejected.
        assert!(matches!(
            service().validate_upload("fake.pdf", b"just some text", Some("application/pdf")),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_traversal_filename() {
        assert!(matches!(
            service().validate_upload("../../etc/passwd.pdf", PDF, None),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_sanitizes_filename() {
        let validated = service()
            .validate_upload("inv<2026>.pdf", PDF, Some("application/pdf"))
            .unwrap();
        assert_eq!(validated.file_name, "inv_2026_.pdf");
    }

    #[test]
    fn test_jpg_extension_preserved() {
        let jpeg = [0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46, 0x00];
        let validated = service()
            .validate_upload("photo.jpg", &jpeg, Some("image/jpeg"))
            .unwrap();
        assert_eq!(validated.file_type, "jpg");
    }
}
