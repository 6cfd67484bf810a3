//! File safety primitives: content sniffing, executable blocking, filename
//! sanitization, and threat-pattern scanning.
//!
//! Multi-layer protection:
//! 1. Magic byte verification against the claimed document format
//! 2. Executable signature and extension blocking
//! 3. Threat-pattern scan over text content (SQLi, XSS, traversal)

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// Magic byte signatures for executable payloads that must never be stored.
pub const EXECUTABLE_SIGNATURES: &[(&str, &[u8])] = &[
    ("Windows PE/MZ", &[0x4D, 0x5A]),
    ("ELF", &[0x7F, 0x45, 0x4C, 0x46]),
    ("Mach-O 32", &[0xFE, 0xED, 0xFA, 0xCE]),
    ("Mach-O 64", &[0xFE, 0xED, 0xFA, 0xCF]),
    ("Mach-O Fat", &[0xCA, 0xFE, 0xBA, 0xBE]),
    ("WebAssembly", &[0x00, 0x61, 0x73, 0x6D]),
];

/// Blocked file extensions (case-insensitive).
static BLOCKED_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        // Windows executables
        "exe", "dll", "scr", "pif", "com", "msi", "bat", "cmd",
        // Unix binaries
        "so", "dylib", "out",
        // JVM
        "jar", "war", "class",
        // Scripts that execute on open
        "js", "vbs", "hta", "ps1",
        // Office macro containers
        "xlsm", "docm", "pptm",
        // Other dangerous
        "reg", "inf", "scf", "lnk", "url",
    ]
    .into_iter()
    .collect()
});

/// Threat patterns scanned over textual content and metadata values.
/// Sourced from the upload-validation rules: SQL injection probes, script
/// injection, and path traversal sequences.
static SQL_INJECTION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)\bUNION\b.*\bSELECT\b").unwrap(),
        Regex::new(r"(?i)\bDROP\b.*\bTABLE\b").unwrap(),
        Regex::new(r"(?i)\bINSERT\b.*\bINTO\b").unwrap(),
        Regex::new(r"(?i)'\s*OR\s*'").unwrap(),
        Regex::new(r"(?i)\b(EXEC|EXECUTE)\b\s").unwrap(),
    ]
});

static XSS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)<script[^>]*>").unwrap(),
        Regex::new(r"(?i)javascript:").unwrap(),
        Regex::new(r"(?i)\bon\w+\s*=").unwrap(),
        Regex::new(r"(?i)<(iframe|object|embed)[^>]*>").unwrap(),
    ]
});

static TRAVERSAL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"\.\.[\\/]").unwrap(),
        Regex::new(r"[\\/]\.\.").unwrap(),
        Regex::new(r"(?i)%2e%2e").unwrap(),
        Regex::new(r"(?i)\.\.%2f").unwrap(),
    ]
});

/// Result of a file safety check.
#[derive(Debug, Clone)]
pub struct SafetyVerdict {
    pub allowed: bool,
    pub block_reason: Option<String>,
    pub detected_type: Option<String>,
}

impl SafetyVerdict {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            block_reason: None,
            detected_type: None,
        }
    }

    pub fn blocked(reason: impl Into<String>, detected: impl Into<String>) -> Self {
        Self {
            allowed: false,
            block_reason: Some(reason.into()),
            detected_type: Some(detected.into()),
        }
    }
}

/// Check a payload against the executable blocklists and a size ceiling.
pub fn check_file_safety(filename: &str, data: &[u8], max_size_bytes: i64) -> SafetyVerdict {
    if data.len() as i64 > max_size_bytes {
        return SafetyVerdict::blocked(
            format!("File exceeds maximum size of {} bytes", max_size_bytes),
            "oversized",
        );
    }

    if let Some(ext) = extension_of(filename) {
        if BLOCKED_EXTENSIONS.contains(ext.as_str()) {
            return SafetyVerdict::blocked(
                format!("File extension .{} is not allowed", ext),
                format!("blocked_extension:{}", ext),
            );
        }
    }

    for (name, magic) in EXECUTABLE_SIGNATURES {
        if data.len() >= magic.len() && &data[..magic.len()] == *magic {
            return SafetyVerdict::blocked(
                format!("Executable content detected: {}", name),
                format!("executable:{}", name.to_lowercase().replace(' ', "_")),
            );
        }
    }

    SafetyVerdict::allowed()
}

/// Detect the actual content type from magic bytes.
///
/// Binary document formats (PDF, JPEG, PNG, TIFF) all carry magic bytes, so
/// a failed detection means the payload does not match its claim; such files
/// are downgraded to `application/octet-stream` rather than trusted.
pub fn detect_content_type(data: &[u8], claimed: &str) -> String {
    if let Some(kind) = infer::get(data) {
        return kind.mime_type().to_string();
    }
    if claimed.starts_with("text/") {
        return claimed.to_string();
    }
    "application/octet-stream".to_string()
}

/// Validate MIME type format per RFC 2045 (type/subtype).
pub fn is_valid_mime_type(mime: &str) -> bool {
    let parts: Vec<&str> = mime.split('/').collect();
    if parts.len() != 2 {
        return false;
    }
    let (media_type, subtype) = (parts[0], parts[1]);
    if media_type.is_empty() || subtype.is_empty() {
        return false;
    }
    let is_token_char = |c: char| -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '!' | '#' | '$' | '&' | '-' | '^' | '_' | '.' | '+')
    };
    media_type.chars().all(is_token_char) && subtype.chars().all(is_token_char)
}

/// Lower-cased extension of a filename, if any.
pub fn extension_of(filename: &str) -> Option<String> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext.to_lowercase()),
        _ => None,
    }
}

/// Sanitize a filename for safe storage.
///
/// Strips path components, replaces dangerous characters, and bounds the
/// length at 255 while preserving the extension.
pub fn sanitize_filename(filename: &str) -> String {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);

    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let sanitized = sanitized.trim();
    if sanitized.is_empty() {
        return "unnamed_file".to_string();
    }

    if sanitized.len() > 255 {
        if let Some(dot_pos) = sanitized.rfind('.') {
            let ext = &sanitized[dot_pos..];
            if ext.len() < 255 {
                let name = &sanitized[..255 - ext.len()];
                return format!("{}{}", name, ext);
            }
        }
        return sanitized[..255].to_string();
    }

    sanitized.to_string()
}

/// Category of threat found by [`scan_text_for_threats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreatKind {
    SqlInjection,
    ScriptInjection,
    PathTraversal,
}

impl ThreatKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatKind::SqlInjection => "sql_injection",
            ThreatKind::ScriptInjection => "script_injection",
            ThreatKind::PathTraversal => "path_traversal",
        }
    }
}

/// Scan text for injection and traversal patterns. Returns the first threat
/// category matched, if any.
pub fn scan_text_for_threats(text: &str) -> Option<ThreatKind> {
    if SQL_INJECTION_PATTERNS.iter().any(|p| p.is_match(text)) {
        return Some(ThreatKind::SqlInjection);
    }
    if XSS_PATTERNS.iter().any(|p| p.is_match(text)) {
        return Some(ThreatKind::ScriptInjection);
    }
    if TRAVERSAL_PATTERNS.iter().any(|p| p.is_match(text)) {
        return Some(ThreatKind::PathTraversal);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG_HEADER: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn test_blocks_exe_extension() {
        let verdict = check_file_safety("malware.exe", b"MZ\x90\x00", 1_000_000);
        assert!(!verdict.allowed);
        assert!(verdict.block_reason.unwrap().contains(".exe"));
    }

    #[test]
    fn test_blocks_pe_magic_without_extension() {
        let verdict = check_file_safety("invoice.bin", b"MZ\x90\x00", 1_000_000);
        assert!(!verdict.allowed);
        assert!(verdict.block_reason.unwrap().contains("Windows PE"));
    }

    #[test]
    fn test_blocks_elf() {
        let verdict = check_file_safety("scan", b"\x7FELF\x02\x01", 1_000_000);
        assert!(!verdict.allowed);
    }

    #[test]
    fn test_blocks_oversized() {
        let data = vec![0u8; 101];
        let verdict = check_file_safety("big.pdf", &data, 100);
        assert!(!verdict.allowed);
        assert!(verdict.block_reason.unwrap().contains("maximum size"));
    }

    #[test]
    fn test_allows_pdf() {
        let verdict = check_file_safety("claim.pdf", b"%PDF-1.7 content", 1_000_000);
        assert!(verdict.allowed);
    }

    #[test]
    fn test_allows_png() {
        let verdict = check_file_safety("scan.png", PNG_HEADER, 1_000_000);
        assert!(verdict.allowed);
    }

    #[test]
    fn test_detect_pdf() {
        assert_eq!(
            detect_content_type(b"%PDF-1.4 fake content", "application/octet-stream"),
            "application/pdf"
        );
    }

    #[test]
    fn test_detect_overrides_wrong_claim() {
        assert_eq!(detect_content_type(PNG_HEADER, "text/plain"), "image/png");
    }

    #[test]
    fn test_detect_downgrades_fake_pdf() {
        // Claimed binary format without matching magic bytes is garbage.
        assert_eq!(
            detect_content_type(b"not a pdf", "application/pdf"),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_detect_passes_text_claims() {
        assert_eq!(detect_content_type(b"plain words", "text/plain"), "text/plain");
    }

    #[test]
    fn test_mime_validation() {
        assert!(is_valid_mime_type("application/pdf"));
        assert!(is_valid_mime_type("image/svg+xml"));
        assert!(!is_valid_mime_type("pdf"));
        assert!(!is_valid_mime_type("application/"));
        assert!(!is_valid_mime_type("app lication/pdf"));
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("claim.PDF"), Some("pdf".to_string()));
        assert_eq!(extension_of("/tmp/a/scan.tiff"), Some("tiff".to_string()));
        assert_eq!(extension_of("noext"), None);
        assert_eq!(extension_of(".hidden"), None);
    }

    #[test]
    fn test_sanitize_removes_path() {
        assert_eq!(sanitize_filename("/etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\Users\\x\\claim.pdf"), "claim.pdf");
    }

    #[test]
    fn test_sanitize_replaces_dangerous_chars() {
        assert_eq!(sanitize_filename("inv<>:2026.pdf"), "inv___2026.pdf");
    }

    #[test]
    fn test_sanitize_empty() {
        assert_eq!(sanitize_filename(""), "unnamed_file");
        assert_eq!(sanitize_filename("   "), "unnamed_file");
    }

    #[test]
    fn test_sanitize_truncates_preserving_extension() {
        let long = format!("{}.pdf", "a".repeat(300));
        let out = sanitize_filename(&long);
        assert!(out.len() <= 255);
        assert!(out.ends_with(".pdf"));
    }

    #[test]
    fn test_scan_sql_injection() {
        assert_eq!(
            scan_text_for_threats("x' UNION SELECT password FROM users"),
            Some(ThreatKind::SqlInjection)
        );
        assert_eq!(
            scan_text_for_threats("DROP   TABLE documents"),
            Some(ThreatKind::SqlInjection)
        );
    }

    #[test]
    fn test_scan_script_injection() {
        assert_eq!(
            scan_text_for_threats("<script>alert(1)</script>"),
            Some(ThreatKind::ScriptInjection)
        );
        assert_eq!(
            scan_text_for_threats("<img onerror=steal()>"),
            Some(ThreatKind::ScriptInjection)
        );
    }

    #[test]
    fn test_scan_path_traversal() {
        assert_eq!(
            scan_text_for_threats("../../etc/shadow"),
            Some(ThreatKind::PathTraversal)
        );
    }

    #[test]
    fn test_scan_clean_text() {
        assert!(scan_text_for_threats("Invoice #42 for policy renewal").is_none());
        // Ordinary prose with SQL-ish words alone does not trip the scan.
        assert!(scan_text_for_threats("Please select the union rate table").is_none());
    }
}
