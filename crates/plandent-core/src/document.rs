use std::path::Path;

use anyhow::{bail, Context, Result};
use bytes::Bytes;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_PNG: &str = "image/png";
pub const MIME_JPEG: &str = "image/jpeg";
pub const MIME_WEBP: &str = "image/webp";
pub const MIME_TEXT: &str = "text/plain";

const SUPPORTED_MIME_TYPES: &[&str] = &[MIME_PDF, MIME_PNG, MIME_JPEG, MIME_WEBP, MIME_TEXT];

/// A quote document to send to the model, immutable once loaded
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    bytes: Bytes,
    mime_type: String,
    /// File name, if loaded from disk
    name: Option<String>,
    /// BLAKE3 hex digest of the bytes
    fingerprint: String,
    /// Only known for PDFs
    page_count: Option<usize>,
}

impl SourceDocument {
    /// Load a document from disk, detecting its type from content then extension
    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read document {}", path.display()))?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase);
        let mime_type = sniff_mime(&bytes, extension.as_deref())
            .with_context(|| format!("Unsupported document type: {}", path.display()))?;

        let mut document = Self::from_bytes(bytes, mime_type)?;
        document.name = path.file_name().map(|n| n.to_string_lossy().to_string());
        Ok(document)
    }

    pub fn from_bytes(bytes: impl Into<Bytes>, mime_type: &str) -> Result<Self> {
        let bytes: Bytes = bytes.into();
        if bytes.is_empty() {
            bail!("Document is empty");
        }
        if !SUPPORTED_MIME_TYPES.contains(&mime_type) {
            bail!("Unsupported document type: {mime_type}");
        }

        let page_count = if mime_type == MIME_PDF {
            Some(pdf_page_count(&bytes)?)
        } else {
            None
        };
        let fingerprint = blake3::hash(&bytes).to_hex().to_string();

        tracing::debug!(
            mime_type,
            size = bytes.len(),
            ?page_count,
            "Loaded source document"
        );

        Ok(Self {
            bytes,
            mime_type: mime_type.to_string(),
            name: None,
            fingerprint,
            page_count,
        })
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn page_count(&self) -> Option<usize> {
        self.page_count
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Plain-text documents are sent inline as text rather than as a blob.
    pub fn as_text(&self) -> Option<&str> {
        if self.mime_type == MIME_TEXT {
            std::str::from_utf8(&self.bytes).ok()
        } else {
            None
        }
    }
}

/// Reject PDFs that cannot be parsed or have no pages before paying for a model call.
fn pdf_page_count(bytes: &[u8]) -> Result<usize> {
    let doc = lopdf::Document::load_mem(bytes).context("Failed to parse PDF")?;
    let pages = doc.get_pages().len();
    if pages == 0 {
        bail!("PDF has no pages");
    }
    Ok(pages)
}

/// Magic bytes first, file extension second, valid UTF-8 last.
pub fn sniff_mime(bytes: &[u8], extension: Option<&str>) -> Option<&'static str> {
    if bytes.starts_with(b"%PDF-") {
        return Some(MIME_PDF);
    }
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        return Some(MIME_PNG);
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some(MIME_JPEG);
    }
    if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some(MIME_WEBP);
    }
    match extension {
        Some("pdf") => Some(MIME_PDF),
        Some("png") => Some(MIME_PNG),
        Some("jpg" | "jpeg") => Some(MIME_JPEG),
        Some("webp") => Some(MIME_WEBP),
        Some("txt") | None if std::str::from_utf8(bytes).is_ok() => Some(MIME_TEXT),
        _ => None,
    }
}
