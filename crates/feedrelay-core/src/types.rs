//! Canonical message envelope produced by every source

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use tempfile::TempPath;

use crate::error::{RelayError, Result};

/// Handle to a downloaded document on local disk.
///
/// The backing file is removed when the handle is dropped, so a message that
/// finishes processing, fails, panics or is cancelled never leaks its file.
pub struct DocumentRef {
    path: TempPath,
}

impl DocumentRef {
    /// Take ownership of a file. It will be deleted on drop.
    pub fn adopt(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            path: TempPath::try_from_path(path.as_ref())?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Size of the backing file in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(std::fs::metadata(self.path())?.len())
    }
}

impl fmt::Debug for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DocumentRef").field(&self.path()).finish()
    }
}

/// Standardized message shared by all sources.
///
/// Read-only once built; owned by whichever task is processing it.
#[derive(Debug)]
pub struct SourceMessage {
    text: Option<String>,
    document: Option<DocumentRef>,
    document_mime_type: Option<String>,
    source_name: String,
    source_id: String,
    timestamp: DateTime<Utc>,
    url: Option<String>,
    message_id: Option<String>,
    metadata: HashMap<String, Value>,
}

impl SourceMessage {
    pub fn builder(source_name: impl Into<String>, source_id: impl Into<String>) -> SourceMessageBuilder {
        SourceMessageBuilder {
            text: None,
            document: None,
            document_mime_type: None,
            source_name: source_name.into(),
            source_id: source_id.into(),
            timestamp: None,
            url: None,
            message_id: None,
            metadata: HashMap::new(),
        }
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn document(&self) -> Option<&DocumentRef> {
        self.document.as_ref()
    }

    pub fn document_mime_type(&self) -> Option<&str> {
        self.document_mime_type.as_deref()
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn message_id(&self) -> Option<&str> {
        self.message_id.as_deref()
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    /// Origin used for routing. Sources that multiplex several upstream
    /// channels put the channel id under `origin`; everything else routes on
    /// its own source id.
    pub fn origin(&self) -> &str {
        self.metadata
            .get("origin")
            .and_then(|v| v.as_str())
            .unwrap_or(&self.source_id)
    }

    pub fn has_text(&self) -> bool {
        self.text.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    pub fn has_document(&self) -> bool {
        self.document.is_some()
    }

    /// Attribution link: markdown `[name](url)` when a url is known.
    pub fn source_link(&self) -> String {
        match &self.url {
            Some(url) => format!("[{}]({})", self.source_name, url),
            None => self.source_name.clone(),
        }
    }
}

pub struct SourceMessageBuilder {
    text: Option<String>,
    document: Option<DocumentRef>,
    document_mime_type: Option<String>,
    source_name: String,
    source_id: String,
    timestamp: Option<DateTime<Utc>>,
    url: Option<String>,
    message_id: Option<String>,
    metadata: HashMap<String, Value>,
}

impl SourceMessageBuilder {
    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn document(mut self, document: DocumentRef, mime_type: Option<String>) -> Self {
        self.document = Some(document);
        self.document_mime_type = mime_type;
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Fails with a validation error unless the message carries non-blank
    /// text or a document. A rejected document is still removed from disk.
    pub fn build(self) -> Result<SourceMessage> {
        let has_text = self.text.as_deref().is_some_and(|t| !t.trim().is_empty());
        if !has_text && self.document.is_none() {
            return Err(RelayError::Validation(format!(
                "message from {} has neither text nor document",
                self.source_id
            )));
        }

        Ok(SourceMessage {
            text: self.text,
            document: self.document,
            document_mime_type: self.document_mime_type,
            source_name: self.source_name,
            source_id: self.source_id,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            url: self.url,
            message_id: self.message_id,
            metadata: self.metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_text_message_builds() -> Result<()> {
        let msg = SourceMessage::builder("TechCrunch", "rss_tc")
            .text("Article content")
            .url("https://example.com/a")
            .build()?;

        assert!(msg.has_text());
        assert!(!msg.has_document());
        assert_eq!(msg.source_link(), "[TechCrunch](https://example.com/a)");
        assert_eq!(msg.origin(), "rss_tc");
        Ok(())
    }

    #[test]
    fn test_blank_message_rejected() {
        let err = SourceMessage::builder("x", "y").text("   \n").build().unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
    }

    #[test]
    fn test_origin_from_metadata() -> Result<()> {
        let msg = SourceMessage::builder("Telegram", "telegram")
            .text("hi")
            .meta("origin", "-1001")
            .build()?;
        assert_eq!(msg.origin(), "-1001");
        assert_eq!(msg.source_link(), "Telegram");
        Ok(())
    }

    #[test]
    fn test_document_removed_on_drop() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("report.pdf");
        let mut file = std::fs::File::create(&path)?;
        file.write_all(b"%PDF-1.4")?;

        let msg = SourceMessage::builder("Research", "telegram_1")
            .document(DocumentRef::adopt(&path)?, Some("application/pdf".into()))
            .build()?;
        assert!(msg.has_document());
        assert_eq!(msg.document().map(|d| d.size().ok()), Some(Some(8)));
        assert!(path.exists());

        drop(msg);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_adopt_resolves_relative_path() -> Result<()> {
        let doc = DocumentRef::adopt("not-yet-downloaded.bin")?;
        assert!(doc.path().is_absolute());
        assert!(doc.path().ends_with("not-yet-downloaded.bin"));
        Ok(())
    }
}
