//! Content-processing and document-reading capabilities
//!
//! The relay treats translation/summarization as an opaque
//! `(text, context) -> text` service. Two implementations ship here: a
//! passthrough used for dry runs and an HTTP client for a processing
//! endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::error::{RelayError, Result};

/// Context handed to the processor alongside the text.
pub type ProcessingContext = HashMap<String, Value>;

#[async_trait]
pub trait ContentProcessor: Send + Sync {
    async fn process(&self, text: &str, context: &ProcessingContext) -> Result<String>;
}

/// Returns the input unchanged.
#[derive(Debug, Default, Clone)]
pub struct PassthroughProcessor;

#[async_trait]
impl ContentProcessor for PassthroughProcessor {
    async fn process(&self, text: &str, _context: &ProcessingContext) -> Result<String> {
        Ok(text.to_string())
    }
}

#[derive(Serialize)]
struct ProcessRequest<'a> {
    text: &'a str,
    context: &'a ProcessingContext,
}

#[derive(Deserialize)]
struct ProcessResponse {
    text: String,
}

/// Processor backed by an HTTP endpoint: `POST {url}` with
/// `{"text", "context"}` and a bearer key, answering `{"text"}`.
pub struct HttpProcessor {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl HttpProcessor {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Validation(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl ContentProcessor for HttpProcessor {
    async fn process(&self, text: &str, context: &ProcessingContext) -> Result<String> {
        debug!("Sending {} chars to processor", text.len());

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&ProcessRequest { text, context })
            .send()
            .await
            .map_err(|e| RelayError::ExternalService(format!("processor request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::ExternalService(format!(
                "processor returned {}: {}",
                status, body
            )));
        }

        let parsed: ProcessResponse = response
            .json()
            .await
            .map_err(|e| RelayError::ExternalService(format!("invalid processor response: {}", e)))?;

        if parsed.text.trim().is_empty() {
            return Err(RelayError::ExternalService("processor returned empty text".into()));
        }
        Ok(parsed.text)
    }
}

/// Blocking text extraction from a local document.
///
/// Implementations may be CPU heavy; callers run them on the blocking pool.
pub trait DocumentReader: Send + Sync {
    fn supports(&self, mime_type: Option<&str>, path: &Path) -> bool;
    fn extract_text(&self, path: &Path) -> Result<String>;
}

/// Reads UTF-8 text documents (`text/*`, `.txt`, `.md`, `.csv`).
#[derive(Debug, Default, Clone)]
pub struct PlainTextReader;

impl DocumentReader for PlainTextReader {
    fn supports(&self, mime_type: Option<&str>, path: &Path) -> bool {
        if mime_type.is_some_and(|m| m.starts_with("text/")) {
            return true;
        }
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("txt") | Some("md") | Some("csv")
        )
    }

    fn extract_text(&self, path: &Path) -> Result<String> {
        let bytes = std::fs::read(path)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
