//! Per-message processing: route, process, format, chunk, send

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::digest::DigestLog;
use crate::envelope;
use crate::error::{RelayError, Result};
use crate::outbound::{ChunkedSend, Outbound, send_chunked};
use crate::processor::{ContentProcessor, DocumentReader, ProcessingContext};
use crate::retry::RetryPolicy;
use crate::routing::RoutingTable;
use crate::status::{Metrics, StatusReporter};
use crate::types::SourceMessage;

/// Consumer of fanned-in messages. Each call runs as its own task.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: SourceMessage);
}

/// The relay's message handler.
///
/// Failures are confined to the message that caused them: they are counted,
/// reported to the status destination and the message is dropped. Dropping
/// the message removes any downloaded document.
pub struct Dispatcher {
    routing: Arc<RoutingTable>,
    processor: Arc<dyn ContentProcessor>,
    readers: Vec<Arc<dyn DocumentReader>>,
    retry: RetryPolicy<RelayError>,
    outbound: Arc<dyn Outbound>,
    status: StatusReporter,
    metrics: Arc<Metrics>,
    digest: Option<Arc<DigestLog>>,
    chunking: ChunkedSend,
    max_document_bytes: u64,
    token: CancellationToken,
}

impl Dispatcher {
    /// Only `ExternalServiceError`s from the processor are retried.
    pub fn new(
        routing: Arc<RoutingTable>,
        processor: Arc<dyn ContentProcessor>,
        retry: RetryPolicy<RelayError>,
        outbound: Arc<dyn Outbound>,
        status: StatusReporter,
    ) -> Self {
        Self {
            routing,
            processor,
            readers: Vec::new(),
            retry: retry.with_predicate(|e: &RelayError| matches!(e, RelayError::ExternalService(_))),
            outbound,
            status,
            metrics: Arc::new(Metrics::new()),
            digest: None,
            chunking: ChunkedSend::default(),
            max_document_bytes: 50 * 1024 * 1024,
            token: CancellationToken::new(),
        }
    }

    pub fn with_reader(mut self, reader: Arc<dyn DocumentReader>) -> Self {
        self.readers.push(reader);
        self
    }

    pub fn with_digest(mut self, digest: Arc<DigestLog>) -> Self {
        self.digest = Some(digest);
        self
    }

    pub fn with_chunking(mut self, chunking: ChunkedSend) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn with_max_document_bytes(mut self, bytes: u64) -> Self {
        self.max_document_bytes = bytes;
        self
    }

    /// Cancelling `token` stops pending retries of in-flight messages.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    async fn process(&self, message: &SourceMessage) -> Result<String> {
        let destination = self.routing.resolve(message.origin()).to_string();

        let mut input = message.text().map(str::trim).unwrap_or_default().to_string();
        let mut content_type = "text";
        if let Some(extracted) = self.read_document(message).await? {
            content_type = "document";
            if !input.is_empty() {
                input.push_str("\n\n");
            }
            input.push_str(&extracted);
        }
        if input.trim().is_empty() {
            return Err(RelayError::Validation("nothing to process after extraction".into()));
        }

        let mut context = ProcessingContext::new();
        context.insert("source_channel".into(), Value::from(message.source_name()));
        context.insert("source_id".into(), Value::from(message.source_id()));
        context.insert("content_type".into(), Value::from(content_type));
        if let Some(url) = message.url() {
            context.insert("message_link".into(), Value::from(url));
        }

        let processed = self
            .retry
            .run(&self.token, || self.processor.process(&input, &context))
            .await
            .map_err(|e| {
                let attempts = e.attempts();
                e.into_inner().unwrap_or_else(|| {
                    RelayError::ExternalService(format!("processing cancelled after {} attempt(s)", attempts))
                })
            })?;

        if processed.trim().is_empty() {
            return Err(RelayError::ExternalService("processor returned empty content".into()));
        }

        let text = envelope::format_outbound(&processed, message);
        send_chunked(self.outbound.as_ref(), &destination, &text, self.chunking).await?;

        if let Some(digest) = &self.digest {
            digest.record(&destination, message.source_name(), &processed).await;
        }

        Ok(destination)
    }

    /// Size-check and extract the attached document on the blocking pool.
    async fn read_document(&self, message: &SourceMessage) -> Result<Option<String>> {
        let Some(doc) = message.document() else {
            return Ok(None);
        };

        let size = doc.size()?;
        if size > self.max_document_bytes {
            return Err(RelayError::ResourceLimit(format!(
                "document is {} bytes, limit is {}",
                size, self.max_document_bytes
            )));
        }

        let mime = message.document_mime_type();
        let Some(reader) = self.readers.iter().find(|r| r.supports(mime, doc.path())).cloned() else {
            if message.has_text() {
                warn!("No reader for document {:?} ({:?}); using caption only", doc.path(), mime);
                return Ok(None);
            }
            return Err(RelayError::Validation(format!(
                "unsupported document type {:?}",
                mime.unwrap_or("unknown")
            )));
        };

        let path = doc.path().to_path_buf();
        let text = tokio::task::spawn_blocking(move || reader.extract_text(&path))
            .await
            .map_err(|e| RelayError::ExternalService(format!("document reader panicked: {}", e)))??;

        debug!("Extracted {} chars from document", text.len());
        Ok(Some(text))
    }
}

#[async_trait]
impl MessageHandler for Dispatcher {
    async fn handle(&self, message: SourceMessage) {
        self.metrics.record_received();
        let span = info_span!(
            "message",
            id = %Uuid::new_v4(),
            source = %message.source_id()
        );

        async {
            match self.process(&message).await {
                Ok(destination) => {
                    self.metrics.record_processed();
                    info!("Forwarded message from {} to {}", message.source_name(), destination);
                }
                Err(e) => {
                    self.metrics.record_error();
                    self.metrics.record_dropped();
                    warn!("Dropping message from {}: {}", message.source_name(), e);

                    let mut context = BTreeMap::new();
                    context.insert("source".to_string(), message.source_name().to_string());
                    context.insert("source_id".to_string(), message.source_id().to_string());
                    if let Some(id) = message.message_id() {
                        context.insert("message_id".to_string(), id.to_string());
                    }
                    self.status.report_error(e.kind(), &e.to_string(), &context).await;
                }
            }
        }
        .instrument(span)
        .await
    }
}
