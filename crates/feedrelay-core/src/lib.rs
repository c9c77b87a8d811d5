//! feedrelay-core - message model, resilience primitives and dispatch
//!
//! This crate provides:
//! - The `SourceMessage` envelope and the error taxonomy
//! - Retry-with-backoff, routing and long-message chunking
//! - Status reporting, metrics and the per-message dispatcher

pub mod chunker;
pub mod config;
pub mod digest;
pub mod dispatch;
pub mod envelope;
pub mod error;
pub mod outbound;
pub mod processor;
pub mod retry;
pub mod routing;
pub mod status;
pub mod types;

pub use config::{ApiConfig, Config, FeedConfig};
pub use digest::{DigestEntry, DigestLog};
pub use dispatch::{Dispatcher, MessageHandler};
pub use error::{RelayError, Result};
pub use outbound::{ChunkedSend, DryRunOutbound, Outbound, send_chunked};
pub use processor::{ContentProcessor, DocumentReader, HttpProcessor, PassthroughProcessor, PlainTextReader, ProcessingContext};
pub use retry::{RetryError, RetryPolicy};
pub use routing::RoutingTable;
pub use status::{Metrics, MetricsSnapshot, StatusReporter};
pub use types::{DocumentRef, SourceMessage};
