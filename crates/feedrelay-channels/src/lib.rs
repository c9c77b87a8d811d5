//! Message sources and connection plumbing for feedrelay
//!
//! This crate provides the source registry with its fan-in loop, the
//! supervised chat connection (lock file, reconnect backoff, Bot API
//! transport) and the polling feed and API sources.

pub mod api;
pub mod chat;
pub mod feed;
pub mod lock;
pub mod registry;
pub mod source;
pub mod supervisor;
pub mod telegram;
pub mod transport;

// Re-export main types
pub use api::{ApiItem, ApiSource, field_transform};
pub use chat::{ChatSource, ChatSourceOptions};
pub use feed::FeedSource;
pub use lock::{LockFile, LockGuard, LockStatus};
pub use registry::SourceRegistry;
pub use source::{MessageStream, Source, SourceState};
pub use supervisor::{ConnectionState, ConnectionSupervisor, ReconnectBackoff};
pub use telegram::BotApiTransport;
pub use transport::{Attachment, InboundChat, Transport, TransportError, TransportOutbound};
