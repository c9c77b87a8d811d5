//! Chat transport abstraction used by the connection supervisor

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedrelay_core::{Outbound, RelayError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

/// Failures a transport reports back to its supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Mandatory pause requested by the remote side.
    #[error("rate limited, retry in {seconds}s")]
    RateLimited { seconds: u64 },

    /// Another client is using the same session.
    #[error("session is in use by another client")]
    DuplicatedSession,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("disconnected: {0}")]
    Disconnected(String),
}

impl From<TransportError> for RelayError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unauthorized(reason) => RelayError::Authentication(reason),
            other => RelayError::TransientTransport(other.to_string()),
        }
    }
}

/// A file attached to an inbound chat message.
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub file_id: String,
    pub file_name: Option<String>,
    pub mime_type: Option<String>,
    pub size: Option<u64>,
}

/// A message as delivered by the transport, before standardization.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundChat {
    pub chat_id: i64,
    pub chat_title: Option<String>,
    pub chat_username: Option<String>,
    pub message_id: i64,
    pub date: DateTime<Utc>,
    pub text: Option<String>,
    pub attachment: Option<Attachment>,
}

impl InboundChat {
    /// Display name of the originating chat.
    pub fn chat_name(&self) -> String {
        self.chat_title
            .clone()
            .or_else(|| self.chat_username.clone())
            .unwrap_or_else(|| self.chat_id.to_string())
    }

    /// Public link to the message, when one can be formed.
    pub fn link(&self) -> Option<String> {
        if let Some(username) = &self.chat_username {
            return Some(format!("https://t.me/{}/{}", username, self.message_id));
        }
        // Private supergroups and channels carry a -100 prefix
        let id = self.chat_id.to_string();
        id.strip_prefix("-100")
            .filter(|rest| !rest.is_empty())
            .map(|rest| format!("https://t.me/c/{}/{}", rest, self.message_id))
    }

    /// Whether this chat is one of `origins`, given as numeric ids or
    /// `@username`. An empty list matches everything.
    pub fn matches_any(&self, origins: &[String]) -> bool {
        if origins.is_empty() {
            return true;
        }
        let id = self.chat_id.to_string();
        origins.iter().any(|origin| {
            let origin = origin.trim();
            if origin == id {
                return true;
            }
            match (&self.chat_username, origin.strip_prefix('@')) {
                (Some(username), Some(wanted)) => username.eq_ignore_ascii_case(wanted),
                _ => false,
            }
        })
    }
}

/// Connection to a chat network. Implementations never prompt for input:
/// `authenticate` works from a credential artifact persisted beforehand.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn authenticate(&self, credential: &Path) -> Result<(), TransportError>;

    /// Deliver updates until the connection drops or `close` is called.
    /// Returns `Ok` only after a `close`.
    async fn run_until_disconnected(&self) -> Result<(), TransportError>;

    async fn reconnect(&self) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Forward messages from `origins` to `sink`.
    async fn subscribe(
        &self,
        origins: &[String],
        sink: mpsc::UnboundedSender<InboundChat>,
    ) -> Result<(), TransportError>;

    /// Download an attachment to `dest`, returning the bytes written.
    async fn download(&self, attachment: &Attachment, dest: &Path) -> Result<u64, TransportError>;

    async fn send_text(&self, destination: &str, text: &str) -> Result<(), TransportError>;
}

/// Sends relay output through a transport, honoring one rate-limit pause.
pub struct TransportOutbound {
    transport: Arc<dyn Transport>,
}

impl TransportOutbound {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl Outbound for TransportOutbound {
    async fn send_text(&self, destination: &str, text: &str) -> feedrelay_core::Result<()> {
        match self.transport.send_text(destination, text).await {
            Err(TransportError::RateLimited { seconds }) => {
                warn!("Rate limited sending to {}, waiting {}s", destination, seconds);
                tokio::time::sleep(Duration::from_secs(seconds)).await;
                self.transport
                    .send_text(destination, text)
                    .await
                    .map_err(RelayError::from)
            }
            other => other.map_err(RelayError::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn chat(chat_id: i64, username: Option<&str>) -> InboundChat {
        InboundChat {
            chat_id,
            chat_title: Some("Wire".into()),
            chat_username: username.map(String::from),
            message_id: 42,
            date: Utc::now(),
            text: Some("hello".into()),
            attachment: None,
        }
    }

    #[test]
    fn test_link_forms() {
        assert_eq!(
            chat(1, Some("bwenews")).link().as_deref(),
            Some("https://t.me/bwenews/42")
        );
        assert_eq!(
            chat(-1001234567, None).link().as_deref(),
            Some("https://t.me/c/1234567/42")
        );
        assert_eq!(chat(555, None).link(), None);
    }

    #[test]
    fn test_origin_matching() {
        let msg = chat(-1001234567, Some("BWEnews"));
        assert!(msg.matches_any(&[]));
        assert!(msg.matches_any(&["@bwenews".into()]));
        assert!(msg.matches_any(&["-1001234567".into()]));
        assert!(!msg.matches_any(&["@other".into(), "12".into()]));
    }

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            RelayError::from(TransportError::Unauthorized("bad token".into())),
            RelayError::Authentication(_)
        ));
        let err = RelayError::from(TransportError::RateLimited { seconds: 3 });
        assert!(err.is_retryable());
    }

    /// Rejects the first send with a rate limit, accepts after.
    struct Throttled {
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl Transport for Throttled {
        async fn authenticate(&self, _credential: &Path) -> Result<(), TransportError> {
            Ok(())
        }
        async fn run_until_disconnected(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn reconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn subscribe(
            &self,
            _origins: &[String],
            _sink: mpsc::UnboundedSender<InboundChat>,
        ) -> Result<(), TransportError> {
            Ok(())
        }
        async fn download(&self, _attachment: &Attachment, _dest: &Path) -> Result<u64, TransportError> {
            Ok(0)
        }
        async fn send_text(&self, _destination: &str, _text: &str) -> Result<(), TransportError> {
            let mut calls = self.calls.lock().unwrap();
            *calls += 1;
            if *calls == 1 {
                Err(TransportError::RateLimited { seconds: 30 })
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_outbound_waits_out_rate_limit() {
        let transport = Arc::new(Throttled { calls: Mutex::new(0) });
        let outbound = TransportOutbound::new(transport.clone());

        let started = tokio::time::Instant::now();
        outbound.send_text("@dest", "hi").await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert_eq!(*transport.calls.lock().unwrap(), 2);
    }
}
