//! Chat source: monitored chats delivered through a supervised transport

use async_trait::async_trait;
use feedrelay_core::{DocumentRef, RelayError, Result, SourceMessage};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::source::{MessageStream, Source, SourceQueue, SourceState};
use crate::supervisor::{ConnectionState, ConnectionSupervisor};
use crate::transport::{Attachment, InboundChat, Transport};

pub struct ChatSourceOptions {
    pub origins: Vec<String>,
    pub temp_dir: PathBuf,
    pub max_document_bytes: u64,
}

/// Messages from the monitored chats of one transport session.
///
/// Every message carries its chat id as the routing origin and gets
/// `telegram_<chat id>` as its source id.
pub struct ChatSource {
    name: String,
    id: String,
    inner: Arc<ChatInner>,
}

struct ChatInner {
    supervisor: ConnectionSupervisor,
    options: ChatSourceOptions,
    queue: SourceQueue,
    failures: Mutex<Option<mpsc::UnboundedSender<RelayError>>>,
}

impl ChatSource {
    pub fn new(
        name: impl Into<String>,
        id: impl Into<String>,
        supervisor: ConnectionSupervisor,
        options: ChatSourceOptions,
    ) -> Self {
        Self {
            name: name.into(),
            id: id.into(),
            inner: Arc::new(ChatInner {
                supervisor,
                options,
                queue: SourceQueue::new(),
                failures: Mutex::new(None),
            }),
        }
    }

    /// Fatal connection errors raised after a successful start are sent here.
    pub fn with_failure_notifier(self, notifier: mpsc::UnboundedSender<RelayError>) -> Self {
        *self
            .inner
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(notifier);
        self
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.supervisor.state()
    }
}

impl ChatInner {
    fn notify_failure(&self, err: RelayError) {
        let notifier = self
            .failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        match notifier {
            Some(notifier) => {
                let _ = notifier.send(err);
            }
            None => error!("Unobserved fatal connection error: {}", err),
        }
    }

    async fn convert(&self, transport: &dyn Transport, chat: InboundChat) -> Option<SourceMessage> {
        let mut builder = SourceMessage::builder(chat.chat_name(), format!("telegram_{}", chat.chat_id))
            .timestamp(chat.date)
            .message_id(chat.message_id.to_string())
            .meta("origin", chat.chat_id.to_string())
            .meta("chat_id", chat.chat_id);

        if let Some(text) = &chat.text {
            builder = builder.text(text.as_str());
        }
        if let Some(link) = chat.link() {
            builder = builder.url(link);
        }
        if let Some(attachment) = &chat.attachment {
            match self.download(transport, attachment).await {
                Ok(Some(doc)) => builder = builder.document(doc, attachment.mime_type.clone()),
                Ok(None) => {}
                Err(e) => warn!("Failed to download attachment from {}: {}", chat.chat_id, e),
            }
        }

        match builder.build() {
            Ok(message) => Some(message),
            Err(e) => {
                debug!("Skipping message {} from {}: {}", chat.message_id, chat.chat_id, e);
                None
            }
        }
    }

    /// Download into the temp dir. Attachments known to exceed the size limit
    /// are skipped without touching the network.
    async fn download(&self, transport: &dyn Transport, attachment: &Attachment) -> Result<Option<DocumentRef>> {
        if let Some(size) = attachment.size {
            if size > self.options.max_document_bytes {
                warn!(
                    "Skipping {} byte attachment, limit is {}",
                    size, self.options.max_document_bytes
                );
                return Ok(None);
            }
        }

        let suffix = attachment
            .file_name
            .as_deref()
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(|ext| format!(".{}", ext))
            .unwrap_or_default();

        let temp = tempfile::Builder::new()
            .prefix("doc_")
            .suffix(&suffix)
            .tempfile_in(&self.options.temp_dir)?
            .into_temp_path();

        let written = transport.download(attachment, &temp).await?;
        debug!("Downloaded attachment {} ({} bytes)", attachment.file_id, written);

        let path = temp
            .keep()
            .map_err(|e| RelayError::Io(e.error))?;
        Ok(Some(DocumentRef::adopt(path)?))
    }
}

#[async_trait]
impl Source for ChatSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_id(&self) -> &str {
        &self.id
    }

    async fn start(&self) -> Result<()> {
        if self.inner.queue.state() == SourceState::Running {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.inner.options.temp_dir).await?;
        self.inner.supervisor.start().await?;

        let Some((tx, token)) = self.inner.queue.begin() else {
            return Ok(());
        };

        let transport = self.inner.supervisor.transport();
        let (chat_tx, mut chat_rx) = mpsc::unbounded_channel::<InboundChat>();
        if let Err(e) = transport.subscribe(&self.inner.options.origins, chat_tx).await {
            self.inner.queue.end();
            self.inner.supervisor.stop().await;
            return Err(e.into());
        }

        // Conversion: downloads run concurrently so one large file never
        // holds up plain text behind it
        {
            let inner = self.inner.clone();
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    let chat = tokio::select! {
                        _ = token.cancelled() => break,
                        next = chat_rx.recv() => match next {
                            Some(chat) => chat,
                            None => break,
                        },
                    };

                    let has_attachment = chat.attachment.is_some();
                    let inner = inner.clone();
                    let transport = transport.clone();
                    let tx = tx.clone();
                    let convert = async move {
                        if let Some(message) = inner.convert(transport.as_ref(), chat).await {
                            let _ = tx.send(message);
                        }
                    };
                    if has_attachment {
                        tokio::spawn(convert);
                    } else {
                        convert.await;
                    }
                }
            });
        }

        // Connection upkeep
        {
            let inner = self.inner.clone();
            let name = self.name.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.supervisor.run(&token).await {
                    error!("{} lost its connection: {}", name, e);
                    inner.queue.end();
                    inner.notify_failure(e);
                }
            });
        }

        info!(
            "{} started, monitoring {} origins",
            self.name,
            self.inner.options.origins.len()
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let was_running = self.inner.queue.end();
        self.inner.supervisor.stop().await;
        if was_running {
            info!("{} stopped", self.name);
        }
        Ok(())
    }

    fn messages(&self) -> Option<MessageStream> {
        self.inner.queue.take_stream()
    }

    fn state(&self) -> SourceState {
        self.inner.queue.state()
    }

    async fn health_check(&self) -> bool {
        self.state() == SourceState::Running && self.inner.supervisor.state() == ConnectionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockFile;
    use crate::transport::TransportError;
    use chrono::Utc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct FakeTransport {
        auth_error: Option<TransportError>,
        run_error: Mutex<Option<TransportError>>,
        sink: Mutex<Option<mpsc::UnboundedSender<InboundChat>>>,
        closed: CancellationToken,
    }

    impl FakeTransport {
        fn push(&self, chat: InboundChat) {
            let sink = self.sink.lock().unwrap().clone().unwrap();
            sink.send(chat).unwrap();
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn authenticate(&self, _credential: &Path) -> std::result::Result<(), TransportError> {
            match &self.auth_error {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }

        async fn run_until_disconnected(&self) -> std::result::Result<(), TransportError> {
            let scripted = self.run_error.lock().unwrap().take();
            if let Some(e) = scripted {
                return Err(e);
            }
            self.closed.cancelled().await;
            Ok(())
        }

        async fn reconnect(&self) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn close(&self) -> std::result::Result<(), TransportError> {
            self.closed.cancel();
            Ok(())
        }

        fn is_connected(&self) -> bool {
            !self.closed.is_cancelled()
        }

        async fn subscribe(
            &self,
            _origins: &[String],
            sink: mpsc::UnboundedSender<InboundChat>,
        ) -> std::result::Result<(), TransportError> {
            *self.sink.lock().unwrap() = Some(sink);
            Ok(())
        }

        async fn download(&self, _attachment: &Attachment, dest: &Path) -> std::result::Result<u64, TransportError> {
            std::fs::write(dest, b"doc bytes").map_err(|e| TransportError::Disconnected(e.to_string()))?;
            Ok(9)
        }

        async fn send_text(&self, _destination: &str, _text: &str) -> std::result::Result<(), TransportError> {
            Ok(())
        }
    }

    fn source(dir: &TempDir, transport: Arc<FakeTransport>) -> ChatSource {
        let supervisor = ConnectionSupervisor::new(
            transport,
            LockFile::new(dir.path().join("relay.lock")),
            dir.path().join("bot.token"),
        );
        ChatSource::new(
            "Telegram",
            "telegram",
            supervisor,
            ChatSourceOptions {
                origins: vec!["-1001".into()],
                temp_dir: dir.path().join("temp"),
                max_document_bytes: 1024,
            },
        )
    }

    fn inbound(text: Option<&str>, attachment: Option<Attachment>) -> InboundChat {
        InboundChat {
            chat_id: -1001,
            chat_title: Some("Wire".into()),
            chat_username: None,
            message_id: 7,
            date: Utc::now(),
            text: text.map(String::from),
            attachment,
        }
    }

    fn attachment(size: u64) -> Attachment {
        Attachment {
            file_id: "F".into(),
            file_name: Some("report.pdf".into()),
            mime_type: Some("application/pdf".into()),
            size: Some(size),
        }
    }

    async fn next(stream: &mut MessageStream) -> SourceMessage {
        tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_text_message_is_standardized() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::default());
        let source = source(&dir, transport.clone());

        source.start().await.unwrap();
        assert_eq!(source.state(), SourceState::Running);
        assert!(source.health_check().await);
        let mut stream = source.messages().unwrap();

        transport.push(inbound(Some("BTC breaks out"), None));
        let msg = next(&mut stream).await;
        assert_eq!(msg.text(), Some("BTC breaks out"));
        assert_eq!(msg.source_name(), "Wire");
        assert_eq!(msg.source_id(), "telegram_-1001");
        assert_eq!(msg.origin(), "-1001");
        assert_eq!(msg.url(), Some("https://t.me/c/1/7"));
        assert_eq!(msg.message_id(), Some("7"));

        source.stop().await.unwrap();
        assert_eq!(source.state(), SourceState::Stopped);
        assert!(!dir.path().join("relay.lock").exists());
    }

    #[tokio::test]
    async fn test_attachment_is_downloaded_and_cleaned_up() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::default());
        let source = source(&dir, transport.clone());
        source.start().await.unwrap();
        let mut stream = source.messages().unwrap();

        transport.push(inbound(None, Some(attachment(9))));
        let msg = next(&mut stream).await;
        let path = msg.document().unwrap().path().to_path_buf();
        assert!(path.starts_with(dir.path().join("temp")));
        assert_eq!(path.extension().unwrap(), "pdf");
        assert_eq!(msg.document_mime_type(), Some("application/pdf"));

        drop(msg);
        assert!(!path.exists());
        source.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_attachment_is_skipped() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport::default());
        let source = source(&dir, transport.clone());
        source.start().await.unwrap();
        let mut stream = source.messages().unwrap();

        transport.push(inbound(None, Some(attachment(4096))));
        transport.push(inbound(Some("caption survives"), Some(attachment(4096))));

        let msg = next(&mut stream).await;
        assert_eq!(msg.text(), Some("caption survives"));
        assert!(!msg.has_document());
        source.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_auth_failure_leaves_source_stopped() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport {
            auth_error: Some(TransportError::Unauthorized("revoked".into())),
            ..FakeTransport::default()
        });
        let source = source(&dir, transport);

        let err = source.start().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(source.state(), SourceState::Stopped);
        assert!(source.messages().is_none());
        source.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicated_session_is_reported() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(FakeTransport {
            run_error: Mutex::new(Some(TransportError::DuplicatedSession)),
            ..FakeTransport::default()
        });
        let (failures, mut failed) = mpsc::unbounded_channel();
        let source = source(&dir, transport).with_failure_notifier(failures);

        source.start().await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(5), failed.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(err, RelayError::DuplicateInstance { .. }));
        assert_eq!(source.state(), SourceState::Stopped);
        assert!(!dir.path().join("relay.lock").exists());
    }
}
