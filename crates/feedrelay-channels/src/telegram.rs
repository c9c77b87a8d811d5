//! Telegram Bot API transport (long-polling `getUpdates`)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use feedrelay_core::{RelayError, Result};
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::transport::{Attachment, InboundChat, Transport, TransportError};

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Seconds the server may hold a `getUpdates` request open.
const POLL_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
    parameters: Option<ResponseParameters>,
}

#[derive(Debug, Deserialize)]
struct ResponseParameters {
    retry_after: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BotUser {
    id: i64,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<BotMessage>,
    channel_post: Option<BotMessage>,
}

#[derive(Debug, Deserialize)]
struct BotMessage {
    message_id: i64,
    date: i64,
    chat: BotChat,
    text: Option<String>,
    caption: Option<String>,
    document: Option<BotDocument>,
}

#[derive(Debug, Deserialize)]
struct BotChat {
    id: i64,
    title: Option<String>,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BotDocument {
    file_id: String,
    file_name: Option<String>,
    mime_type: Option<String>,
    file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct BotFile {
    file_path: Option<String>,
}

impl From<BotMessage> for InboundChat {
    fn from(msg: BotMessage) -> Self {
        InboundChat {
            chat_id: msg.chat.id,
            chat_title: msg.chat.title,
            chat_username: msg.chat.username,
            message_id: msg.message_id,
            date: DateTime::from_timestamp(msg.date, 0).unwrap_or_else(Utc::now),
            text: msg.text.or(msg.caption),
            attachment: msg.document.map(|doc| Attachment {
                file_id: doc.file_id,
                file_name: doc.file_name,
                mime_type: doc.mime_type,
                size: doc.file_size,
            }),
        }
    }
}

/// Map a failed Bot API response onto the transport error kinds.
fn classify(status: StatusCode, body: &str) -> TransportError {
    let parsed: Option<ApiResponse<Value>> = serde_json::from_str(body).ok();
    let description = parsed
        .as_ref()
        .and_then(|r| r.description.clone())
        .unwrap_or_else(|| body.chars().take(200).collect());
    let retry_after = parsed
        .as_ref()
        .and_then(|r| r.parameters.as_ref())
        .and_then(|p| p.retry_after);

    match status {
        StatusCode::TOO_MANY_REQUESTS => TransportError::RateLimited {
            seconds: retry_after.unwrap_or(1),
        },
        StatusCode::CONFLICT => TransportError::DuplicatedSession,
        StatusCode::UNAUTHORIZED => TransportError::Unauthorized(description),
        _ => TransportError::Disconnected(format!("HTTP {}: {}", status.as_u16(), description)),
    }
}

struct Subscription {
    origins: Vec<String>,
    sink: mpsc::UnboundedSender<InboundChat>,
}

/// Bot API client. The credential artifact is a file holding the bot token.
pub struct BotApiTransport {
    client: reqwest::Client,
    api_base: String,
    token: RwLock<Option<String>>,
    connected: AtomicBool,
    offset: AtomicI64,
    subscriptions: Mutex<Vec<Subscription>>,
    closed: Notify,
    poll_timeout_secs: u64,
}

impl BotApiTransport {
    pub fn new() -> Result<Self> {
        Self::with_api_base(DEFAULT_API_BASE, POLL_TIMEOUT_SECS)
    }

    pub fn with_api_base(api_base: impl Into<String>, poll_timeout_secs: u64) -> Result<Self> {
        // Client timeout must outlast the long poll
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(poll_timeout_secs + 15))
            .build()
            .map_err(|e| RelayError::Validation(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            token: RwLock::new(None),
            connected: AtomicBool::new(false),
            offset: AtomicI64::new(0),
            subscriptions: Mutex::new(Vec::new()),
            closed: Notify::new(),
            poll_timeout_secs,
        })
    }

    fn token(&self) -> std::result::Result<String, TransportError> {
        self.token
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or_else(|| TransportError::Unauthorized("not authenticated".into()))
    }

    fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = token;
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, payload: &Value) -> std::result::Result<T, TransportError> {
        let token = self.token()?;
        let url = format!("{}/bot{}/{}", self.api_base, token, method);

        let response = self
            .client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| TransportError::Disconnected(format!("{} request failed: {}", method, e.without_url())))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Disconnected(format!("{} body unreadable: {}", method, e.without_url())))?;

        if !status.is_success() {
            return Err(classify(status, &body));
        }

        let parsed: ApiResponse<T> = serde_json::from_str(&body)
            .map_err(|e| TransportError::Disconnected(format!("{} returned invalid JSON: {}", method, e)))?;
        match parsed {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            _ => Err(classify(status, &body)),
        }
    }

    fn deliver(&self, chat: InboundChat) {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscriptions.retain(|sub| !sub.sink.is_closed());
        for sub in subscriptions.iter() {
            if chat.matches_any(&sub.origins) {
                let _ = sub.sink.send(chat.clone());
            }
        }
    }

    async fn poll_once(&self) -> std::result::Result<usize, TransportError> {
        let payload = json!({
            "offset": self.offset.load(Ordering::SeqCst),
            "timeout": self.poll_timeout_secs,
            "allowed_updates": ["message", "channel_post"],
        });
        let updates: Vec<Update> = self.call("getUpdates", &payload).await?;
        let count = updates.len();
        if count > 0 {
            debug!("Got {} updates", count);
        }

        for update in updates {
            self.offset.store(update.update_id + 1, Ordering::SeqCst);
            match update.message.or(update.channel_post) {
                Some(msg) => self.deliver(msg.into()),
                None => debug!("Ignoring non-message update {}", update.update_id),
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl Transport for BotApiTransport {
    async fn authenticate(&self, credential: &Path) -> std::result::Result<(), TransportError> {
        let token = tokio::fs::read_to_string(credential)
            .await
            .map_err(|e| TransportError::Unauthorized(format!("cannot read {}: {}", credential.display(), e)))?;
        let token = token.trim();
        if token.is_empty() {
            return Err(TransportError::Unauthorized(format!(
                "{} is empty",
                credential.display()
            )));
        }

        self.set_token(Some(token.to_string()));
        let me: BotUser = match self.call("getMe", &json!({})).await {
            Ok(me) => me,
            Err(e) => {
                self.set_token(None);
                return Err(e);
            }
        };

        // Long polling is refused while a webhook is set
        if let Err(e) = self.call::<bool>("deleteWebhook", &json!({})).await {
            warn!("Could not clear webhook: {}", e);
        }

        self.connected.store(true, Ordering::SeqCst);
        info!(
            "Authenticated as @{} ({})",
            me.username.as_deref().unwrap_or("unknown"),
            me.id
        );
        Ok(())
    }

    async fn run_until_disconnected(&self) -> std::result::Result<(), TransportError> {
        loop {
            if !self.connected.load(Ordering::SeqCst) {
                return Ok(());
            }

            let polled = tokio::select! {
                _ = self.closed.notified() => return Ok(()),
                polled = self.poll_once() => polled,
            };

            if let Err(e) = polled {
                if matches!(e, TransportError::Disconnected(_)) {
                    self.connected.store(false, Ordering::SeqCst);
                }
                return Err(e);
            }
        }
    }

    async fn reconnect(&self) -> std::result::Result<(), TransportError> {
        let _: BotUser = self.call("getMe", &json!({})).await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> std::result::Result<(), TransportError> {
        self.connected.store(false, Ordering::SeqCst);
        self.closed.notify_waiters();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn subscribe(
        &self,
        origins: &[String],
        sink: mpsc::UnboundedSender<InboundChat>,
    ) -> std::result::Result<(), TransportError> {
        info!("Subscribed to {} origins", origins.len());
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Subscription {
                origins: origins.to_vec(),
                sink,
            });
        Ok(())
    }

    async fn download(&self, attachment: &Attachment, dest: &Path) -> std::result::Result<u64, TransportError> {
        let file: BotFile = self
            .call("getFile", &json!({ "file_id": attachment.file_id }))
            .await?;
        let file_path = file
            .file_path
            .ok_or_else(|| TransportError::Disconnected("file is not available for download".into()))?;

        let url = format!("{}/file/bot{}/{}", self.api_base, self.token()?, file_path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TransportError::Disconnected(format!("download failed: {}", e.without_url())))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify(status, &body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransportError::Disconnected(format!("download interrupted: {}", e.without_url())))?;
        tokio::fs::write(dest, &bytes)
            .await
            .map_err(|e| TransportError::Disconnected(format!("cannot write {}: {}", dest.display(), e)))?;

        debug!("Downloaded {} bytes to {}", bytes.len(), dest.display());
        Ok(bytes.len() as u64)
    }

    async fn send_text(&self, destination: &str, text: &str) -> std::result::Result<(), TransportError> {
        let _: Value = self
            .call(
                "sendMessage",
                &json!({
                    "chat_id": destination,
                    "text": text,
                    "disable_web_page_preview": true,
                }),
            )
            .await?;
        Ok(())
    }
}
