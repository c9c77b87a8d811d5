//! Polling source for JSON REST endpoints

use async_trait::async_trait;
use feedrelay_core::{ApiConfig, RelayError, Result, SourceMessage};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::feed::slug;
use crate::source::{MessageStream, SeenIds, Source, SourceQueue, SourceState, poll_every};

const SEEN_CAPACITY: usize = 1000;

/// One message-worthy record extracted from an API response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiItem {
    pub id: String,
    pub text: String,
    pub url: Option<String>,
    pub metadata: Value,
}

/// Turns a response body into items.
pub type Transform = Arc<dyn Fn(&Value) -> Vec<ApiItem> + Send + Sync>;

/// Field-mapping transform: take the array at `items_pointer` (or the body
/// itself) and read text, id and url from each object.
pub fn field_transform(items_pointer: &str, text_field: &str, id_field: &str, url_field: Option<&str>) -> Transform {
    let items_pointer = items_pointer.to_string();
    let text_field = text_field.to_string();
    let id_field = id_field.to_string();
    let url_field = url_field.map(str::to_string);

    Arc::new(move |body: &Value| {
        let root = if items_pointer.is_empty() {
            Some(body)
        } else {
            body.pointer(&items_pointer)
        };
        let records: Vec<&Value> = match root {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(obj @ Value::Object(_)) => vec![obj],
            _ => Vec::new(),
        };

        records
            .into_iter()
            .filter_map(|record| {
                let text = record.get(&text_field)?.as_str()?.trim();
                if text.is_empty() {
                    return None;
                }
                let id = match record.get(&id_field) {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Number(n)) => n.to_string(),
                    _ => text.to_string(),
                };
                let url = url_field
                    .as_deref()
                    .and_then(|field| record.get(field))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Some(ApiItem {
                    id,
                    text: text.to_string(),
                    url,
                    metadata: record.clone(),
                })
            })
            .collect()
    })
}

struct ApiPoller {
    name: String,
    id: String,
    url: String,
    client: reqwest::Client,
    transform: Transform,
    seen: Mutex<SeenIds>,
}

impl ApiPoller {
    async fn fetch(&self) -> Result<Vec<ApiItem>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| RelayError::TransientTransport(format!("API {} unreachable: {}", self.name, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::ExternalService(format!(
                "API {} returned {}",
                self.name, status
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| RelayError::ExternalService(format!("API {} returned invalid JSON: {}", self.name, e)))?;
        Ok((self.transform)(&body))
    }

    fn emit(&self, items: Vec<ApiItem>, tx: &mpsc::UnboundedSender<SourceMessage>) -> usize {
        let mut seen = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut emitted = 0;

        for item in items {
            if !seen.insert(&item.id) {
                continue;
            }
            let mut builder = SourceMessage::builder(&self.name, &self.id)
                .text(item.text)
                .message_id(item.id.as_str())
                .meta("record", item.metadata);
            if let Some(url) = item.url {
                builder = builder.url(url);
            }
            match builder.build() {
                Ok(message) => {
                    if tx.send(message).is_err() {
                        break;
                    }
                    emitted += 1;
                }
                Err(e) => debug!("Skipping API item {}: {}", item.id, e),
            }
        }

        if emitted > 0 {
            info!("Found {} new items from {}", emitted, self.name);
        }
        emitted
    }
}

/// Polls a JSON endpoint and emits each extracted item once, keyed by id.
pub struct ApiSource {
    poller: Arc<ApiPoller>,
    interval: Duration,
    queue: SourceQueue,
}

impl ApiSource {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        interval: Duration,
        headers: HeaderMap,
        transform: Transform,
        request_timeout: Duration,
    ) -> Result<Self> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| RelayError::Validation(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            poller: Arc::new(ApiPoller {
                id: format!("api_{}", slug(&name)),
                name,
                url: url.into(),
                client,
                transform,
                seen: Mutex::new(SeenIds::new(SEEN_CAPACITY)),
            }),
            interval,
            queue: SourceQueue::new(),
        })
    }

    /// An `Authorization` key is sent as a bearer token; any other header
    /// carries the key verbatim.
    pub fn from_config(config: &ApiConfig, request_timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = &config.api_key {
            let name = HeaderName::from_bytes(config.api_key_header.as_bytes())
                .map_err(|e| RelayError::Validation(format!("invalid header name for {}: {}", config.name, e)))?;
            let value = if name == reqwest::header::AUTHORIZATION {
                format!("Bearer {}", key)
            } else {
                key.clone()
            };
            let mut value = HeaderValue::from_str(&value)
                .map_err(|e| RelayError::Validation(format!("invalid API key for {}: {}", config.name, e)))?;
            value.set_sensitive(true);
            headers.insert(name, value);
        }

        let transform = field_transform(
            &config.items_pointer,
            &config.text_field,
            &config.id_field,
            config.url_field.as_deref(),
        );
        Self::new(
            &config.name,
            &config.url,
            Duration::from_secs(config.poll_interval_secs),
            headers,
            transform,
            request_timeout,
        )
    }
}

#[async_trait]
impl Source for ApiSource {
    fn name(&self) -> &str {
        &self.poller.name
    }

    fn source_id(&self) -> &str {
        &self.poller.id
    }

    async fn start(&self) -> Result<()> {
        if self.queue.state() == SourceState::Running {
            return Ok(());
        }

        let first = self.poller.fetch().await?;
        let Some((tx, token)) = self.queue.begin() else {
            return Ok(());
        };
        self.poller.emit(first, &tx);

        let poller = self.poller.clone();
        let interval = self.interval;
        tokio::spawn(async move {
            poll_every(interval, token, || {
                let poller = poller.clone();
                let tx = tx.clone();
                async move {
                    match poller.fetch().await {
                        Ok(items) => {
                            poller.emit(items, &tx);
                        },
                        Err(e) => warn!("Error polling API {}: {}", poller.name, e),
                    }
                }
            })
            .await;
            debug!("API poller for {} exited", poller.name);
        });

        info!(
            "API source {} started (polling every {}s)",
            self.poller.name,
            self.interval.as_secs()
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.queue.end() {
            info!("API source {} stopped", self.poller.name);
        }
        Ok(())
    }

    fn messages(&self) -> Option<MessageStream> {
        self.queue.take_stream()
    }

    fn state(&self) -> SourceState {
        self.queue.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer) -> ApiConfig {
        ApiConfig {
            name: "Trending".into(),
            url: format!("{}/trending", server.uri()),
            poll_interval_secs: 3600,
            api_key: Some("k3y".into()),
            api_key_header: "x-api-key".into(),
            items_pointer: "/coins".into(),
            text_field: "summary".into(),
            id_field: "slug".into(),
            url_field: Some("link".into()),
        }
    }

    #[test]
    fn test_field_transform() {
        let transform = field_transform("/data", "text", "id", Some("url"));
        let items = transform(&json!({
            "data": [
                { "id": 1, "text": "first", "url": "https://a.example" },
                { "id": "b", "text": "  " },
                { "text": "no id" },
                { "id": 4 }
            ]
        }));
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "1");
        assert_eq!(items[0].url.as_deref(), Some("https://a.example"));
        assert_eq!(items[1].id, "no id");

        let single = field_transform("", "text", "id", None)(&json!({ "id": "x", "text": "solo" }));
        assert_eq!(single.len(), 1);
        assert!(field_transform("/missing", "text", "id", None)(&json!({})).is_empty());
    }

    #[tokio::test]
    async fn test_polls_with_key_and_dedupes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/trending"))
            .and(header("x-api-key", "k3y"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "coins": [
                    { "slug": "btc", "summary": "Bitcoin trending", "link": "https://c.example/btc" },
                    { "slug": "btc", "summary": "Bitcoin again" },
                    { "slug": "eth", "summary": "Ether trending" }
                ]
            })))
            .mount(&server)
            .await;

        let source = ApiSource::from_config(&config(&server), Duration::from_secs(5)).unwrap();
        assert_eq!(source.source_id(), "api_trending");
        source.start().await.unwrap();
        let mut stream = source.messages().unwrap();

        let first = stream.recv().await.unwrap();
        assert_eq!(first.text(), Some("Bitcoin trending"));
        assert_eq!(first.url(), Some("https://c.example/btc"));
        assert_eq!(first.metadata()["record"]["slug"], "btc");
        let second = stream.recv().await.unwrap();
        assert_eq!(second.message_id(), Some("eth"));
        assert!(stream.try_recv().is_err());

        source.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_fails_on_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/trending"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let source = ApiSource::from_config(&config(&server), Duration::from_secs(5)).unwrap();
        let err = source.start().await.unwrap_err();
        assert!(matches!(err, RelayError::ExternalService(_)));
        assert_eq!(source.state(), SourceState::Stopped);
    }

    #[test]
    fn test_authorization_header_uses_bearer() {
        let cfg = ApiConfig {
            name: "Bearer".into(),
            url: "http://localhost/x".into(),
            poll_interval_secs: 60,
            api_key: Some("secret".into()),
            api_key_header: "Authorization".into(),
            items_pointer: String::new(),
            text_field: "text".into(),
            id_field: "id".into(),
            url_field: None,
        };
        assert!(ApiSource::from_config(&cfg, Duration::from_secs(1)).is_ok());

        let bad = ApiConfig {
            api_key_header: "bad header".into(),
            ..cfg
        };
        assert!(ApiSource::from_config(&bad, Duration::from_secs(1)).is_err());
    }
}
