//! Polling source for JSON Feed documents

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use feedrelay_core::{FeedConfig, RelayError, Result, SourceMessage};
use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::source::{MessageStream, SeenIds, Source, SourceQueue, SourceState, poll_every};

const SEEN_CAPACITY: usize = 1000;

#[derive(Debug, Deserialize)]
struct JsonFeed {
    title: Option<String>,
    #[serde(default)]
    items: Vec<FeedItem>,
}

#[derive(Debug, Deserialize)]
struct FeedItem {
    id: Option<String>,
    url: Option<String>,
    title: Option<String>,
    content_text: Option<String>,
    content_html: Option<String>,
    summary: Option<String>,
    date_published: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

impl FeedItem {
    fn key(&self) -> Option<&str> {
        self.id
            .as_deref()
            .or(self.url.as_deref())
            .or(self.title.as_deref())
    }

    fn published(&self) -> Option<DateTime<Utc>> {
        self.date_published
            .as_deref()
            .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
            .map(|d| d.with_timezone(&Utc))
    }

    fn text(&self) -> String {
        let title = self.title.as_deref().unwrap_or("Untitled");
        let body = self
            .content_text
            .as_deref()
            .or(self.summary.as_deref())
            .or(self.content_html.as_deref())
            .unwrap_or_default();
        if body.trim().is_empty() {
            format!("**{}**", title)
        } else {
            format!("**{}**\n\n{}", title, body.trim())
        }
    }
}

struct FeedPoller {
    name: String,
    id: String,
    url: String,
    max_age: ChronoDuration,
    client: reqwest::Client,
    seen: Mutex<SeenIds>,
}

impl FeedPoller {
    async fn fetch(&self) -> Result<JsonFeed> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| RelayError::TransientTransport(format!("feed {} unreachable: {}", self.name, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::ExternalService(format!(
                "feed {} returned {}",
                self.name, status
            )));
        }

        response
            .json()
            .await
            .map_err(|e| RelayError::ExternalService(format!("feed {} is not a JSON Feed: {}", self.name, e)))
    }

    /// Queue items that are new and recent enough. Returns how many.
    fn emit(&self, feed: JsonFeed, tx: &mpsc::UnboundedSender<SourceMessage>) -> usize {
        let now = Utc::now();
        let mut seen = self.seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut emitted = 0;

        for item in feed.items {
            let Some(key) = item.key().map(str::to_string) else {
                debug!("Skipping feed item without id, url or title");
                continue;
            };
            let published = item.published();
            if published.is_some_and(|at| now - at > self.max_age) {
                continue;
            }
            if !seen.insert(&key) {
                continue;
            }

            let mut builder = SourceMessage::builder(&self.name, &self.id)
                .text(item.text())
                .message_id(key.as_str())
                .meta("tags", item.tags.clone());
            if let Some(at) = published {
                builder = builder.timestamp(at);
            }
            if let Some(url) = &item.url {
                builder = builder.url(url.as_str());
            }

            match builder.build() {
                Ok(message) => {
                    if tx.send(message).is_err() {
                        break;
                    }
                    emitted += 1;
                }
                Err(e) => debug!("Skipping feed item {}: {}", key, e),
            }
        }

        if emitted > 0 {
            info!("Found {} new items from {}", emitted, self.name);
        }
        debug!("{} tracks {} seen items", self.name, seen.len());
        emitted
    }
}

/// Polls a JSON Feed URL, emitting each entry once.
///
/// Entries older than `max_age` are ignored. `start` fails if the first
/// fetch fails.
pub struct FeedSource {
    poller: Arc<FeedPoller>,
    interval: Duration,
    queue: SourceQueue,
}

impl FeedSource {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        interval: Duration,
        max_age: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let name = name.into();
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| RelayError::Validation(format!("Failed to build HTTP client: {}", e)))?;
        let max_age = ChronoDuration::from_std(max_age)
            .map_err(|e| RelayError::Validation(format!("max age out of range: {}", e)))?;

        Ok(Self {
            poller: Arc::new(FeedPoller {
                id: format!("feed_{}", slug(&name)),
                name,
                url: url.into(),
                max_age,
                client,
                seen: Mutex::new(SeenIds::new(SEEN_CAPACITY)),
            }),
            interval,
            queue: SourceQueue::new(),
        })
    }

    pub fn from_config(config: &FeedConfig, request_timeout: Duration) -> Result<Self> {
        Self::new(
            &config.name,
            &config.url,
            Duration::from_secs(config.poll_interval_secs),
            Duration::from_secs(config.max_age_hours * 3600),
            request_timeout,
        )
    }
}

/// Lowercase alphanumerics, everything else collapsed to `_`.
pub(crate) fn slug(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

#[async_trait]
impl Source for FeedSource {
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
        if let Some(title) = &first.title {
            debug!("Feed {} is titled {:?}", self.poller.name, title);
        }

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
                        Ok(feed) => {
                            poller.emit(feed, &tx);
                        },
                        Err(e) => warn!("Error polling feed {}: {}", poller.name, e),
                    }
                }
            })
            .await;
            debug!("Feed poller for {} exited", poller.name);
        });

        info!(
            "Feed {} started (polling every {}s)",
            self.poller.name,
            self.interval.as_secs()
        );
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if self.queue.end() {
            info!("Feed {} stopped", self.poller.name);
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
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn feed_body() -> serde_json::Value {
        let fresh = Utc::now().to_rfc3339();
        let stale = (Utc::now() - ChronoDuration::days(3)).to_rfc3339();
        json!({
            "version": "https://jsonfeed.org/version/1.1",
            "title": "Desk",
            "items": [
                { "id": "1", "url": "https://news.example/1", "title": "Rates held",
                  "content_text": "The committee kept rates unchanged.", "date_published": fresh },
                { "id": "2", "title": "Old story", "content_text": "stale", "date_published": stale },
                { "id": "3", "title": "Undated", "summary": "No date given" }
            ]
        })
    }

    fn feed_source(server: &MockServer, interval: Duration) -> FeedSource {
        FeedSource::new(
            "Macro Desk",
            format!("{}/feed.json", server.uri()),
            interval,
            Duration::from_secs(24 * 3600),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Macro Desk"), "macro_desk");
        assert_eq!(slug("  CoinGecko: Trending!"), "coingecko_trending");
    }

    #[tokio::test]
    async fn test_start_fails_when_first_fetch_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.json"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let source = feed_source(&server, Duration::from_secs(60));
        assert!(source.start().await.is_err());
        assert_eq!(source.state(), SourceState::Stopped);
        source.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_emits_recent_items_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/feed.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(feed_body()))
            .mount(&server)
            .await;

        let source = feed_source(&server, Duration::from_millis(50));
        assert_eq!(source.source_id(), "feed_macro_desk");
        source.start().await.unwrap();
        let mut stream = source.messages().unwrap();

        let first = stream.recv().await.unwrap();
        assert_eq!(first.text(), Some("**Rates held**\n\nThe committee kept rates unchanged."));
        assert_eq!(first.url(), Some("https://news.example/1"));
        assert_eq!(first.message_id(), Some("1"));
        let second = stream.recv().await.unwrap();
        assert_eq!(second.message_id(), Some("3"));

        // Several more polls of the same document
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(server.received_requests().await.unwrap().len() > 2);
        assert!(stream.try_recv().is_err());

        source.stop().await.unwrap();
        assert!(
            tokio::time::timeout(Duration::from_secs(5), stream.recv())
                .await
                .unwrap()
                .is_none()
        );
    }
}
