//! In-memory record of forwarded content, consumed by the daily summary

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::Mutex;
use tracing::debug;

/// Entries kept per destination before the oldest are evicted.
pub const DEFAULT_CAPACITY: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct DigestEntry {
    pub at: DateTime<Utc>,
    pub source_name: String,
    pub text: String,
}

/// Bounded per-destination log of what was forwarded recently.
///
/// Not persisted: a restart starts a fresh day.
#[derive(Debug)]
pub struct DigestLog {
    capacity: usize,
    entries: Mutex<HashMap<String, VecDeque<DigestEntry>>>,
}

impl Default for DigestLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl DigestLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn record(&self, destination: &str, source_name: &str, text: &str) {
        let mut entries = self.entries.lock().await;
        let log = entries.entry(destination.to_string()).or_default();
        if log.len() >= self.capacity {
            log.pop_front();
        }
        log.push_back(DigestEntry {
            at: Utc::now(),
            source_name: source_name.to_string(),
            text: text.to_string(),
        });
        debug!("Digest for {} now holds {} entries", destination, log.len());
    }

    /// Take every entry newer than `window`, oldest first, and clear the log.
    pub async fn drain_recent(&self, window: ChronoDuration) -> BTreeMap<String, Vec<DigestEntry>> {
        let cutoff = Utc::now() - window;
        let mut entries = self.entries.lock().await;

        entries
            .drain()
            .map(|(dest, log)| {
                let recent: Vec<DigestEntry> = log.into_iter().filter(|e| e.at >= cutoff).collect();
                (dest, recent)
            })
            .collect()
    }

    /// Put entries back, e.g. after a failed summary run.
    pub async fn restore(&self, drained: BTreeMap<String, Vec<DigestEntry>>) {
        let mut entries = self.entries.lock().await;
        for (dest, mut old) in drained {
            let log = entries.entry(dest).or_default();
            old.extend(log.drain(..));
            let skip = old.len().saturating_sub(self.capacity);
            log.extend(old.into_iter().skip(skip));
        }
    }

    pub async fn len(&self, destination: &str) -> usize {
        self.entries
            .lock()
            .await
            .get(destination)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}
