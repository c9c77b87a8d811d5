//! Daily per-destination summary of forwarded content

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use chrono_tz::Tz;
use feedrelay_core::envelope::{daily_header, no_activity_notice};
use feedrelay_core::{ChunkedSend, ContentProcessor, DigestEntry, DigestLog, Outbound, ProcessingContext, send_chunked};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::daily::{Clock, system_clock};

/// Builds and sends the daily summary for every destination.
///
/// Destinations configured up front receive a "No Activity" notice when
/// nothing was forwarded to them. Entries for a destination whose summary
/// fails are put back into the log for the next run.
pub struct DailyDigest {
    log: Arc<DigestLog>,
    processor: Arc<dyn ContentProcessor>,
    outbound: Arc<dyn Outbound>,
    destinations: Vec<String>,
    tz: Tz,
    chunking: ChunkedSend,
    window: ChronoDuration,
    clock: Clock,
}

impl DailyDigest {
    pub fn new(
        log: Arc<DigestLog>,
        processor: Arc<dyn ContentProcessor>,
        outbound: Arc<dyn Outbound>,
        destinations: Vec<String>,
        tz: Tz,
    ) -> Self {
        Self {
            log,
            processor,
            outbound,
            destinations,
            tz,
            chunking: ChunkedSend::default(),
            window: ChronoDuration::hours(24),
            clock: system_clock(),
        }
    }

    pub fn with_chunking(mut self, chunking: ChunkedSend) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub async fn run(&self) -> Result<()> {
        let now = (self.clock)().with_timezone(&self.tz);
        let mut drained = self.log.drain_recent(self.window).await;

        let targets: BTreeSet<String> = self
            .destinations
            .iter()
            .cloned()
            .chain(drained.keys().cloned())
            .collect();
        info!("Building daily summary for {} destinations", targets.len());

        let mut failed: BTreeMap<String, Vec<DigestEntry>> = BTreeMap::new();
        let mut errors = Vec::new();

        for destination in targets {
            let entries = drained.remove(&destination).unwrap_or_default();

            let outcome = if entries.is_empty() {
                let notice = no_activity_notice(&now, &destination);
                send_chunked(self.outbound.as_ref(), &destination, &notice, self.chunking)
                    .await
                    .map(|_| ())
                    .with_context(|| format!("sending no-activity notice to {}", destination))
            } else {
                self.summarize(&now, &destination, &entries).await
            };

            if let Err(e) = outcome {
                warn!("Daily summary for {} failed: {:#}", destination, e);
                errors.push(format!("{:#}", e));
                if !entries.is_empty() {
                    failed.insert(destination, entries);
                }
            }
        }

        if !failed.is_empty() {
            self.log.restore(failed).await;
        }
        if !errors.is_empty() {
            anyhow::bail!("{} daily summaries failed: {}", errors.len(), errors.join("; "));
        }

        info!("Daily summary sent");
        Ok(())
    }

    async fn summarize(&self, now: &chrono::DateTime<Tz>, destination: &str, entries: &[DigestEntry]) -> Result<()> {
        let input = entries
            .iter()
            .map(|e| format!("[{}] {}", e.source_name, e.text.trim()))
            .collect::<Vec<_>>()
            .join("\n\n---\n\n");

        let mut context = ProcessingContext::new();
        context.insert("task".into(), Value::from("daily_summary"));
        context.insert("destination".into(), Value::from(destination));
        context.insert("message_count".into(), Value::from(entries.len()));

        let summary = self
            .processor
            .process(&input, &context)
            .await
            .with_context(|| format!("summarizing {} messages for {}", entries.len(), destination))?;

        let mut text = daily_header(now, destination, entries.len());
        text.push_str(summary.trim());

        let parts = send_chunked(self.outbound.as_ref(), destination, &text, self.chunking)
            .await
            .with_context(|| format!("sending daily summary to {}", destination))?;
        info!(
            "Sent daily summary of {} messages to {} ({} parts)",
            entries.len(),
            destination,
            parts
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use feedrelay_core::{DryRunOutbound, PassthroughProcessor, RelayError};
    use std::time::Duration;

    fn fixed_clock() -> Clock {
        Arc::new(|| Utc.with_ymd_and_hms(2024, 12, 7, 9, 0, 0).unwrap())
    }

    fn digest(
        log: Arc<DigestLog>,
        processor: Arc<dyn ContentProcessor>,
        out: Arc<DryRunOutbound>,
        destinations: &[&str],
    ) -> DailyDigest {
        DailyDigest::new(
            log,
            processor,
            out,
            destinations.iter().map(|d| d.to_string()).collect(),
            Tz::UTC,
        )
        .with_clock(fixed_clock())
        .with_chunking(ChunkedSend {
            max_len: 4000,
            part_delay: Duration::ZERO,
        })
    }

    struct Unavailable;

    #[async_trait]
    impl ContentProcessor for Unavailable {
        async fn process(&self, _text: &str, _context: &ProcessingContext) -> feedrelay_core::Result<String> {
            Err(RelayError::ExternalService("503".into()))
        }
    }

    #[tokio::test]
    async fn test_summary_and_no_activity_notice() {
        let log = Arc::new(DigestLog::default());
        log.record("@crypto", "BWEnews", "ETF inflows rise").await;
        log.record("@crypto", "Foresight", "New L2 launch").await;

        let out = Arc::new(DryRunOutbound::new());
        let job = digest(log.clone(), Arc::new(PassthroughProcessor), out.clone(), &["@crypto", "@equities"]);
        job.run().await.unwrap();

        let sent = out.sent();
        assert_eq!(sent.len(), 2);

        let (dest, text) = &sent[0];
        assert_eq!(dest, "@crypto");
        assert!(text.starts_with("#dailysummary 07 Dec\n**@crypto** | 2 messages analyzed\n\n"));
        assert!(text.contains("[BWEnews] ETF inflows rise"));
        assert!(text.contains("[Foresight] New L2 launch"));

        let (dest, text) = &sent[1];
        assert_eq!(dest, "@equities");
        assert!(text.contains("No Activity"));

        assert_eq!(log.len("@crypto").await, 0);
    }

    #[tokio::test]
    async fn test_failed_summary_keeps_entries() {
        let log = Arc::new(DigestLog::default());
        log.record("@crypto", "BWEnews", "ETF inflows rise").await;

        let out = Arc::new(DryRunOutbound::new());
        let job = digest(log.clone(), Arc::new(Unavailable), out.clone(), &[]);

        assert!(job.run().await.is_err());
        assert!(out.sent().is_empty());
        assert_eq!(log.len("@crypto").await, 1);
    }

    #[tokio::test]
    async fn test_unconfigured_destinations_with_activity_are_included() {
        let log = Arc::new(DigestLog::default());
        log.record("@macro", "Desk", "CPI print").await;

        let out = Arc::new(DryRunOutbound::new());
        let job = digest(log, Arc::new(PassthroughProcessor), out.clone(), &[]);
        job.run().await.unwrap();

        let sent = out.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "@macro");
    }
}
