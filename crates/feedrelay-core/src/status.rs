//! Health metrics and status notifications

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::outbound::{ChunkedSend, Outbound, send_chunked};

/// Increment-only processing counters.
#[derive(Debug, Default)]
pub struct Metrics {
    total_messages: AtomicU64,
    processed: AtomicU64,
    errors: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total_messages: u64,
    pub processed: u64,
    pub errors: u64,
    pub dropped: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_messages: self.total_messages.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Format an uptime like `2d 5h 30m`. Minutes are always shown.
pub fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let minutes = (secs % 3_600) / 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{}d", days));
    }
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    parts.push(format!("{}m", minutes));
    parts.join(" ")
}

/// Sends startup, periodic and error notifications to a status destination.
///
/// With no destination configured every report is a no-op. Send failures are
/// logged and swallowed; status reporting never takes the relay down.
#[derive(Clone)]
pub struct StatusReporter {
    outbound: Arc<dyn Outbound>,
    destination: Option<String>,
    started_at: DateTime<Utc>,
    chunking: ChunkedSend,
}

impl StatusReporter {
    pub fn new(outbound: Arc<dyn Outbound>, destination: Option<String>) -> Self {
        let destination = destination.filter(|d| !d.trim().is_empty());
        match &destination {
            Some(dest) => info!("Status reporting enabled: {}", dest),
            None => info!("Status reporting is disabled (no status destination configured)"),
        }

        Self {
            outbound,
            destination,
            started_at: Utc::now(),
            chunking: ChunkedSend::default(),
        }
    }

    pub fn with_chunking(mut self, chunking: ChunkedSend) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.destination.is_some()
    }

    pub async fn report_startup(&self, monitored_sources: usize) {
        let message = format!(
            "**Relay Started**\n\n\
             **Time:** {}\n\
             **Status:** Operational\n\
             **Monitoring:** {} sources\n\n\
             The relay is now running and processing messages.",
            self.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            monitored_sources
        );
        self.send("startup notification", &message).await;
    }

    pub async fn report_periodic(&self, metrics: &MetricsSnapshot) {
        let uptime = (Utc::now() - self.started_at).to_std().unwrap_or_default();
        let message = format!(
            "**Periodic Status Update**\n\n\
             **Time:** {}\n\
             **Uptime:** {}\n\
             **Status:** Operational\n\n\
             **Metrics:**\n\
             • Total Messages: {}\n\
             • Processed: {}\n\
             • Errors: {}\n\
             • Dropped: {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            format_uptime(uptime),
            metrics.total_messages,
            metrics.processed,
            metrics.errors,
            metrics.dropped
        );
        self.send("periodic status", &message).await;
    }

    pub async fn report_error(&self, kind: &str, message: &str, context: &BTreeMap<String, String>) {
        let mut text = format!(
            "**Error Alert**\n\n\
             **Time:** {}\n\
             **Type:** {}\n\
             **Error:** {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            kind,
            message
        );
        if !context.is_empty() {
            text.push_str("\n**Context:**\n");
            for (k, v) in context {
                text.push_str(&format!("• {}: {}\n", k, v));
            }
        }
        text.push_str("\nThe relay continues running, but this error may require attention.");

        self.send("error report", &text).await;
    }

    /// Report `metrics()` every `interval` until `token` is cancelled.
    pub fn start_periodic_updates<F>(&self, metrics: F, interval: Duration, token: CancellationToken) -> JoinHandle<()>
    where
        F: Fn() -> MetricsSnapshot + Send + 'static,
    {
        let reporter = self.clone();
        info!("Periodic status updates started (every {:?})", interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("Periodic status updates cancelled");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        reporter.report_periodic(&metrics()).await;
                    }
                }
            }
        })
    }

    async fn send(&self, what: &str, text: &str) {
        let Some(destination) = &self.destination else {
            debug!("Skipping {} (status reporting disabled)", what);
            return;
        };

        match send_chunked(self.outbound.as_ref(), destination, text, self.chunking).await {
            Ok(_) => info!("Sent {}", what),
            Err(e) => error!("Failed to send {}: {}", what, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::DryRunOutbound;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_secs(59)), "0m");
        assert_eq!(format_uptime(Duration::from_secs(3_600 + 120)), "1h 2m");
        assert_eq!(
            format_uptime(Duration::from_secs(2 * 86_400 + 5 * 3_600 + 30 * 60)),
            "2d 5h 30m"
        );
    }

    #[test]
    fn test_metrics_snapshot() {
        let m = Metrics::new();
        m.record_received();
        m.record_received();
        m.record_processed();
        m.record_error();
        assert_eq!(
            m.snapshot(),
            MetricsSnapshot { total_messages: 2, processed: 1, errors: 1, dropped: 0 }
        );
    }

    #[tokio::test]
    async fn test_disabled_reporter_is_noop() {
        let out = Arc::new(DryRunOutbound::new());
        let reporter = StatusReporter::new(out.clone(), Some("  ".into()));

        assert!(!reporter.is_enabled());
        reporter.report_startup(3).await;
        reporter.report_error("X", "y", &BTreeMap::new()).await;
        assert!(out.sent().is_empty());
    }

    #[tokio::test]
    async fn test_error_report_includes_context() {
        let out = Arc::new(DryRunOutbound::new());
        let reporter = StatusReporter::new(out.clone(), Some("@status".into()));

        let mut ctx = BTreeMap::new();
        ctx.insert("source_id".to_string(), "telegram_-100".to_string());
        reporter.report_error("External Service", "timeout", &ctx).await;

        let sent = out.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "@status");
        assert!(sent[0].1.contains("**Type:** External Service"));
        assert!(sent[0].1.contains("• source_id: telegram_-100"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_updates_until_cancelled() {
        let out = Arc::new(DryRunOutbound::new());
        let reporter = StatusReporter::new(out.clone(), Some("@status".into()));
        let metrics = Arc::new(Metrics::new());
        metrics.record_received();

        let token = CancellationToken::new();
        let m = metrics.clone();
        let handle = reporter.start_periodic_updates(move || m.snapshot(), Duration::from_secs(3_600), token.clone());

        tokio::time::sleep(Duration::from_secs(3 * 3_600 + 60)).await;
        token.cancel();
        handle.await.unwrap();

        let sent = out.sent();
        assert_eq!(sent.len(), 3);
        assert!(sent[0].1.contains("Total Messages: 1"));
    }
}
