//! Outbound send capability and chunked delivery

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::chunker;
use crate::error::Result;

/// Anything that can deliver text to a destination.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send_text(&self, destination: &str, text: &str) -> Result<()>;
}

/// Chunking parameters for one destination transport.
#[derive(Debug, Clone, Copy)]
pub struct ChunkedSend {
    pub max_len: usize,
    /// Pause between consecutive parts to the same destination.
    pub part_delay: Duration,
}

impl Default for ChunkedSend {
    fn default() -> Self {
        Self {
            max_len: chunker::DEFAULT_MAX_LEN,
            part_delay: Duration::from_secs(1),
        }
    }
}

/// Split `text` and send every part in order, pausing between parts.
///
/// Returns the number of parts sent. Stops at the first failed part.
pub async fn send_chunked(
    outbound: &dyn Outbound,
    destination: &str,
    text: &str,
    opts: ChunkedSend,
) -> Result<usize> {
    let parts = chunker::split(text, opts.max_len);
    let total = parts.len();

    for (i, part) in parts.iter().enumerate() {
        outbound.send_text(destination, part).await?;
        if i + 1 < total {
            tokio::time::sleep(opts.part_delay).await;
        }
    }

    if total > 1 {
        info!("Sent long message to {} in {} parts", destination, total);
    }
    Ok(total)
}

/// Outbound that only logs and remembers what would have been sent.
#[derive(Debug, Default)]
pub struct DryRunOutbound {
    sent: Mutex<Vec<(String, String)>>,
}

impl DryRunOutbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything sent so far as `(destination, text)` pairs.
    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Outbound for DryRunOutbound {
    async fn send_text(&self, destination: &str, text: &str) -> Result<()> {
        debug!("[dry-run] -> {}: {}", destination, text);
        if let Ok(mut sent) = self.sent.lock() {
            sent.push((destination.to_string(), text.to_string()));
        }
        Ok(())
    }
}
