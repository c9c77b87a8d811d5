//! The contract every message source implements

use async_trait::async_trait;
use feedrelay_core::{Result, SourceMessage};
use std::fmt;
use tokio::sync::mpsc;

/// Receiving end of a source's internal queue.
pub type MessageStream = mpsc::UnboundedReceiver<SourceMessage>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Stopped,
    Running,
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceState::Stopped => write!(f, "stopped"),
            SourceState::Running => write!(f, "running"),
        }
    }
}

/// Trait that all message sources implement
#[async_trait]
pub trait Source: Send + Sync {
    /// Human-readable name
    fn name(&self) -> &str;

    /// Identifier, unique within a registry
    fn source_id(&self) -> &str;

    /// Run connectivity/auth checks and begin producing messages.
    /// The source stays stopped if this fails.
    async fn start(&self) -> Result<()>;

    /// Stop producing and release resources. Idempotent, and safe to call
    /// on a source whose `start` failed.
    async fn stop(&self) -> Result<()>;

    /// Hand over the message stream. Returns `None` when the source is not
    /// running or the stream was already taken. The stream ends once the
    /// source stops.
    fn messages(&self) -> Option<MessageStream>;

    fn state(&self) -> SourceState;

    async fn health_check(&self) -> bool {
        self.state() == SourceState::Running
    }
}

/// Queue and lifecycle bookkeeping shared by the bundled source variants.
///
/// Each source owns one of these by composition. `begin` opens a fresh
/// queue and cancellation token; `end` cancels the token and drops the
/// stored sender so the stream finishes once producer tasks exit.
pub(crate) struct SourceQueue {
    inner: std::sync::Mutex<QueueInner>,
}

struct QueueInner {
    state: SourceState,
    tx: Option<mpsc::UnboundedSender<SourceMessage>>,
    rx: Option<MessageStream>,
    token: Option<tokio_util::sync::CancellationToken>,
}

impl SourceQueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(QueueInner {
                state: SourceState::Stopped,
                tx: None,
                rx: None,
                token: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open the queue. Returns `None` if the source is already running.
    pub(crate) fn begin(
        &self,
    ) -> Option<(mpsc::UnboundedSender<SourceMessage>, tokio_util::sync::CancellationToken)> {
        let mut inner = self.lock();
        if inner.state == SourceState::Running {
            return None;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let token = tokio_util::sync::CancellationToken::new();
        inner.state = SourceState::Running;
        inner.tx = Some(tx.clone());
        inner.rx = Some(rx);
        inner.token = Some(token.clone());
        Some((tx, token))
    }

    /// Close the queue. Returns whether the source was running.
    pub(crate) fn end(&self) -> bool {
        let mut inner = self.lock();
        if let Some(token) = inner.token.take() {
            token.cancel();
        }
        inner.tx = None;
        inner.rx = None;
        let was_running = inner.state == SourceState::Running;
        inner.state = SourceState::Stopped;
        was_running
    }

    pub(crate) fn take_stream(&self) -> Option<MessageStream> {
        let mut inner = self.lock();
        if inner.state != SourceState::Running {
            return None;
        }
        inner.rx.take()
    }

    pub(crate) fn state(&self) -> SourceState {
        self.lock().state
    }
}

/// Bounded set of already-emitted item ids for polling sources.
pub(crate) struct SeenIds {
    capacity: usize,
    ids: std::collections::HashSet<String>,
    order: std::collections::VecDeque<String>,
}

impl SeenIds {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            ids: std::collections::HashSet::new(),
            order: std::collections::VecDeque::new(),
        }
    }

    /// Record `id`. Returns false if it was already seen.
    pub(crate) fn insert(&mut self, id: &str) -> bool {
        if self.ids.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.ids.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}

/// Run `tick` every `interval` until `token` is cancelled. The first tick
/// happens one interval after the call.
pub(crate) async fn poll_every<F, Fut>(interval: std::time::Duration, token: tokio_util::sync::CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tick() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_lifecycle() {
        let queue = SourceQueue::new();
        assert_eq!(queue.state(), SourceState::Stopped);
        assert!(queue.take_stream().is_none());

        let (tx, token) = queue.begin().unwrap();
        assert!(queue.begin().is_none());
        assert_eq!(queue.state(), SourceState::Running);

        let mut stream = queue.take_stream().unwrap();
        assert!(queue.take_stream().is_none());

        let msg = SourceMessage::builder("s", "s").text("x").build().unwrap();
        tx.send(msg).unwrap();
        assert!(stream.try_recv().is_ok());

        assert!(queue.end());
        assert!(token.is_cancelled());
        drop(tx);
        assert!(matches!(
            stream.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(!queue.end());
    }

    #[test]
    fn test_seen_ids_evicts_oldest() {
        let mut seen = SeenIds::new(2);
        assert!(seen.insert("a"));
        assert!(!seen.insert("a"));
        assert!(seen.insert("b"));
        assert!(seen.insert("c"));
        assert_eq!(seen.len(), 2);
        assert!(seen.insert("a"));
        assert!(!seen.insert("c"));
    }
}
