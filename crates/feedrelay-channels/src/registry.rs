//! Registry of message sources and the fan-in loop feeding the dispatcher

use feedrelay_core::{MessageHandler, RelayError, Result};
use futures_util::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::source::Source;

/// Holds every configured source, keyed by source id.
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<dyn Source>>,
    max_in_flight: Option<usize>,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: BTreeMap::new(),
            max_in_flight: None,
        }
    }

    /// Bound the number of handler invocations running at once.
    ///
    /// `None` spawns every message immediately. With `Some(n)` a fan-in loop
    /// waits for a free slot before taking the next message off its stream.
    pub fn with_max_in_flight(mut self, limit: Option<usize>) -> Self {
        self.max_in_flight = limit.filter(|n| *n > 0);
        self
    }

    pub fn max_in_flight(&self) -> Option<usize> {
        self.max_in_flight
    }

    pub fn register(&mut self, source: Arc<dyn Source>) -> Result<()> {
        let id = source.source_id().to_string();
        if self.sources.contains_key(&id) {
            return Err(RelayError::DuplicateSource(id));
        }
        info!("Registering source: {} ({})", source.name(), id);
        self.sources.insert(id, source);
        Ok(())
    }

    pub fn unregister(&mut self, source_id: &str) -> Option<Arc<dyn Source>> {
        let removed = self.sources.remove(source_id);
        if removed.is_some() {
            info!("Unregistered source: {}", source_id);
        }
        removed
    }

    pub fn get(&self, source_id: &str) -> Option<Arc<dyn Source>> {
        self.sources.get(source_id).cloned()
    }

    /// Registered sources in source-id order.
    pub fn list(&self) -> Vec<Arc<dyn Source>> {
        self.sources.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Start every source concurrently.
    ///
    /// Returns true if at least one source started. A failing source is
    /// logged and left stopped; it does not affect the others.
    pub async fn start_all(&self) -> bool {
        if self.sources.is_empty() {
            warn!("No sources registered, nothing to start");
            return false;
        }
        info!("Starting all {} registered sources", self.sources.len());

        let handles: Vec<_> = self
            .sources
            .iter()
            .map(|(id, source)| {
                let id = id.clone();
                let source = source.clone();
                tokio::spawn(async move {
                    let result = source.start().await;
                    (id, result)
                })
            })
            .collect();

        let mut started = 0usize;
        let mut failed = Vec::new();
        for joined in join_all(handles).await {
            match joined {
                Ok((id, Ok(()))) => {
                    debug!("Source {} started", id);
                    started += 1;
                }
                Ok((id, Err(e))) => {
                    error!("Failed to start source {}: {}", id, e);
                    failed.push(id);
                }
                Err(e) => {
                    error!("Source start task panicked: {}", e);
                    failed.push("<panicked>".to_string());
                }
            }
        }

        if failed.is_empty() {
            info!("All {} sources started successfully", started);
        } else if started > 0 {
            warn!(
                "Started {}/{} sources, failed: {}",
                started,
                self.sources.len(),
                failed.join(", ")
            );
        } else {
            error!("No source could be started");
        }
        started > 0
    }

    /// Stop every source concurrently. Failures are logged, never returned.
    pub async fn stop_all(&self) {
        info!("Stopping all {} sources", self.sources.len());
        let stops = self.sources.iter().map(|(id, source)| async move {
            if let Err(e) = source.stop().await {
                warn!("Error stopping source {}: {}", id, e);
            }
        });
        join_all(stops).await;
    }

    /// Fan every running source's stream into `handler`.
    ///
    /// Each source gets its own fan-in task and each message its own spawned
    /// task, so a slow message never holds up the next one. Returns once every
    /// stream has ended or `token` is cancelled. Handler tasks already spawned
    /// are not awaited.
    pub async fn process_messages(&self, handler: Arc<dyn MessageHandler>, token: CancellationToken) {
        let limiter = self.max_in_flight.map(|n| Arc::new(Semaphore::new(n)));
        let mut fan_in = JoinSet::new();

        for (id, source) in &self.sources {
            let Some(mut stream) = source.messages() else {
                debug!("Source {} has no stream to consume ({})", id, source.state());
                continue;
            };

            let id = id.clone();
            let handler = handler.clone();
            let token = token.clone();
            let limiter = limiter.clone();

            fan_in.spawn(async move {
                loop {
                    let message = tokio::select! {
                        _ = token.cancelled() => break,
                        next = stream.recv() => match next {
                            Some(message) => message,
                            None => break,
                        },
                    };

                    let permit = match &limiter {
                        Some(semaphore) => {
                            let acquired = tokio::select! {
                                _ = token.cancelled() => break,
                                permit = semaphore.clone().acquire_owned() => permit,
                            };
                            match acquired {
                                Ok(permit) => Some(permit),
                                Err(_) => break,
                            }
                        }
                        None => None,
                    };

                    let handler = handler.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        handler.handle(message).await;
                    });
                }
                debug!("Fan-in for source {} finished", id);
            });
        }

        if fan_in.is_empty() {
            warn!("No running sources to consume messages from");
            return;
        }
        info!("Consuming messages from {} sources", fan_in.len());

        while let Some(joined) = fan_in.join_next().await {
            if let Err(e) = joined {
                error!("Fan-in task failed: {}", e);
            }
        }
        info!("Message processing finished");
    }

    /// Health of every source. A check that panics reports false for that
    /// source only.
    pub async fn health_check(&self) -> HashMap<String, bool> {
        let checks: Vec<_> = self
            .sources
            .iter()
            .map(|(id, source)| {
                let source = source.clone();
                (id.clone(), tokio::spawn(async move { source.health_check().await }))
            })
            .collect();

        let mut report = HashMap::with_capacity(checks.len());
        for (id, handle) in checks {
            let healthy = match handle.await {
                Ok(healthy) => healthy,
                Err(e) => {
                    warn!("Health check for {} failed: {}", id, e);
                    false
                }
            };
            report.insert(id, healthy);
        }
        report
    }
}
