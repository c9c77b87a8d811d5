//! Connection lifecycle: lock, authenticate, reconnect with backoff

use feedrelay_core::{RelayError, Result};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::lock::{LockFile, LockGuard};
use crate::transport::{Transport, TransportError};

pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(300);

/// Doubling reconnect delay with a ceiling.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    initial: Duration,
    ceiling: Duration,
    current: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(INITIAL_RECONNECT_DELAY, MAX_RECONNECT_DELAY)
    }
}

impl ReconnectBackoff {
    pub fn new(initial: Duration, ceiling: Duration) -> Self {
        Self {
            initial,
            ceiling,
            current: initial,
        }
    }

    /// Delay to wait before the next reconnect attempt.
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Record a failed attempt.
    pub fn escalate(&mut self) {
        self.current = (self.current * 2).min(self.ceiling);
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Stopped,
}

/// Owns the lock record and keeps a transport connected.
///
/// Rate-limit signals are waited out verbatim and never count as failures.
/// A duplicated session or revoked authorization is fatal: the lock is
/// released and the run loop returns the error.
pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    lock: LockFile,
    credential: PathBuf,
    initial_delay: Duration,
    max_delay: Duration,
    inner: Mutex<SupervisorInner>,
}

struct SupervisorInner {
    state: ConnectionState,
    guard: Option<LockGuard>,
    shutdown: CancellationToken,
}

impl ConnectionSupervisor {
    pub fn new(transport: Arc<dyn Transport>, lock: LockFile, credential: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            lock,
            credential: credential.into(),
            initial_delay: INITIAL_RECONNECT_DELAY,
            max_delay: MAX_RECONNECT_DELAY,
            inner: Mutex::new(SupervisorInner {
                state: ConnectionState::Disconnected,
                guard: None,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn with_backoff(mut self, initial: Duration, ceiling: Duration) -> Self {
        self.initial_delay = initial;
        self.max_delay = ceiling.max(initial);
        self
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    fn lock_inner(&self) -> MutexGuard<'_, SupervisorInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> ConnectionState {
        self.lock_inner().state
    }

    fn set_state(&self, state: ConnectionState) {
        self.lock_inner().state = state;
    }

    fn shutdown_token(&self) -> CancellationToken {
        self.lock_inner().shutdown.clone()
    }

    fn release_lock(&self) {
        let guard = self.lock_inner().guard.take();
        drop(guard);
    }

    /// Take the lock and authenticate from the stored credential.
    pub async fn start(&self) -> Result<()> {
        let guard = self.lock.acquire()?;

        info!("Authenticating with {}", self.credential.display());
        if let Err(e) = self.transport.authenticate(&self.credential).await {
            drop(guard);
            self.set_state(ConnectionState::Disconnected);
            return Err(match e {
                TransportError::DuplicatedSession => RelayError::DuplicateInstance { pid: 0 },
                other => RelayError::Authentication(other.to_string()),
            });
        }

        let mut inner = self.lock_inner();
        inner.guard = Some(guard);
        inner.state = ConnectionState::Connected;
        inner.shutdown = CancellationToken::new();
        drop(inner);

        info!("Connection established");
        Ok(())
    }

    /// Keep the connection alive until `stop` is called or `token` is
    /// cancelled. Returns an error only for fatal conditions.
    pub async fn run(&self, token: &CancellationToken) -> Result<()> {
        let shutdown = self.shutdown_token();
        let mut backoff = ReconnectBackoff::new(self.initial_delay, self.max_delay);

        loop {
            if self.state() == ConnectionState::Stopped {
                return Ok(());
            }

            let outcome = tokio::select! {
                _ = token.cancelled() => return Ok(()),
                _ = shutdown.cancelled() => return Ok(()),
                outcome = self.transport.run_until_disconnected() => outcome,
            };

            match outcome {
                Ok(()) => {
                    if self.state() == ConnectionState::Stopped {
                        return Ok(());
                    }
                    warn!("Transport closed unexpectedly, reconnecting");
                }
                Err(TransportError::RateLimited { seconds }) => {
                    warn!("Rate limited, waiting {}s", seconds);
                    if !pause(Duration::from_secs(seconds), token, &shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(e @ (TransportError::DuplicatedSession | TransportError::Unauthorized(_))) => {
                    return Err(self.fail(e));
                }
                Err(TransportError::Disconnected(reason)) => {
                    warn!("Disconnected: {}", reason);
                }
            }

            self.set_state(ConnectionState::Disconnected);
            if !self.reconnect(&mut backoff, token, &shutdown).await? {
                return Ok(());
            }
        }
    }

    /// Returns false if cancelled before reconnecting.
    async fn reconnect(
        &self,
        backoff: &mut ReconnectBackoff,
        token: &CancellationToken,
        shutdown: &CancellationToken,
    ) -> Result<bool> {
        let mut wait = true;
        loop {
            if wait {
                let delay = backoff.current();
                info!("Reconnecting in {}s", delay.as_secs());
                if !pause(delay, token, shutdown).await {
                    return Ok(false);
                }
            }
            wait = true;

            match self.transport.reconnect().await {
                Ok(()) => {
                    backoff.reset();
                    self.set_state(ConnectionState::Connected);
                    info!("Reconnected");
                    return Ok(true);
                }
                Err(TransportError::RateLimited { seconds }) => {
                    warn!("Rate limited while reconnecting, waiting {}s", seconds);
                    if !pause(Duration::from_secs(seconds), token, shutdown).await {
                        return Ok(false);
                    }
                    wait = false;
                }
                Err(e @ (TransportError::DuplicatedSession | TransportError::Unauthorized(_))) => {
                    return Err(self.fail(e));
                }
                Err(e) => {
                    warn!("Reconnect failed: {}", e);
                    backoff.escalate();
                }
            }
        }
    }

    fn fail(&self, err: TransportError) -> RelayError {
        error!("Fatal connection error: {}", err);
        self.set_state(ConnectionState::Stopped);
        self.release_lock();
        match err {
            TransportError::DuplicatedSession => RelayError::DuplicateInstance { pid: 0 },
            other => RelayError::Authentication(other.to_string()),
        }
    }

    /// Close the transport and remove the lock, even if closing fails.
    pub async fn stop(&self) {
        let shutdown = {
            let mut inner = self.lock_inner();
            inner.state = ConnectionState::Stopped;
            inner.shutdown.clone()
        };
        shutdown.cancel();

        if self.transport.is_connected() {
            if let Err(e) = self.transport.close().await {
                warn!("Error closing transport: {}", e);
            }
        }
        self.release_lock();
        info!("Connection stopped");
    }
}

/// Sleep for `duration`. Returns false if cancelled first.
async fn pause(duration: Duration, token: &CancellationToken, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
