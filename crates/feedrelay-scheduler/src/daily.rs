//! Run a job once a day at a local time of day

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Pause after a failed run before scheduling the next one.
pub const FAILURE_COOLDOWN: Duration = Duration::from_secs(60 * 60);

/// Source of the current time.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Resolve a local wall time, pushing times inside a DST gap forward to the
/// first minute that exists.
fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    if let Some(at) = tz.from_local_datetime(&local).earliest() {
        return Some(at.with_timezone(&Utc));
    }
    (1..=24 * 60)
        .map(|minutes| local + ChronoDuration::minutes(minutes))
        .find_map(|shifted| tz.from_local_datetime(&shifted).earliest())
        .map(|at| at.with_timezone(&Utc))
}

/// First instant strictly after `after` whose local time in `tz` is `time`.
pub fn next_occurrence(after: DateTime<Utc>, time: NaiveTime, tz: Tz) -> DateTime<Utc> {
    let today = after.with_timezone(&tz).date_naive();
    (0..=2)
        .filter_map(|offset| today.checked_add_days(chrono::Days::new(offset)))
        .filter_map(|date| resolve_local(tz, date.and_time(time)))
        .find(|at| *at > after)
        .unwrap_or_else(|| after + ChronoDuration::days(1))
}

/// A job slot at a fixed local time every day.
///
/// Runs never overlap: the next slot is computed after the previous run
/// finishes, and always lies strictly after the previous slot.
pub struct DailySchedule {
    time: NaiveTime,
    tz: Tz,
    clock: Clock,
    failure_cooldown: Duration,
}

impl DailySchedule {
    pub fn new(time: NaiveTime, tz: Tz) -> Self {
        Self {
            time,
            tz,
            clock: system_clock(),
            failure_cooldown: FAILURE_COOLDOWN,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_failure_cooldown(mut self, cooldown: Duration) -> Self {
        self.failure_cooldown = cooldown;
        self
    }

    pub fn time(&self) -> NaiveTime {
        self.time
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Invoke `job` at every slot until `token` is cancelled.
    ///
    /// A failed run is logged and followed by the failure cooldown.
    /// Cancellation interrupts the wait and any run in progress.
    pub async fn run<F, Fut>(&self, name: &str, token: CancellationToken, mut job: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let mut last_slot: Option<DateTime<Utc>> = None;

        loop {
            let now = (self.clock)();
            let after = match last_slot {
                Some(slot) if slot > now => slot,
                _ => now,
            };
            let slot = next_occurrence(after, self.time, self.tz);
            let wait = (slot - now).to_std().unwrap_or_default();
            info!(
                "Next {} run at {} (in {}m)",
                name,
                slot.with_timezone(&self.tz).format("%Y-%m-%d %H:%M %Z"),
                wait.as_secs() / 60
            );

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            last_slot = Some(slot);

            debug!("Running {}", name);
            let outcome = tokio::select! {
                _ = token.cancelled() => break,
                outcome = job() => outcome,
            };

            match outcome {
                Ok(()) => info!("{} completed", name),
                Err(e) => {
                    error!("{} failed: {:#}", name, e);
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.failure_cooldown) => {}
                    }
                }
            }
        }

        info!("{} schedule stopped", name);
    }
}
