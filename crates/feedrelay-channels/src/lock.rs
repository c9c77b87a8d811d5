//! Single-instance lock file
//!
//! The file holds two lines: the owning process id and the acquisition time
//! as fractional seconds since the Unix epoch.

use feedrelay_core::{RelayError, Result};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, info, warn};

/// Locks older than this are reclaimed regardless of their owner.
pub const STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockRecord {
    pub pid: u32,
    pub acquired_at: f64,
}

impl LockRecord {
    pub fn current() -> Self {
        Self {
            pid: std::process::id(),
            acquired_at: epoch_secs(SystemTime::now()),
        }
    }

    pub fn parse(content: &str) -> Option<Self> {
        let mut lines = content.lines();
        let pid = lines.next()?.trim().parse().ok()?;
        let acquired_at: f64 = lines.next()?.trim().parse().ok()?;
        if !acquired_at.is_finite() {
            return None;
        }
        Some(Self { pid, acquired_at })
    }

    pub fn render(&self) -> String {
        format!("{}\n{}\n", self.pid, self.acquired_at)
    }

    /// Saturates at `Duration::MAX` for timestamps too far in the past.
    pub fn age(&self, now: SystemTime) -> Duration {
        Duration::try_from_secs_f64((epoch_secs(now) - self.acquired_at).max(0.0)).unwrap_or(Duration::MAX)
    }
}

/// Result of looking at an existing lock file.
#[derive(Debug, Clone, PartialEq)]
pub enum LockStatus {
    Absent,
    Stale(String),
    Held(LockRecord),
}

/// Decide whether `content` describes a lock that is still valid.
pub fn classify(content: &str, now: SystemTime, is_alive: impl Fn(u32) -> bool) -> LockStatus {
    let Some(record) = LockRecord::parse(content) else {
        return LockStatus::Stale("unreadable lock record".into());
    };
    let age = record.age(now);
    if age > STALE_AFTER {
        return LockStatus::Stale(format!("lock is {}h old", age.as_secs() / 3600));
    }
    if !is_alive(record.pid) {
        return LockStatus::Stale(format!("process {} is gone", record.pid));
    }
    LockStatus::Held(record)
}

pub fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).is_some()
}

fn epoch_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// The lock file for one session identity.
#[derive(Debug, Clone)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> Result<LockStatus> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(classify(&content, SystemTime::now(), process_alive)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(LockStatus::Absent),
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                Ok(LockStatus::Stale("lock record is not text".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Take the lock, reclaiming a stale one.
    ///
    /// Fails with `DuplicateInstance` while another live process holds it.
    /// The returned guard removes the file when dropped.
    pub fn acquire(&self) -> Result<LockGuard> {
        match self.status()? {
            LockStatus::Held(record) => {
                return Err(RelayError::DuplicateInstance { pid: record.pid });
            }
            LockStatus::Stale(reason) => {
                warn!("Removing stale lock {}: {}", self.path.display(), reason);
                match fs::remove_file(&self.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            LockStatus::Absent => {}
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                // Lost a race with another process starting at the same time
                let pid = fs::read_to_string(&self.path)
                    .ok()
                    .and_then(|c| LockRecord::parse(&c))
                    .map(|r| r.pid)
                    .unwrap_or_default();
                return Err(RelayError::DuplicateInstance { pid });
            }
            Err(e) => return Err(e.into()),
        };

        let guard = LockGuard {
            path: self.path.clone(),
        };
        file.write_all(LockRecord::current().render().as_bytes())?;
        file.sync_all()?;
        info!("Acquired lock {}", self.path.display());
        Ok(guard)
    }
}

/// Holds the lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Released lock {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove lock {}: {}", self.path.display(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lock_in(dir: &TempDir) -> LockFile {
        LockFile::new(dir.path().join("session.lock"))
    }

    #[test]
    fn test_record_format() {
        let record = LockRecord {
            pid: 4242,
            acquired_at: 1700000000.5,
        };
        let rendered = record.render();
        assert_eq!(rendered, "4242\n1700000000.5\n");
        assert_eq!(LockRecord::parse(&rendered), Some(record));
        assert_eq!(LockRecord::parse("garbage"), None);
        assert_eq!(LockRecord::parse("12\n"), None);
    }

    #[test]
    fn test_classify() {
        let now = SystemTime::now();
        let fresh = LockRecord {
            pid: 7,
            acquired_at: epoch_secs(now) - 60.0,
        }
        .render();
        let old = LockRecord {
            pid: 7,
            acquired_at: epoch_secs(now) - 25.0 * 3600.0,
        }
        .render();

        assert!(matches!(classify(&fresh, now, |_| true), LockStatus::Held(r) if r.pid == 7));
        assert!(matches!(classify(&fresh, now, |_| false), LockStatus::Stale(_)));
        assert!(matches!(classify(&old, now, |_| true), LockStatus::Stale(_)));
        assert!(matches!(classify("", now, |_| true), LockStatus::Stale(_)));
    }

    #[test]
    fn test_current_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);
        assert_eq!(lock.status().unwrap(), LockStatus::Absent);

        let guard = lock.acquire().unwrap();
        let content = fs::read_to_string(lock.path()).unwrap();
        assert_eq!(LockRecord::parse(&content).unwrap().pid, std::process::id());

        drop(guard);
        assert!(!lock.path().exists());
    }

    #[test]
    fn test_live_holder_blocks_second_acquire() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);
        let _guard = lock.acquire().unwrap();

        let err = lock.acquire().unwrap_err();
        assert!(matches!(err, RelayError::DuplicateInstance { pid } if pid == std::process::id()));
        assert!(lock.path().exists());
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);
        let ancient = LockRecord {
            pid: std::process::id(),
            acquired_at: epoch_secs(SystemTime::now()) - 48.0 * 3600.0,
        };
        fs::write(lock.path(), ancient.render()).unwrap();

        let guard = lock.acquire().unwrap();
        let content = fs::read_to_string(guard.path()).unwrap();
        assert!(LockRecord::parse(&content).unwrap().acquired_at > ancient.acquired_at);
    }

    #[test]
    fn test_dead_owner_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);
        let orphan = LockRecord {
            pid: u32::MAX - 1,
            acquired_at: epoch_secs(SystemTime::now()),
        };
        fs::write(lock.path(), orphan.render()).unwrap();

        assert!(matches!(lock.status().unwrap(), LockStatus::Stale(_)));
        lock.acquire().unwrap().release();
        assert!(!lock.path().exists());
    }

    #[test]
    fn test_unreadable_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);
        fs::write(lock.path(), "not a lock").unwrap();
        assert!(lock.acquire().is_ok());
    }

    #[test]
    fn test_absurd_timestamp_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let lock = lock_in(&dir);
        fs::write(lock.path(), format!("{}\n-1e300\n", std::process::id())).unwrap();

        assert!(matches!(lock.status().unwrap(), LockStatus::Stale(_)));
        let guard = lock.acquire().unwrap();
        let content = fs::read_to_string(guard.path()).unwrap();
        assert!(LockRecord::parse(&content).unwrap().acquired_at > 0.0);
    }
}
