//! Shared run identity across cooperating worker processes.
//!
//! The lifecycle controller only needs a named lock and a small string map.
//! [`LocalCoordinator`] serves threads of one process, [`FileCoordinator`]
//! serves processes sharing a directory.

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use zbr_core::{current_unix_timestamp_ms, write_text_atomic};

use crate::context::lock_or_recover;
use crate::error::CoordinationError;

pub const COORDINATION_LOCK: &str = "zebrunner";
pub const RUN_ID_KEY: &str = "ZEBRUNNER_TEST_RUN_ID";
pub const RUNNING_TESTS_KEY: &str = "ZEBRUNNER_RUNNING_TESTS";
pub const RUN_FINISHED_KEY: &str = "ZEBRUNNER_RUN_FINISHED";

const SHARED_VALUES_FILE: &str = "shared-values.json";
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(50);
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(60);

/// Named mutex plus shared key/value store.
///
/// `get`/`set` are not locked themselves; callers combine them inside
/// [`Coordinator::with_lock`].
pub trait Coordinator: Send + Sync {
    fn with_lock(&self, name: &str, critical: &mut dyn FnMut()) -> Result<(), CoordinationError>;
    fn get(&self, key: &str) -> Result<Option<String>, CoordinationError>;
    fn set(&self, key: &str, value: &str) -> Result<(), CoordinationError>;

    /// Integer value of `key`; missing counts as zero.
    fn counter(&self, key: &str) -> Result<i64, CoordinationError> {
        match self.get(key)? {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map_err(|_| CoordinationError::NotAnInteger {
                    key: key.to_string(),
                    value: raw.clone(),
                }),
            None => Ok(0),
        }
    }

    /// Adds `delta` to an integer value and returns the new value.
    fn adjust_counter(&self, key: &str, delta: i64) -> Result<i64, CoordinationError> {
        let next = self.counter(key)? + delta;
        self.set(key, &next.to_string())?;
        Ok(next)
    }
}

/// In-process coordinator; every lock name shares one mutex.
#[derive(Default)]
pub struct LocalCoordinator {
    lock: Mutex<()>,
    values: Mutex<HashMap<String, String>>,
}

impl LocalCoordinator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Coordinator for LocalCoordinator {
    fn with_lock(&self, _name: &str, critical: &mut dyn FnMut()) -> Result<(), CoordinationError> {
        let _guard = lock_or_recover(&self.lock);
        critical();
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        Ok(lock_or_recover(&self.values).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CoordinationError> {
        lock_or_recover(&self.values).insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Directory-backed coordinator for worker processes on one host.
pub struct FileCoordinator {
    dir: PathBuf,
    worker: String,
    lock_timeout: Duration,
    stale_after: Duration,
}

impl FileCoordinator {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_timeouts(dir, DEFAULT_LOCK_TIMEOUT, DEFAULT_STALE_AFTER)
    }

    /// `stale_after` of zero disables stale lock reclaim.
    pub fn with_timeouts(dir: impl Into<PathBuf>, lock_timeout: Duration, stale_after: Duration) -> Self {
        Self {
            dir: dir.into(),
            worker: format!("pid-{}", std::process::id()),
            lock_timeout,
            stale_after,
        }
    }

    /// Label recorded in lock files this coordinator holds.
    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = worker.into();
        self
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn values_path(&self) -> PathBuf {
        self.dir.join(SHARED_VALUES_FILE)
    }

    fn read_values(&self) -> Result<BTreeMap<String, String>, CoordinationError> {
        let path = self.values_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(BTreeMap::new());
            }
            Err(source) => return Err(CoordinationError::Io { path, source }),
        };
        if raw.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&raw).map_err(|error| CoordinationError::Corrupted {
            path,
            message: error.to_string(),
        })
    }

    fn write_values(&self, values: &BTreeMap<String, String>) -> Result<(), CoordinationError> {
        let path = self.values_path();
        let encoded = serde_json::to_string_pretty(values).map_err(|error| {
            CoordinationError::Corrupted {
                path: path.clone(),
                message: error.to_string(),
            }
        })?;
        write_text_atomic(&path, &encoded).map_err(|error| CoordinationError::Persist {
            path,
            message: format!("{error:#}"),
        })
    }
}

impl Coordinator for FileCoordinator {
    fn with_lock(&self, name: &str, critical: &mut dyn FnMut()) -> Result<(), CoordinationError> {
        let _held = self.acquire(name)?;
        critical();
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, CoordinationError> {
        Ok(self.read_values()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), CoordinationError> {
        let mut values = self.read_values()?;
        values.insert(key.to_string(), value.to_string());
        self.write_values(&values)
    }
}

/// Identity written into a held lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub worker: String,
    pub pid: u32,
    pub acquired_at_ms: u64,
}

impl LockHolder {
    fn current(worker: &str) -> Self {
        Self {
            worker: worker.to_string(),
            pid: std::process::id(),
            acquired_at_ms: current_unix_timestamp_ms(),
        }
    }

    /// `None` while the holder is still writing or for foreign lock files.
    pub fn read(path: &Path) -> Option<Self> {
        let raw = fs::read_to_string(path).ok()?;
        serde_json::from_str(raw.trim()).ok()
    }

    fn describe(holder: Option<&Self>) -> String {
        holder.map_or_else(
            || "an unknown holder".to_string(),
            |holder| format!("worker '{}' (pid {})", holder.worker, holder.pid),
        )
    }
}

/// Removes the lock file when the critical section ends.
struct HeldLock {
    path: PathBuf,
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

impl FileCoordinator {
    fn acquire(&self, name: &str) -> Result<HeldLock, CoordinationError> {
        fs::create_dir_all(&self.dir).map_err(|source| CoordinationError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.dir.join(format!("{name}.lock"));
        let payload = serde_json::to_string(&LockHolder::current(&self.worker)).map_err(|error| {
            CoordinationError::Corrupted {
                path: path.clone(),
                message: error.to_string(),
            }
        })?;

        let deadline = Instant::now() + self.lock_timeout;
        loop {
            match OpenOptions::new().create_new(true).write(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(payload.as_bytes())
                        .map_err(|source| CoordinationError::Io {
                            path: path.clone(),
                            source,
                        })?;
                    debug!(worker = %self.worker, lock = %path.display(), "coordination lock acquired");
                    return Ok(HeldLock { path });
                }
                Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = LockHolder::read(&path);
                    if self.is_stale(&path, holder.as_ref()) && fs::remove_file(&path).is_ok() {
                        warn!(
                            lock = %path.display(),
                            holder = %LockHolder::describe(holder.as_ref()),
                            "reclaimed stale coordination lock"
                        );
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(CoordinationError::LockTimeout {
                            holder: LockHolder::describe(holder.as_ref()),
                            path,
                        });
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(source) => return Err(CoordinationError::Io { path, source }),
            }
        }
    }

    /// Age comes from the recorded acquisition time, or from the file's
    /// modification time when the payload is unreadable.
    fn is_stale(&self, path: &Path, holder: Option<&LockHolder>) -> bool {
        if self.stale_after.is_zero() {
            return false;
        }
        let age = match holder {
            Some(holder) => Duration::from_millis(
                current_unix_timestamp_ms().saturating_sub(holder.acquired_at_ms),
            ),
            None => match fs::metadata(path).and_then(|metadata| metadata.modified()) {
                Ok(modified) => SystemTime::now()
                    .duration_since(modified)
                    .unwrap_or(Duration::ZERO),
                Err(_) => return false,
            },
        };
        age >= self.stale_after
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use tempfile::tempdir;

    use super::{
        Coordinator, FileCoordinator, LocalCoordinator, LockHolder, COORDINATION_LOCK,
        RUNNING_TESTS_KEY, RUN_ID_KEY,
    };
    use crate::error::CoordinationError;

    #[test]
    fn unit_counter_starts_at_zero_and_tracks_deltas() {
        let coordinator = LocalCoordinator::new();
        assert_eq!(coordinator.adjust_counter(RUNNING_TESTS_KEY, 1).expect("inc"), 1);
        assert_eq!(coordinator.adjust_counter(RUNNING_TESTS_KEY, 1).expect("inc"), 2);
        assert_eq!(coordinator.adjust_counter(RUNNING_TESTS_KEY, -2).expect("dec"), 0);
    }

    #[test]
    fn regression_non_integer_counter_is_reported() {
        let coordinator = LocalCoordinator::new();
        coordinator.set(RUNNING_TESTS_KEY, "many").expect("set");
        let error = coordinator
            .adjust_counter(RUNNING_TESTS_KEY, 1)
            .expect_err("not an integer");
        assert!(matches!(error, CoordinationError::NotAnInteger { .. }));
    }

    #[test]
    fn integration_local_lock_serializes_threads() {
        let coordinator = Arc::new(LocalCoordinator::new());
        let workers = (0..8)
            .map(|_| {
                let coordinator = Arc::clone(&coordinator);
                thread::spawn(move || {
                    for _ in 0..25 {
                        let mut outcome = None;
                        coordinator
                            .with_lock(COORDINATION_LOCK, &mut || {
                                outcome = Some(coordinator.adjust_counter(RUNNING_TESTS_KEY, 1));
                            })
                            .expect("lock");
                        outcome.expect("ran").expect("adjust");
                    }
                })
            })
            .collect::<Vec<_>>();
        for worker in workers {
            worker.join().expect("join");
        }
        assert_eq!(
            coordinator.get(RUNNING_TESTS_KEY).expect("get").as_deref(),
            Some("200")
        );
    }

    #[test]
    fn functional_file_coordinators_share_values_through_directory() {
        let temp = tempdir().expect("tempdir");
        let first = FileCoordinator::new(temp.path());
        let second = FileCoordinator::new(temp.path());

        assert!(second.get(RUN_ID_KEY).expect("get").is_none());
        first
            .with_lock(COORDINATION_LOCK, &mut || {
                first.set(RUN_ID_KEY, "42").expect("set");
            })
            .expect("lock");
        assert_eq!(second.get(RUN_ID_KEY).expect("get").as_deref(), Some("42"));
        assert!(!temp.path().join("zebrunner.lock").exists());
    }

    #[test]
    fn integration_file_lock_serializes_threads() {
        let temp = tempdir().expect("tempdir");
        let dir = temp.path().to_path_buf();
        let workers = (0..4)
            .map(|_| {
                let dir = dir.clone();
                thread::spawn(move || {
                    let coordinator = FileCoordinator::new(dir);
                    for _ in 0..10 {
                        let mut outcome = None;
                        coordinator
                            .with_lock(COORDINATION_LOCK, &mut || {
                                outcome = Some(coordinator.adjust_counter(RUNNING_TESTS_KEY, 1));
                            })
                            .expect("lock");
                        outcome.expect("ran").expect("adjust");
                    }
                })
            })
            .collect::<Vec<_>>();
        for worker in workers {
            worker.join().expect("join");
        }
        let coordinator = FileCoordinator::new(&dir);
        assert_eq!(
            coordinator.get(RUNNING_TESTS_KEY).expect("get").as_deref(),
            Some("40")
        );
    }

    #[test]
    fn regression_held_lock_times_out() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("zebrunner.lock"), "1\n").expect("write lock");
        let coordinator = FileCoordinator::with_timeouts(
            temp.path(),
            Duration::from_millis(120),
            Duration::ZERO,
        );
        let mut ran = false;
        let error = coordinator
            .with_lock(COORDINATION_LOCK, &mut || ran = true)
            .expect_err("timeout");
        assert!(matches!(error, CoordinationError::LockTimeout { .. }));
        assert!(error.to_string().contains("an unknown holder"));
        assert!(!ran);
    }

    #[test]
    fn functional_lock_file_records_holder_while_held() {
        let temp = tempdir().expect("tempdir");
        let coordinator = FileCoordinator::new(temp.path()).with_worker("shard-2");
        let lock_path = temp.path().join("zebrunner.lock");
        let mut seen = None;
        coordinator
            .with_lock(COORDINATION_LOCK, &mut || seen = LockHolder::read(&lock_path))
            .expect("lock");

        let holder = seen.expect("holder recorded");
        assert_eq!(holder.worker, "shard-2");
        assert_eq!(holder.pid, std::process::id());
        assert!(!lock_path.exists());
    }

    #[test]
    fn regression_timeout_names_live_holder_and_old_holder_is_reclaimed() {
        let temp = tempdir().expect("tempdir");
        let lock_path = temp.path().join("zebrunner.lock");
        let live = LockHolder {
            worker: "shard-1".to_string(),
            pid: 4242,
            acquired_at_ms: zbr_core::current_unix_timestamp_ms(),
        };
        std::fs::write(&lock_path, serde_json::to_string(&live).expect("encode")).expect("write");
        let waiting = FileCoordinator::with_timeouts(
            temp.path(),
            Duration::from_millis(120),
            Duration::from_secs(60),
        );
        let error = waiting
            .with_lock(COORDINATION_LOCK, &mut || {})
            .expect_err("held by a live worker");
        assert!(error.to_string().contains("worker 'shard-1' (pid 4242)"));

        let abandoned = LockHolder {
            acquired_at_ms: live.acquired_at_ms.saturating_sub(120_000),
            ..live
        };
        std::fs::write(&lock_path, serde_json::to_string(&abandoned).expect("encode"))
            .expect("write");
        let mut ran = false;
        waiting
            .with_lock(COORDINATION_LOCK, &mut || ran = true)
            .expect("reclaimed");
        assert!(ran);
    }

    #[test]
    fn functional_stale_lock_is_reclaimed() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("zebrunner.lock"), "1\n").expect("write lock");
        thread::sleep(Duration::from_millis(30));
        let coordinator = FileCoordinator::with_timeouts(
            temp.path(),
            Duration::from_secs(5),
            Duration::from_millis(10),
        );
        let mut ran = false;
        coordinator
            .with_lock(COORDINATION_LOCK, &mut || ran = true)
            .expect("reclaimed");
        assert!(ran);
    }

    #[test]
    fn regression_corrupted_store_is_reported() {
        let temp = tempdir().expect("tempdir");
        std::fs::write(temp.path().join("shared-values.json"), "{not json").expect("write");
        let coordinator = FileCoordinator::new(temp.path());
        let error = coordinator.get(RUN_ID_KEY).expect_err("corrupted");
        assert!(matches!(error, CoordinationError::Corrupted { .. }));
    }
}
