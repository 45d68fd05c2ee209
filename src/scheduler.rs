use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use uuid::Uuid;

use crate::db::Database;
use crate::engine::{RuleEngine, RunSummary};
use crate::error::EngineError;

/// Exclusive claim on the rule store for one run. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Take the lock at `path`. A lock file older than `stale_after` is left
    /// over from a crashed run and gets reclaimed.
    pub fn acquire(path: &Path, stale_after: Duration) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{} {}", std::process::id(), Utc::now().to_rfc3339())?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let age = fs::metadata(path)
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|t| SystemTime::now().duration_since(t).ok())
                        .unwrap_or_default();
                    if age < stale_after {
                        return Err(EngineError::Locked(path.display().to_string()));
                    }
                    let observed = match fs::read_to_string(path) {
                        Ok(text) => text,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                        Err(e) => return Err(e.into()),
                    };
                    log::warn!(
                        "Reclaiming stale run lock {} ({}s old)",
                        path.display(),
                        age.as_secs()
                    );
                    if !reclaim_stale(path, &observed)? {
                        return Err(EngineError::Locked(path.display().to_string()));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Locked(path.display().to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Move the stale lock aside and delete it, provided it still holds
/// `observed`. Returns false when another process replaced the lock since it
/// was judged stale; that lock is put back.
fn reclaim_stale(path: &Path, observed: &str) -> Result<bool, EngineError> {
    let aside = path.with_extension(format!("stale-{}", Uuid::new_v4().simple()));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
        Err(e) => return Err(e.into()),
    }

    let current = fs::read_to_string(&aside).unwrap_or_default();
    if current != observed {
        log::warn!("Run lock {} was taken over while reclaiming it", path.display());
        if let Err(e) = fs::hard_link(&aside, path) {
            log::warn!("Could not restore run lock {}: {}", path.display(), e);
        }
        if let Err(e) = fs::remove_file(&aside) {
            log::warn!("Failed to remove {}: {}", aside.display(), e);
        }
        return Ok(false);
    }

    if let Err(e) = fs::remove_file(&aside) {
        log::warn!("Failed to remove stale run lock {}: {}", aside.display(), e);
    }
    Ok(true)
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Failed to release run lock {}: {}", self.path.display(), e);
        }
    }
}

/// Run the engine under the lock.
pub fn run_locked(
    engine: &RuleEngine,
    lock_path: &Path,
    stale_after: Duration,
    rule_ids: Option<&[String]>,
) -> Result<RunSummary, EngineError> {
    let _lock = RunLock::acquire(lock_path, stale_after)?;
    engine.run(rule_ids)
}

/// Keep the database file under `max_storage_mb` (0 = unlimited).
/// Returns the number of rows deleted.
pub fn run_maintenance(db: &Database, max_storage_mb: u32) -> u64 {
    if max_storage_mb == 0 {
        return 0;
    }
    let max_bytes = (max_storage_mb as u64) * 1024 * 1024;
    match db.enforce_size_limit(max_bytes) {
        Ok(pruned) => {
            if pruned > 0 {
                log::info!("Pruned {} rows to keep DB under {} MB", pruned, max_storage_mb);
            }
            pruned
        }
        Err(e) => {
            log::error!("Storage maintenance failed: {}", e);
            0
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleOptions {
    pub interval: Duration,
    /// Granularity of the cancellation check while waiting.
    pub poll_slice: Duration,
    pub stale_lock: Duration,
    /// Stop after this many ticks (None = until cancelled).
    pub max_runs: Option<usize>,
}

/// Sleep for `total`, waking every `slice` to check the cancel flag.
/// Returns false when cancelled.
fn wait(engine: &RuleEngine, total: Duration, slice: Duration) -> bool {
    let cancel = engine.cancel_handle();
    let mut remaining = total;
    while !remaining.is_zero() {
        if cancel.load(Ordering::SeqCst) {
            return false;
        }
        let step = remaining.min(slice.max(Duration::from_millis(1)));
        std::thread::sleep(step);
        remaining -= step;
    }
    !cancel.load(Ordering::SeqCst)
}

/// Run all active rules every `options.interval` until cancelled, calling
/// `after_run` once per tick. A tick whose lock is held elsewhere is skipped.
/// Returns the number of runs completed.
pub fn run_scheduled(
    engine: &RuleEngine,
    lock_path: &Path,
    options: &ScheduleOptions,
    after_run: &dyn Fn(),
) -> usize {
    let cancel = engine.cancel_handle();
    let mut completed = 0usize;
    let mut ticks = 0usize;

    loop {
        if cancel.load(Ordering::SeqCst) {
            log::info!("Scheduler cancelled");
            break;
        }

        // Catch panics per tick so one bad run does not end the loop.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            run_locked(engine, lock_path, options.stale_lock, None)
        }));
        match result {
            Ok(Ok(summary)) => {
                completed += 1;
                log::info!(
                    "Scheduled run {} finished: {} ok, {} failed, {} skipped ({} rows)",
                    summary.session_id,
                    summary.success_count,
                    summary.error_count,
                    summary.skipped_count,
                    summary.total_rows
                );
            }
            Ok(Err(e)) => log::warn!("Scheduled run skipped: {}", e),
            Err(e) => log::error!("Panic during scheduled run: {:?}", e),
        }
        after_run();

        ticks += 1;
        if options.max_runs.is_some_and(|max| ticks >= max) {
            break;
        }
        if !wait(engine, options.interval, options.poll_slice) {
            log::info!("Scheduler cancelled");
            break;
        }
    }

    completed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineSettings;
    use crate::db::MemoryRepository;
    use crate::mail::MemoryMailStore;
    use crate::notify::LogNotifier;
    use crate::sheets::MemorySheetStore;
    use std::cell::Cell;
    use std::sync::Arc;

    fn engine() -> RuleEngine {
        RuleEngine::new(
            Arc::new(MemoryRepository::new()),
            Arc::new(MemorySheetStore::new()),
            Arc::new(MemoryMailStore::new()),
            Arc::new(LogNotifier),
            EngineSettings::default(),
        )
    }

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.lock");
        let hour = Duration::from_secs(3600);

        let lock = RunLock::acquire(&path, hour).unwrap();
        assert!(matches!(
            RunLock::acquire(&path, hour),
            Err(EngineError::Locked(_))
        ));
        drop(lock);
        assert!(!path.exists());
        assert!(RunLock::acquire(&path, hour).is_ok());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.lock");
        fs::write(&path, "4242 crashed").unwrap();
        let lock = RunLock::acquire(&path, Duration::ZERO).unwrap();
        assert_eq!(lock.path(), path.as_path());
        assert!(!fs::read_to_string(&path).unwrap().contains("crashed"));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn replaced_lock_is_not_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.lock");
        fs::write(&path, "4343 fresh owner").unwrap();

        assert!(!reclaim_stale(&path, "4242 crashed").unwrap());
        assert_eq!(fs::read_to_string(&path).unwrap(), "4343 fresh owner");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);

        assert!(reclaim_stale(&path, "4343 fresh owner").unwrap());
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn scheduled_loop_runs_until_limit() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        let ticks = Cell::new(0);
        let options = ScheduleOptions {
            interval: Duration::from_millis(1),
            poll_slice: Duration::from_millis(1),
            stale_lock: Duration::from_secs(3600),
            max_runs: Some(2),
        };
        let done = run_scheduled(&engine, &dir.path().join("run.lock"), &options, &|| {
            ticks.set(ticks.get() + 1)
        });
        assert_eq!(done, 2);
        assert_eq!(ticks.get(), 2);
    }

    #[test]
    fn held_lock_skips_the_tick() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.lock");
        let _held = RunLock::acquire(&path, Duration::from_secs(3600)).unwrap();
        let options = ScheduleOptions {
            interval: Duration::ZERO,
            poll_slice: Duration::from_millis(1),
            stale_lock: Duration::from_secs(3600),
            max_runs: Some(1),
        };
        assert_eq!(run_scheduled(&engine(), &path, &options, &|| {}), 0);
    }

    #[test]
    fn cancelled_scheduler_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine();
        engine.cancel_handle().store(true, Ordering::SeqCst);
        let options = ScheduleOptions {
            interval: Duration::from_secs(60),
            poll_slice: Duration::from_millis(10),
            stale_lock: Duration::from_secs(3600),
            max_runs: None,
        };
        assert_eq!(
            run_scheduled(&engine, &dir.path().join("run.lock"), &options, &|| {}),
            0
        );
    }

    #[test]
    fn maintenance_is_noop_without_limit() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(run_maintenance(&db, 0), 0);
        assert_eq!(run_maintenance(&db, 1), 0);
    }
}
