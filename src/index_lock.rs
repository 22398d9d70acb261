//! Cross-process reader/writer lock for the search index
//!
//! Every index access runs under one of these guards so that two `cmdnote`
//! processes (or two engines in one process) never interleave a writer with
//! anything else.
//!
//! Protocol:
//! - A writer creates `writer.lock` with create-new semantics, then waits for
//!   reader markers to drain.
//! - A reader waits until `writer.lock` is gone, creates its own
//!   `read-<pid>-<seq>.lock` marker, then re-checks `writer.lock` and backs off
//!   if a writer slipped in between.
//! - While a guard is held a heartbeat thread keeps its file's mtime fresh.
//!   Lock files not touched within the stale threshold belong to a crashed
//!   process and are removed.
//! - A guard only removes its file if the file still names it as the holder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use crate::error::{Error, Result};

/// Lock files untouched for this long are considered abandoned
const STALE_THRESHOLD_SECS: u64 = 120;

/// Back-off between acquisition attempts
const RETRY_INTERVAL_MS: u64 = 20;

/// Held locks are refreshed this many times per stale threshold
const HEARTBEATS_PER_THRESHOLD: u32 = 4;

const WRITER_LOCK_FILE: &str = "writer.lock";
const READER_PREFIX: &str = "read-";
const LOCK_EXTENSION: &str = ".lock";

/// Distinguishes reader markers taken by the same process
static READER_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Contents of a lock file, for diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub hostname: String,
    pub pid: u32,
    pub mode: LockMode,
    pub app_version: String,
    pub locked_at: DateTime<Utc>,
}

impl LockHolder {
    fn current(mode: LockMode) -> Self {
        Self {
            hostname: get_hostname(),
            pid: std::process::id(),
            mode,
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            locked_at: Utc::now(),
        }
    }

    fn describe(&self) -> String {
        format!("pid {} on {} since {}", self.pid, self.hostname, self.locked_at.to_rfc3339())
    }
}

pub struct IndexLock {
    dir: PathBuf,
    timeout: Duration,
    stale_after: Duration,
}

/// Held lock; the lock file is kept fresh while held and removed when the guard is dropped
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    holder: LockHolder,
    heartbeat: Option<(mpsc::Sender<()>, JoinHandle<()>)>,
}

impl LockGuard {
    fn hold(path: PathBuf, holder: LockHolder, interval: Duration) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        let heartbeat_path = path.clone();
        let spawned = thread::Builder::new()
            .name("index-lock-heartbeat".into())
            .spawn(move || {
                // Dropping the sender ends the loop with `Disconnected`
                while let Err(RecvTimeoutError::Timeout) = stopped.recv_timeout(interval) {
                    match touch(&heartbeat_path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {
                            log::warn!("[index_lock] Lock file {:?} disappeared while held", heartbeat_path);
                            break;
                        }
                        Err(e) => log::error!("[index_lock] Failed to update heartbeat: {}", e),
                    }
                }
            });

        let heartbeat = match spawned {
            Ok(handle) => Some((stop, handle)),
            Err(e) => {
                log::error!("[index_lock] Failed to start heartbeat for {:?}: {}", path, e);
                None
            }
        };
        Self { path, holder, heartbeat }
    }

    pub fn mode(&self) -> LockMode {
        self.holder.mode
    }

    fn stop_heartbeat(&mut self) {
        if let Some((stop, handle)) = self.heartbeat.take() {
            drop(stop);
            if handle.join().is_err() {
                log::error!("[index_lock] Heartbeat thread for {:?} panicked", self.path);
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.stop_heartbeat();

        match read_lock_file(&self.path) {
            Ok(current) if current == self.holder => {}
            Ok(current) => {
                log::warn!(
                    "[index_lock] Lock {:?} now belongs to {}, leaving it in place",
                    self.path,
                    current.describe()
                );
                return;
            }
            Err(_) if !self.path.exists() => {
                log::warn!("[index_lock] Lock file {:?} vanished before release", self.path);
                return;
            }
            Err(e) => {
                log::error!("[index_lock] Leaving unreadable lock {:?}: {}", self.path, e);
                return;
            }
        }

        match fs::remove_file(&self.path) {
            Ok(()) => log::debug!("[index_lock] Released {:?} lock {:?}", self.holder.mode, self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!("[index_lock] Lock file {:?} vanished before release", self.path)
            }
            Err(e) => log::error!("[index_lock] Failed to release lock {:?}: {}", self.path, e),
        }
    }
}

impl IndexLock {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
            stale_after: Duration::from_secs(STALE_THRESHOLD_SECS),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    fn heartbeat_interval(&self) -> Duration {
        (self.stale_after / HEARTBEATS_PER_THRESHOLD).max(Duration::from_millis(5))
    }

    fn writer_path(&self) -> PathBuf {
        self.dir.join(WRITER_LOCK_FILE)
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| Error::io(&self.dir, e))
    }

    /// Take the writer lock, excluding readers and other writers
    pub fn acquire_exclusive(&self) -> Result<LockGuard> {
        self.ensure_dir()?;
        let started = Instant::now();
        let writer_path = self.writer_path();

        let holder = loop {
            let holder = LockHolder::current(LockMode::Exclusive);
            match create_lock_file(&writer_path, &holder) {
                Ok(()) => break holder,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if self.remove_if_stale(&writer_path) {
                        continue;
                    }
                    self.wait_or_give_up(started, &writer_path)?;
                }
                Err(e) => return Err(Error::io(&writer_path, e)),
            }
        };

        // From here on no new reader gets in; the guard releases us on every early return
        let guard = LockGuard::hold(writer_path, holder, self.heartbeat_interval());

        loop {
            let readers = self.live_readers()?;
            match readers.first() {
                None => break,
                Some(reader) => self.wait_or_give_up(started, reader)?,
            }
        }

        log::debug!("[index_lock] Acquired exclusive lock in {:?}", started.elapsed());
        Ok(guard)
    }

    /// Take a reader lock; any number of readers may hold one at once
    pub fn acquire_shared(&self) -> Result<LockGuard> {
        self.ensure_dir()?;
        let started = Instant::now();
        let writer_path = self.writer_path();

        loop {
            if writer_path.exists() {
                if !self.remove_if_stale(&writer_path) {
                    self.wait_or_give_up(started, &writer_path)?;
                }
                continue;
            }

            let seq = READER_SEQ.fetch_add(1, Ordering::Relaxed);
            let marker = self.dir.join(format!(
                "{}{}-{}{}",
                READER_PREFIX,
                std::process::id(),
                seq,
                LOCK_EXTENSION
            ));
            let holder = LockHolder::current(LockMode::Shared);
            create_lock_file(&marker, &holder).map_err(|e| Error::io(&marker, e))?;
            let guard = LockGuard::hold(marker, holder, self.heartbeat_interval());

            if writer_path.exists() {
                // A writer won the race; step aside so it can see the readers drain
                drop(guard);
                self.wait_or_give_up(started, &writer_path)?;
                continue;
            }

            log::debug!("[index_lock] Acquired shared lock in {:?}", started.elapsed());
            return Ok(guard);
        }
    }

    /// Describe who currently holds the writer lock, if anyone
    pub fn writer_holder(&self) -> Option<LockHolder> {
        read_lock_file(&self.writer_path()).ok()
    }

    fn live_readers(&self) -> Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&self.dir, e)),
        };

        let mut readers = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !(name.starts_with(READER_PREFIX) && name.ends_with(LOCK_EXTENSION)) {
                continue;
            }
            let path = entry.path();
            if !self.remove_if_stale(&path) {
                readers.push(path);
            }
        }
        Ok(readers)
    }

    fn wait_or_give_up(&self, started: Instant, blocker: &Path) -> Result<()> {
        if started.elapsed() >= self.timeout {
            let holder = read_lock_file(blocker)
                .map(|h| h.describe())
                .unwrap_or_else(|_| blocker.display().to_string());
            log::warn!("[index_lock] Timed out waiting for {}", holder);
            return Err(Error::LockTimeout {
                holder,
                waited_ms: started.elapsed().as_millis(),
            });
        }
        std::thread::sleep(Duration::from_millis(RETRY_INTERVAL_MS));
        Ok(())
    }

    /// Remove a lock file whose heartbeat stopped. Returns true if it is gone.
    fn remove_if_stale(&self, path: &Path) -> bool {
        let modified = match fs::metadata(path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return true,
            Err(_) => return false,
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        if age <= self.stale_after {
            return false;
        }

        let holder = read_lock_file(path)
            .map(|h| h.describe())
            .unwrap_or_else(|_| "unknown holder".to_string());
        log::warn!(
            "[index_lock] Removing stale lock {:?} ({}), age {}s",
            path,
            holder,
            age.as_secs()
        );
        match fs::remove_file(path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => {
                log::error!("[index_lock] Failed to remove stale lock {:?}: {}", path, e);
                false
            }
        }
    }
}

/// Create a lock file that must not already exist and record the holder in it
fn create_lock_file(path: &Path, holder: &LockHolder) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    let content = serde_json::to_string_pretty(holder).map_err(io::Error::other)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

/// Refresh the mtime that staleness is judged by
fn touch(path: &Path) -> io::Result<()> {
    fs::OpenOptions::new()
        .write(true)
        .open(path)?
        .set_modified(SystemTime::now())
}

fn read_lock_file(path: &Path) -> std::result::Result<LockHolder, String> {
    let content =
        fs::read_to_string(path).map_err(|e| format!("Failed to read lock file: {}", e))?;
    serde_json::from_str(&content).map_err(|e| format!("Failed to parse lock file: {}", e))
}

pub fn get_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
