//! Cross-process spawn lock and PID file for the embedding worker.
//!
//! The lock prefers `flock(2)`: the kernel drops it when the owner dies, so
//! a crashed spawner can never wedge the lock. Filesystems that refuse
//! `flock` fall back to an `O_EXCL` sentinel file whose staleness is judged
//! by both its age and a liveness probe of the recorded owner PID.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub owner_pid: u32,
    pub acquired_at_ms: u64,
}

impl LockRecord {
    fn current() -> Self {
        Self {
            owner_pid: std::process::id(),
            acquired_at_ms: now_ms(),
        }
    }

    pub fn age(&self) -> Duration {
        Duration::from_millis(now_ms().saturating_sub(self.acquired_at_ms))
    }

    /// Stale when older than `threshold` or its owner is gone.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.age() > threshold || !is_pid_alive(self.owner_pid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Kernel advisory lock held on an open descriptor.
    Flock,
    /// Exclusive-create sentinel file.
    Sentinel,
}

/// A held spawn lock. Released on drop.
#[derive(Debug)]
pub struct AdvisoryLock {
    path: PathBuf,
    mode: LockMode,
    file: Option<File>,
    record: LockRecord,
}

impl AdvisoryLock {
    /// Try once to take the lock. `Ok(None)` means a live owner holds it.
    pub fn try_acquire(path: &Path, stale_after: Duration) -> io::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match Self::try_flock(path)? {
            FlockOutcome::Acquired(lock) => Ok(Some(lock)),
            FlockOutcome::Held => Ok(None),
            FlockOutcome::Unsupported => Self::try_sentinel(path, stale_after),
        }
    }

    /// Poll for the lock until `wait` elapses.
    pub fn acquire_timeout(
        path: &Path,
        stale_after: Duration,
        wait: Duration,
        poll: Duration,
    ) -> io::Result<Option<Self>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(lock) = Self::try_acquire(path, stale_after)? {
                return Ok(Some(lock));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(poll);
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn record(&self) -> &LockRecord {
        &self.record
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock explicitly.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        match self.mode {
            LockMode::Flock => {
                if let Some(file) = self.file.take() {
                    // The file stays on disk: unlinking it would let a second
                    // process lock a fresh inode while a third still holds the old one.
                    let _ = file.set_len(0);
                    // SAFETY: fd is valid until `file` drops at the end of this block.
                    unsafe {
                        libc::flock(file.as_raw_fd(), libc::LOCK_UN);
                    }
                    debug!(path = %self.path.display(), "Released spawn lock");
                }
            }
            LockMode::Sentinel => {
                if self.file.take().is_some() {
                    if read_record(&self.path).is_some_and(|r| r == self.record) {
                        let _ = fs::remove_file(&self.path);
                    }
                    debug!(path = %self.path.display(), "Removed spawn lock sentinel");
                }
            }
        }
    }

    fn try_flock(path: &Path) -> io::Result<FlockOutcome> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        // SAFETY: flock on a descriptor we own.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            return match err.raw_os_error() {
                Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN => {
                    Ok(FlockOutcome::Held)
                }
                Some(code)
                    if code == libc::ENOLCK || code == libc::EOPNOTSUPP || code == libc::ENOSYS =>
                {
                    warn!(path = %path.display(), error = %err, "flock unsupported, using sentinel lock");
                    Ok(FlockOutcome::Unsupported)
                }
                _ => Err(err),
            };
        }
        let record = LockRecord::current();
        let json = serde_json::to_vec(&record).map_err(io::Error::other)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&json)?;
        file.flush()?;
        debug!(path = %path.display(), pid = record.owner_pid, "Acquired spawn lock (flock)");
        Ok(FlockOutcome::Acquired(AdvisoryLock {
            path: path.to_path_buf(),
            mode: LockMode::Flock,
            file: Some(file),
            record,
        }))
    }

    fn try_sentinel(path: &Path, stale_after: Duration) -> io::Result<Option<Self>> {
        let sentinel = sentinel_path(path);
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&sentinel) {
                Ok(mut file) => {
                    let record = LockRecord::current();
                    let json = serde_json::to_vec(&record).map_err(io::Error::other)?;
                    file.write_all(&json)?;
                    file.sync_all()?;
                    debug!(path = %sentinel.display(), pid = record.owner_pid, "Acquired spawn lock (sentinel)");
                    return Ok(Some(AdvisoryLock {
                        path: sentinel,
                        mode: LockMode::Sentinel,
                        file: Some(file),
                        record,
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match read_record(&sentinel) {
                        Some(existing) if !existing.is_stale(stale_after) => return Ok(None),
                        Some(existing) => {
                            warn!(
                                pid = existing.owner_pid,
                                age_ms = existing.age().as_millis() as u64,
                                "Reclaiming stale spawn lock"
                            );
                        }
                        None => {
                            // Half-written or corrupt sentinel: only reclaim once it is old.
                            let old = fs::metadata(&sentinel)
                                .and_then(|m| m.modified())
                                .ok()
                                .and_then(|t| t.elapsed().ok())
                                .is_none_or(|age| age > stale_after);
                            if !old {
                                return Ok(None);
                            }
                            warn!(path = %sentinel.display(), "Reclaiming unreadable spawn lock");
                        }
                    }
                    match fs::remove_file(&sentinel) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}

impl Drop for AdvisoryLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

enum FlockOutcome {
    Acquired(AdvisoryLock),
    Held,
    Unsupported,
}

fn sentinel_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".owner");
    path.with_file_name(name)
}

/// Read the owner record from a lock file (flock or sentinel form).
pub fn read_record(path: &Path) -> Option<LockRecord> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    serde_json::from_str(contents.trim()).ok()
}

/// Current holder of the lock at `path`, if any is recorded.
pub fn current_owner(path: &Path) -> Option<LockRecord> {
    read_record(path).or_else(|| read_record(&sentinel_path(path)))
}

/// Contents of the worker PID file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PidRecord {
    /// Process that spawned the worker.
    pub spawner_pid: u32,
    /// The worker process itself, when it is a direct child.
    pub worker_pid: Option<u32>,
    /// Launch mechanism name ("native", "container", ...).
    pub launcher: String,
    /// Container name for containerized workers.
    #[serde(default)]
    pub container: Option<String>,
    pub started_at_ms: u64,
}

impl PidRecord {
    pub fn new(worker_pid: Option<u32>, launcher: &str, container: Option<String>) -> Self {
        Self {
            spawner_pid: std::process::id(),
            worker_pid,
            launcher: launcher.to_string(),
            container,
            started_at_ms: now_ms(),
        }
    }

    /// A worker whose spawner is another process that no longer exists.
    pub fn is_orphan(&self) -> bool {
        self.spawner_pid != std::process::id() && !is_pid_alive(self.spawner_pid)
    }
}

/// PID file written by whichever process spawned the worker.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Option<PidRecord> {
        let contents = fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str(contents.trim()) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring unreadable PID file");
                None
            }
        }
    }

    /// Replace the PID file atomically: exclusive-create a temp file, then rename.
    pub fn write(&self, record: &PidRecord) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self
            .path
            .with_extension(format!("pid.{}.tmp", std::process::id()));
        let _ = fs::remove_file(&tmp);
        let mut file = OpenOptions::new().write(true).create_new(true).open(&tmp)?;
        let json = serde_json::to_vec(record).map_err(io::Error::other)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)
    }

    /// Remove the PID file if it still names this process as spawner.
    pub fn remove_if_ours(&self) -> bool {
        match self.read() {
            Some(record) if record.spawner_pid == std::process::id() => {
                let _ = fs::remove_file(&self.path);
                true
            }
            _ => false,
        }
    }

    pub fn remove(&self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Signal-0 liveness probe. EPERM still means the process exists.
pub fn is_pid_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: kill with signal 0 performs only the existence/permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    if rc == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Returns true once the process is gone.
pub fn terminate_pid(pid: u32, grace: Duration) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 || pid == std::process::id() {
        return false;
    }
    if !is_pid_alive(pid) {
        return true;
    }
    // SAFETY: sending a signal to a pid we validated above.
    unsafe {
        libc::kill(raw, libc::SIGTERM);
    }
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_pid_alive(pid) {
            info!(pid, "Worker process exited after SIGTERM");
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    warn!(pid, "Worker ignored SIGTERM, sending SIGKILL");
    // SAFETY: as above.
    unsafe {
        libc::kill(raw, libc::SIGKILL);
    }
    std::thread::sleep(Duration::from_millis(50));
    !is_pid_alive(pid)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
