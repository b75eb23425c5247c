//! Lifecycle supervision for the embedding worker process.
//!
//! ```text
//! Stopped ──start──▶ Starting ──healthy──▶ Healthy ──3 failures / bad probe──▶ Degraded
//!    ▲                  │                                                        │
//!    │              timeout                                         cooldown + backoff
//!    │                  ▼                                                        ▼
//!    └──────────── (failed) ◀──────── restarts exhausted ◀──────────────── Restarting
//! ```
//!
//! Spawning is guarded by a cross-process [`AdvisoryLock`]; the process that
//! wins the lock writes the PID file and releases the lock once the worker
//! answers a health probe (or the attempt fails).

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use super::connection::{ConnectionManager, Route};
use super::error::EmbedError;
use super::launcher::{LaunchSpec, WorkerLauncher, WorkerProcess};
use super::lock::{AdvisoryLock, PidFile, PidRecord};
use super::protocol::WorkerRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Starting,
    Healthy,
    Degraded,
    Restarting,
}

/// Bookkeeping for the worker this supervisor is responsible for.
#[derive(Debug, Clone, Default)]
pub struct WorkerProcessState {
    pub pid: Option<u32>,
    pub started_at: Option<Instant>,
    pub consecutive_failures: u32,
    pub last_restart_at: Option<Instant>,
}

/// Files owned by one project's worker.
#[derive(Debug, Clone)]
pub struct WorkerPaths {
    pub project: PathBuf,
    pub run_dir: PathBuf,
    pub socket: PathBuf,
    pub lock_file: PathBuf,
    pub pid_file: PathBuf,
    pub log_dir: PathBuf,
}

impl WorkerPaths {
    pub fn new(project: PathBuf, run_dir: PathBuf, socket: PathBuf) -> Self {
        Self {
            lock_file: run_dir.join("worker.lock"),
            pid_file: run_dir.join("worker.pid"),
            log_dir: run_dir.join("logs"),
            project,
            run_dir,
            socket,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub startup_timeout: Duration,
    pub health_timeout: Duration,
    pub poll_interval: Duration,
    /// Consecutive request failures that mark the worker degraded.
    pub failure_threshold: u32,
    pub restart_cooldown: Duration,
    pub max_restarts: u32,
    pub max_restarts_per_minute: u32,
    pub restart_backoff_base: Duration,
    pub restart_backoff_max: Duration,
    pub lock_stale_after: Duration,
    pub shutdown_grace: Duration,
    /// How often a `kys` keepalive is sent once a worker is in use. Zero disables it.
    pub keepalive_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(45),
            health_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(250),
            failure_threshold: 3,
            restart_cooldown: Duration::from_secs(60),
            max_restarts: 3,
            max_restarts_per_minute: 3,
            restart_backoff_base: Duration::from_secs(1),
            restart_backoff_max: Duration::from_secs(60),
            lock_stale_after: Duration::from_secs(120),
            shutdown_grace: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(25),
        }
    }
}

impl SupervisorConfig {
    /// Extra delay before the `restarts`-th restart (0 for the first).
    pub fn restart_backoff(&self, restarts: u32) -> Duration {
        if restarts == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (restarts - 1).min(16);
        self.restart_backoff_base
            .saturating_mul(factor)
            .min(self.restart_backoff_max)
    }
}

#[derive(Debug)]
struct Inner {
    state: WorkerState,
    process_state: WorkerProcessState,
    process: Option<Box<dyn WorkerProcess>>,
    launcher: Option<&'static str>,
    fatal: Option<String>,
    restarts: u32,
    restart_times: VecDeque<Instant>,
    /// A spawn by this supervisor failed and no worker has been healthy since.
    spawn_failed: bool,
    shut_down: bool,
}

impl Inner {
    fn transition(&mut self, next: WorkerState) {
        if self.state != next {
            info!(from = ?self.state, to = ?next, "Worker state transition");
            self.state = next;
        }
    }
}

/// Background sender of `kys` keepalives.
///
/// A worker that stops hearing them unloads its model or exits.
#[derive(Debug, Default)]
struct Keepalive {
    thread: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<(Mutex<bool>, Condvar)>,
}

/// Starts, watches, and restarts the embedding worker.
pub struct Supervisor {
    config: SupervisorConfig,
    paths: WorkerPaths,
    launchers: Vec<Box<dyn WorkerLauncher>>,
    connections: Arc<ConnectionManager>,
    pid_file: PidFile,
    inner: Mutex<Inner>,
    /// Serializes start and restart within this process.
    gate: Mutex<()>,
    keepalive: Keepalive,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("paths", &self.paths)
            .field("launchers", &self.launchers)
            .field("state", &self.state())
            .finish()
    }
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        paths: WorkerPaths,
        launchers: Vec<Box<dyn WorkerLauncher>>,
        connections: Arc<ConnectionManager>,
    ) -> Self {
        let pid_file = PidFile::new(paths.pid_file.clone());
        Self {
            config,
            paths,
            launchers,
            connections,
            pid_file,
            inner: Mutex::new(Inner {
                state: WorkerState::Stopped,
                process_state: WorkerProcessState::default(),
                process: None,
                launcher: None,
                fatal: None,
                restarts: 0,
                restart_times: VecDeque::new(),
                spawn_failed: false,
                shut_down: false,
            }),
            gate: Mutex::new(()),
            keepalive: Keepalive::default(),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.inner.lock().state
    }

    pub fn process_state(&self) -> WorkerProcessState {
        self.inner.lock().process_state.clone()
    }

    pub fn paths(&self) -> &WorkerPaths {
        &self.paths
    }

    /// Whether this supervisor spawned the running worker.
    pub fn owns_worker(&self) -> bool {
        self.inner.lock().process.is_some()
    }

    pub fn fatal_error(&self) -> Option<String> {
        self.inner.lock().fatal.clone()
    }

    pub fn restart_count(&self) -> u32 {
        self.inner.lock().restarts
    }

    /// Name of the launcher that started the current worker, if this process started it.
    pub fn launcher_name(&self) -> Option<&'static str> {
        self.inner.lock().launcher
    }

    /// Bring the worker up, adopting one that is already healthy.
    ///
    /// After a failed spawn, the next spawn is a restart: it is subject to
    /// the restart cap, the rate limit, the cooldown, and the backoff.
    pub fn start(&self) -> Result<(), EmbedError> {
        let _gate = self.gate.lock();
        self.start_locked(false)
    }

    fn start_locked(&self, admitted: bool) -> Result<(), EmbedError> {
        {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                return Err(EmbedError::ShutDown);
            }
            if let Some(reason) = &inner.fatal {
                return Err(EmbedError::StartupFatal(reason.clone()));
            }
            inner.transition(WorkerState::Starting);
        }

        if self.probe() {
            info!(socket = %self.paths.socket.display(), "Embedding worker already running");
            self.mark_healthy();
            return Ok(());
        }

        if !admitted {
            let respawn = {
                let mut inner = self.inner.lock();
                if inner.spawn_failed {
                    match self.admit_restart(&mut inner) {
                        Ok(backoff) => Some(backoff),
                        Err(err) => {
                            inner.transition(WorkerState::Stopped);
                            return Err(err);
                        }
                    }
                } else {
                    None
                }
            };
            if let Some(backoff) = respawn {
                info!(
                    restarts = self.restart_count(),
                    backoff_ms = backoff.as_millis() as u64,
                    "Previous spawn failed, respawning worker"
                );
                if !backoff.is_zero() {
                    std::thread::sleep(backoff);
                }
            }
        }

        let lock = AdvisoryLock::try_acquire(&self.paths.lock_file, self.config.lock_stale_after)
            .map_err(|e| self.startup_io_error("spawn lock", e))?;
        let lock = match lock {
            Some(lock) => lock,
            None => {
                info!(
                    lock = %self.paths.lock_file.display(),
                    "Another process is starting the worker, waiting for it"
                );
                if self.wait_healthy(self.config.startup_timeout) {
                    self.mark_healthy();
                    return Ok(());
                }
                // The other spawner gave up or died; its flock is gone with it.
                match AdvisoryLock::acquire_timeout(
                    &self.paths.lock_file,
                    self.config.lock_stale_after,
                    self.config.poll_interval * 4,
                    self.config.poll_interval,
                )
                .map_err(|e| self.startup_io_error("spawn lock", e))?
                {
                    Some(lock) => lock,
                    None => return Err(self.fail_start("spawn lock held by another process")),
                }
            }
        };
        let result = self.spawn_with_lock();
        lock.release();
        result
    }

    fn spawn_with_lock(&self) -> Result<(), EmbedError> {
        // Another spawner may have finished between our probe and the lock.
        if self.probe() {
            self.mark_healthy();
            return Ok(());
        }
        self.kill_recorded_worker();
        self.remove_stale_socket();

        let Some(launcher) = self.launchers.iter().find(|l| l.is_available()) else {
            return Err(self.fatal("no worker script or container runtime available"));
        };
        let spec = LaunchSpec {
            socket: self.paths.socket.clone(),
            project: self.paths.project.clone(),
            log_dir: self.paths.log_dir.clone(),
        };
        let process = match launcher.launch(&spec) {
            Ok(process) => process,
            Err(EmbedError::StartupFatal(reason)) => return Err(self.fatal(&reason)),
            Err(err) => {
                let mut inner = self.inner.lock();
                inner.spawn_failed = true;
                inner.transition(WorkerState::Stopped);
                return Err(err);
            }
        };
        let record = PidRecord::new(
            process.pid(),
            launcher.name(),
            process.container().map(str::to_string),
        );
        if let Err(e) = self.pid_file.write(&record) {
            warn!(path = %self.pid_file.path().display(), error = %e, "Failed to write PID file");
        }
        info!(launcher = launcher.name(), worker = %process.describe(), "Waiting for worker to become healthy");
        {
            let mut inner = self.inner.lock();
            inner.process_state.pid = process.pid();
            inner.process_state.started_at = Some(Instant::now());
            inner.process = Some(process);
            inner.launcher = Some(launcher.name());
        }

        let started = Instant::now();
        if self.wait_healthy(self.config.startup_timeout) {
            info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Embedding worker is healthy"
            );
            self.mark_healthy();
            return Ok(());
        }

        let process = self.inner.lock().process.take();
        if let Some(mut process) = process {
            warn!(worker = %process.describe(), "Worker failed to become healthy, stopping it");
            process.terminate(self.config.shutdown_grace);
        }
        self.pid_file.remove_if_ours();
        self.inner.lock().spawn_failed = true;
        Err(self.fail_start(&format!(
            "worker did not become healthy within {}s",
            self.config.startup_timeout.as_secs()
        )))
    }

    fn kill_recorded_worker(&self) {
        let Some(record) = self.pid_file.read() else {
            return;
        };
        let ours = {
            let inner = self.inner.lock();
            record.spawner_pid == std::process::id() && record.worker_pid == inner.process_state.pid
        };
        if ours {
            return;
        }
        if record.is_orphan() {
            warn!(spawner = record.spawner_pid, worker = ?record.worker_pid, "Found orphaned worker");
        } else {
            warn!(spawner = record.spawner_pid, worker = ?record.worker_pid, "Recorded worker is unresponsive");
        }
        let launcher = self
            .launchers
            .iter()
            .find(|l| l.name() == record.launcher)
            .or_else(|| self.launchers.first());
        if let Some(launcher) = launcher {
            launcher.kill_orphan(&record, self.config.shutdown_grace);
        }
        self.pid_file.remove();
    }

    fn remove_stale_socket(&self) {
        if !self.paths.socket.exists() || self.connections.is_listening() {
            return;
        }
        match fs::remove_file(&self.paths.socket) {
            Ok(()) => debug!(socket = %self.paths.socket.display(), "Removed stale socket file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(socket = %self.paths.socket.display(), error = %e, "Failed to remove stale socket"),
        }
    }

    fn probe(&self) -> bool {
        match self.connections.probe_health(self.config.health_timeout) {
            Ok(_) => true,
            Err(err) => {
                debug!(error = %err, "Health probe failed");
                false
            }
        }
    }

    fn wait_healthy(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.probe() {
                return true;
            }
            let exited = {
                let mut inner = self.inner.lock();
                match inner.process.as_mut() {
                    Some(process) => !process.is_running(),
                    None => false,
                }
            };
            if exited {
                warn!("Worker process exited during startup");
                return false;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }

    fn mark_healthy(&self) {
        {
            let mut inner = self.inner.lock();
            inner.spawn_failed = false;
            inner.process_state.consecutive_failures = 0;
            inner.transition(WorkerState::Healthy);
        }
        self.ensure_keepalive();
    }

    /// Start the keepalive thread if it is enabled and not yet running.
    fn ensure_keepalive(&self) {
        let interval = self.config.keepalive_interval;
        if interval.is_zero() {
            return;
        }
        let mut slot = self.keepalive.thread.lock();
        if slot.is_some() || self.inner.lock().shut_down {
            return;
        }
        *self.keepalive.stop.0.lock() = false;
        let stop = Arc::clone(&self.keepalive.stop);
        let connections = Arc::clone(&self.connections);
        let timeout = self.config.health_timeout;
        let spawned = std::thread::Builder::new()
            .name("embed-worker-keepalive".into())
            .spawn(move || {
                loop {
                    {
                        let (flag, cvar) = &*stop;
                        let mut stopped = flag.lock();
                        if !*stopped {
                            cvar.wait_for(&mut stopped, interval);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    if connections.is_closed() {
                        break;
                    }
                    match connections.send(&WorkerRequest::Keepalive, timeout, Route::DirectOnly) {
                        Ok(_) => debug!("Worker acknowledged keepalive"),
                        Err(err) => debug!(error = %err, "Keepalive not delivered"),
                    }
                }
            });
        match spawned {
            Ok(handle) => {
                debug!(interval_ms = interval.as_millis() as u64, "Started worker keepalive");
                *slot = Some(handle);
            }
            Err(e) => warn!(error = %e, "Failed to start worker keepalive"),
        }
    }

    fn stop_keepalive(&self) {
        let handle = self.keepalive.thread.lock().take();
        if let Some(handle) = handle {
            let (flag, cvar) = &*self.keepalive.stop;
            *flag.lock() = true;
            cvar.notify_all();
            let _ = handle.join();
        }
    }

    pub fn keepalive_running(&self) -> bool {
        self.keepalive.thread.lock().is_some()
    }

    fn fail_start(&self, reason: &str) -> EmbedError {
        let mut inner = self.inner.lock();
        inner.transition(WorkerState::Stopped);
        EmbedError::WorkerUnavailable {
            socket: self.paths.socket.clone(),
            reason: reason.to_string(),
        }
    }

    fn startup_io_error(&self, what: &str, err: io::Error) -> EmbedError {
        self.fail_start(&format!("{what}: {err}"))
    }

    fn fatal(&self, reason: &str) -> EmbedError {
        error!(reason = %reason, "Embedding worker cannot be started");
        let mut inner = self.inner.lock();
        inner.fatal = Some(reason.to_string());
        inner.transition(WorkerState::Stopped);
        EmbedError::StartupFatal(reason.to_string())
    }

    /// Probe the worker and update state from the result.
    pub fn check_health(&self) -> bool {
        let healthy = self.probe();
        let mut inner = self.inner.lock();
        match (healthy, inner.state) {
            (true, WorkerState::Degraded | WorkerState::Stopped) => {
                inner.process_state.consecutive_failures = 0;
                inner.transition(WorkerState::Healthy);
            }
            (false, WorkerState::Healthy) => {
                warn!(socket = %self.paths.socket.display(), "Health probe failed, worker degraded");
                inner.transition(WorkerState::Degraded);
            }
            _ => {}
        }
        healthy
    }

    /// Count a failed request against the worker.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.process_state.consecutive_failures += 1;
        let failures = inner.process_state.consecutive_failures;
        if failures >= self.config.failure_threshold && inner.state == WorkerState::Healthy {
            warn!(failures, "Consecutive worker failures, marking degraded");
            inner.transition(WorkerState::Degraded);
        }
    }

    pub fn record_success(&self) {
        self.ensure_keepalive();
        let mut inner = self.inner.lock();
        inner.spawn_failed = false;
        inner.process_state.consecutive_failures = 0;
        if matches!(inner.state, WorkerState::Degraded | WorkerState::Stopped) {
            inner.transition(WorkerState::Healthy);
        }
        // A worker that has stayed up past the cooldown earns back its restart budget.
        if inner.restarts > 0
            && inner
                .process_state
                .last_restart_at
                .is_some_and(|at| at.elapsed() > self.config.restart_cooldown)
        {
            debug!(restarts = inner.restarts, "Worker stable again, clearing restart count");
            inner.restarts = 0;
        }
    }

    /// Restart the worker, honoring cooldown, caps, and escalating backoff.
    pub fn restart(&self) -> Result<(), EmbedError> {
        let _gate = self.gate.lock();
        let backoff = {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                return Err(EmbedError::ShutDown);
            }
            if let Some(reason) = &inner.fatal {
                return Err(EmbedError::StartupFatal(reason.clone()));
            }
            let backoff = self.admit_restart(&mut inner)?;
            inner.transition(WorkerState::Restarting);
            backoff
        };
        if !backoff.is_zero() {
            info!(backoff_ms = backoff.as_millis() as u64, "Backing off before worker restart");
            std::thread::sleep(backoff);
        }

        let process = self.inner.lock().process.take();
        if let Some(mut process) = process {
            info!(worker = %process.describe(), "Stopping worker for restart");
            process.terminate(self.config.shutdown_grace);
            self.pid_file.remove_if_ours();
        }
        self.connections.disconnect();

        let result = self.start_locked(true);
        match &result {
            Ok(()) => info!(restarts = self.restart_count(), "Worker restarted"),
            Err(err) => {
                let mut inner = self.inner.lock();
                if inner.restarts >= self.config.max_restarts {
                    inner.transition(WorkerState::Stopped);
                }
                warn!(error = %err, restarts = inner.restarts, "Worker restart failed");
            }
        }
        result
    }

    /// Charge one restart against the budget, or refuse it.
    ///
    /// Returns the backoff to sleep before spawning.
    fn admit_restart(&self, inner: &mut Inner) -> Result<Duration, EmbedError> {
        if inner.restarts >= self.config.max_restarts {
            inner.transition(WorkerState::Stopped);
            return Err(EmbedError::RestartsExhausted {
                restarts: inner.restarts,
            });
        }
        let now = Instant::now();
        while inner
            .restart_times
            .front()
            .is_some_and(|t| now.duration_since(*t) > Duration::from_secs(60))
        {
            inner.restart_times.pop_front();
        }
        if inner.restart_times.len() as u32 >= self.config.max_restarts_per_minute {
            return Err(EmbedError::WorkerUnavailable {
                socket: self.paths.socket.clone(),
                reason: "restart rate limit reached".into(),
            });
        }
        if let Some(last) = inner.process_state.last_restart_at {
            let since = now.duration_since(last);
            if since < self.config.restart_cooldown {
                let remaining = self.config.restart_cooldown - since;
                return Err(EmbedError::WorkerUnavailable {
                    socket: self.paths.socket.clone(),
                    reason: format!("restart cooldown active ({}s remaining)", remaining.as_secs()),
                });
            }
        }
        let backoff = self.config.restart_backoff(inner.restarts);
        inner.restarts += 1;
        inner.process_state.last_restart_at = Some(now);
        inner.restart_times.push_back(now);
        Ok(backoff)
    }

    /// Clear a fatal startup condition and the restart budget.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if let Some(reason) = inner.fatal.take() {
            info!(reason = %reason, "Clearing fatal startup condition");
        }
        inner.restarts = 0;
        inner.spawn_failed = false;
        inner.restart_times.clear();
        inner.process_state.consecutive_failures = 0;
        inner.process_state.last_restart_at = None;
    }

    /// Stop the worker this supervisor spawned. Idempotent.
    pub fn shutdown(&self) {
        let _gate = self.gate.lock();
        let process = {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            inner.process.take()
        };
        self.stop_keepalive();
        if let Some(mut process) = process {
            info!(worker = %process.describe(), "Shutting down embedding worker");
            if !self.connections.is_closed() {
                let ack = self.connections.send(
                    &WorkerRequest::Shutdown,
                    self.config.health_timeout,
                    Route::DirectOnly,
                );
                if let Err(err) = ack {
                    debug!(error = %err, "Worker did not acknowledge shutdown request");
                }
            }
            process.terminate(self.config.shutdown_grace);
            self.pid_file.remove_if_ours();
        }
        let mut inner = self.inner.lock();
        inner.process_state = WorkerProcessState::default();
        inner.launcher = None;
        inner.transition(WorkerState::Stopped);
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
