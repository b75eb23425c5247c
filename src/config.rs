//! Client configuration and its environment overrides.
//!
//! Every variable is prefixed `SEMANTIC_EMBED_` and read through
//! `dotenvy`, so a project `.env` file is honored.

use std::path::{Path, PathBuf};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::warn;

use crate::embedding::batch::BatchPolicy;
use crate::embedding::queue::DEFAULT_MAX_ATTEMPTS;
use crate::worker::connection::ConnectionOptions;
use crate::worker::retry::RetryPolicy;
use crate::worker::supervisor::{SupervisorConfig, WorkerPaths};
use crate::worker::timeout::TimeoutBounds;

pub const ENV_PREFIX: &str = "SEMANTIC_EMBED_";

/// Request timeout the master override is measured against.
const BASE_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// First 12 hex chars of the SHA-256 of the project path.
pub fn project_hash(project: &Path) -> String {
    let digest = Sha256::digest(project.to_string_lossy().as_bytes());
    hex::encode(digest)[..12].to_string()
}

#[derive(Debug, Clone)]
pub struct EmbeddingClientConfig {
    pub project: PathBuf,
    pub project_hash: String,
    pub run_dir: PathBuf,
    pub socket_path: PathBuf,
    /// `None` disables the overflow queue: unreachable workers fail loudly.
    pub queue_db: Option<PathBuf>,
    pub queue_max_attempts: u32,
    pub request_timeout: Duration,
    pub search_timeout: Duration,
    pub timeouts: TimeoutBounds,
    pub retry: RetryPolicy,
    pub supervisor: SupervisorConfig,
    pub connection: ConnectionOptions,
    pub batch: BatchPolicy,
    /// Start the worker while building the client.
    pub autostart: bool,
    pub worker_script: Option<PathBuf>,
    pub worker_search_paths: Vec<PathBuf>,
    pub worker_image: Option<String>,
    pub container_runtime: Option<String>,
    pub socket_max_age: Duration,
    pub socket_sweep_interval: Duration,
}

impl EmbeddingClientConfig {
    /// Defaults for `project`, with per-project state under `data_dir`.
    pub fn for_project(project: impl Into<PathBuf>, data_dir: &Path) -> Self {
        let project = project.into();
        let hash = project_hash(&project);
        let run_dir = data_dir.join("instances").join(&hash);
        Self {
            socket_path: run_dir.join("sockets").join("embeddings.sock"),
            queue_db: Some(run_dir.join("overflow").join("queue.db")),
            queue_max_attempts: DEFAULT_MAX_ATTEMPTS,
            request_timeout: BASE_REQUEST_TIMEOUT,
            search_timeout: Duration::from_secs(30),
            timeouts: TimeoutBounds::default(),
            retry: RetryPolicy::default(),
            supervisor: SupervisorConfig::default(),
            connection: ConnectionOptions::default(),
            batch: BatchPolicy::default(),
            autostart: false,
            worker_script: None,
            worker_search_paths: vec![project.join("embedding-sandbox"), data_dir.join("worker")],
            worker_image: None,
            container_runtime: None,
            socket_max_age: Duration::from_secs(60),
            socket_sweep_interval: Duration::from_secs(300),
            project_hash: hash,
            run_dir,
            project,
        }
    }

    /// Defaults under the platform data dir, then environment overrides.
    pub fn from_env(project: impl Into<PathBuf>) -> Self {
        let mut cfg = Self::for_project(project, &crate::default_data_dir());
        cfg.apply_overrides(|key| dotenvy::var(key).ok());
        cfg
    }

    /// Apply overrides from `lookup`, which receives full variable names.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let millis = |name: &str| get(name).and_then(|v| v.trim().parse::<u64>().ok()).map(Duration::from_millis);
        let secs = |name: &str| get(name).and_then(|v| v.trim().parse::<u64>().ok()).map(Duration::from_secs);
        let count = |name: &str| get(name).and_then(|v| v.trim().parse::<u32>().ok());
        let flag = |name: &str| get(name).and_then(|v| parse_bool(&v));

        if let Some(dir) = get("RUN_DIR") {
            self.run_dir = PathBuf::from(dir);
            self.socket_path = self.run_dir.join("sockets").join("embeddings.sock");
            self.queue_db = Some(self.run_dir.join("overflow").join("queue.db"));
        }
        if let Some(path) = get("SOCKET") {
            self.socket_path = PathBuf::from(path);
        }
        if let Some(path) = get("QUEUE_DB") {
            self.queue_db = match path.trim() {
                "" | "off" | "none" => None,
                other => Some(PathBuf::from(other)),
            };
        }

        if let Some(master) = secs("TIMEOUT_SECS")
            && !master.is_zero()
        {
            self.scale_timeouts(master.as_secs_f64() / BASE_REQUEST_TIMEOUT.as_secs_f64());
        }
        if let Some(d) = millis("REQUEST_TIMEOUT_MS") {
            self.set_request_timeout(d);
        }
        if let Some(d) = millis("SEARCH_TIMEOUT_MS") {
            self.search_timeout = d;
        }
        if let Some(d) = millis("HEALTH_TIMEOUT_MS") {
            self.supervisor.health_timeout = d;
        }
        if let Some(d) = millis("INITIAL_TIMEOUT_MS") {
            self.timeouts.initial = d;
        }
        if let Some(d) = millis("MIN_TIMEOUT_MS") {
            self.timeouts.min = d;
        }
        if let Some(d) = millis("MAX_TIMEOUT_MS") {
            self.timeouts.max = d;
        }
        if let Some(d) = millis("STARTUP_TIMEOUT_MS") {
            self.supervisor.startup_timeout = d;
        }

        if let Some(n) = count("MAX_RETRIES") {
            self.retry.max_attempts = n.max(1);
        }
        if let Some(d) = secs("RESTART_COOLDOWN_SECS") {
            self.supervisor.restart_cooldown = d;
        }
        if let Some(n) = count("MAX_RESTARTS") {
            self.supervisor.max_restarts = n;
        }
        if let Some(n) = count("MAX_RESTARTS_PER_MINUTE") {
            self.supervisor.max_restarts_per_minute = n;
        }
        if let Some(d) = secs("KEEPALIVE_SECS") {
            self.supervisor.keepalive_interval = d;
        }

        if let Some(on) = flag("WARM") {
            self.connection.warm = on;
        }
        if let Some(on) = flag("PERSISTENT") {
            self.connection.persistent = on;
        }
        if let Some(on) = flag("AUTOSTART") {
            self.autostart = on;
        }

        if let Some(path) = get("WORKER_SCRIPT") {
            self.worker_script = Some(PathBuf::from(path));
        }
        if let Some(image) = get("WORKER_IMAGE") {
            self.worker_image = Some(image);
        }
        if let Some(runtime) = get("CONTAINER_RUNTIME") {
            self.container_runtime = Some(runtime);
        }

        self.sanitize();
    }

    /// Multiply every derived timeout by `ratio`.
    fn scale_timeouts(&mut self, ratio: f64) {
        let scale = |d: Duration| d.mul_f64(ratio);
        self.set_request_timeout(scale(self.request_timeout));
        self.search_timeout = scale(self.search_timeout);
        self.supervisor.health_timeout = scale(self.supervisor.health_timeout);
        self.supervisor.startup_timeout = scale(self.supervisor.startup_timeout);
        self.timeouts = TimeoutBounds {
            initial: scale(self.timeouts.initial),
            min: scale(self.timeouts.min),
            max: scale(self.timeouts.max),
        };
    }

    fn set_request_timeout(&mut self, timeout: Duration) {
        self.request_timeout = timeout;
        self.batch.per_item_timeout = timeout;
        self.batch.max_timeout = self.batch.max_timeout.max(timeout);
        self.connection.write_timeout = timeout;
    }

    fn sanitize(&mut self) {
        if self.timeouts.min > self.timeouts.max {
            warn!(
                min_ms = self.timeouts.min.as_millis() as u64,
                max_ms = self.timeouts.max.as_millis() as u64,
                "Minimum timeout exceeds maximum, using minimum for both"
            );
            self.timeouts.max = self.timeouts.min;
        }
    }

    pub fn worker_paths(&self) -> WorkerPaths {
        WorkerPaths::new(
            self.project.clone(),
            self.run_dir.clone(),
            self.socket_path.clone(),
        )
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn with(vars: &[(&str, &str)]) -> EmbeddingClientConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
            .collect();
        let mut cfg = EmbeddingClientConfig::for_project("/work/proj", Path::new("/data"));
        cfg.apply_overrides(|key| vars.get(key).cloned());
        cfg
    }

    #[test]
    fn defaults_are_project_scoped() {
        let cfg = with(&[]);
        let hash = project_hash(Path::new("/work/proj"));
        assert_eq!(hash.len(), 12);
        assert_eq!(cfg.run_dir, Path::new("/data/instances").join(&hash));
        assert_eq!(cfg.socket_path, cfg.run_dir.join("sockets/embeddings.sock"));
        assert_eq!(cfg.queue_db, Some(cfg.run_dir.join("overflow/queue.db")));
        assert_eq!(cfg.request_timeout, Duration::from_secs(60));
        assert_eq!(cfg.timeouts, TimeoutBounds::default());
        assert!(cfg.connection.warm);
        assert!(!cfg.connection.persistent);
        assert!(!cfg.autostart);
    }

    #[test]
    fn different_projects_get_different_run_dirs() {
        let a = EmbeddingClientConfig::for_project("/a", Path::new("/data"));
        let b = EmbeddingClientConfig::for_project("/b", Path::new("/data"));
        assert_ne!(a.run_dir, b.run_dir);
    }

    #[test]
    fn master_timeout_scales_proportionally() {
        let cfg = with(&[("TIMEOUT_SECS", "120")]);
        assert_eq!(cfg.request_timeout, Duration::from_secs(120));
        assert_eq!(cfg.search_timeout, Duration::from_secs(60));
        assert_eq!(cfg.supervisor.health_timeout, Duration::from_secs(10));
        assert_eq!(cfg.timeouts.initial, Duration::from_secs(240));
        assert_eq!(cfg.timeouts.min, Duration::from_secs(60));
        assert_eq!(cfg.timeouts.max, Duration::from_secs(600));
    }

    #[test]
    fn individual_overrides_win_over_master() {
        let cfg = with(&[("TIMEOUT_SECS", "120"), ("SEARCH_TIMEOUT_MS", "1500")]);
        assert_eq!(cfg.search_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.request_timeout, Duration::from_secs(120));
    }

    #[test]
    fn restart_and_strategy_knobs() {
        let cfg = with(&[
            ("MAX_RETRIES", "5"),
            ("RESTART_COOLDOWN_SECS", "10"),
            ("MAX_RESTARTS", "4"),
            ("MAX_RESTARTS_PER_MINUTE", "2"),
            ("KEEPALIVE_SECS", "0"),
            ("WARM", "false"),
            ("PERSISTENT", "1"),
            ("AUTOSTART", "yes"),
            ("QUEUE_DB", "off"),
        ]);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.supervisor.restart_cooldown, Duration::from_secs(10));
        assert_eq!(cfg.supervisor.max_restarts, 4);
        assert_eq!(cfg.supervisor.max_restarts_per_minute, 2);
        assert!(cfg.supervisor.keepalive_interval.is_zero());
        assert!(!cfg.connection.warm);
        assert!(cfg.connection.persistent);
        assert!(cfg.autostart);
        assert!(cfg.queue_db.is_none());
    }

    #[test]
    fn garbage_values_are_ignored_and_bounds_repaired() {
        let cfg = with(&[
            ("MAX_RETRIES", "lots"),
            ("WARM", "maybe"),
            ("MIN_TIMEOUT_MS", "500000"),
        ]);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert!(cfg.connection.warm);
        assert_eq!(cfg.timeouts.max, Duration::from_millis(500_000));
    }

    #[test]
    fn run_dir_override_moves_socket_and_queue() {
        let cfg = with(&[("RUN_DIR", "/tmp/run")]);
        assert_eq!(cfg.socket_path, Path::new("/tmp/run/sockets/embeddings.sock"));
        assert_eq!(cfg.queue_db, Some(PathBuf::from("/tmp/run/overflow/queue.db")));
        assert_eq!(cfg.worker_paths().pid_file, Path::new("/tmp/run/worker.pid"));
    }
}
