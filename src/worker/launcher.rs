//! Launch mechanisms for the embedding worker process.
//!
//! The supervisor walks its launchers in order and uses the first one that
//! reports itself available: a native interpreter running the worker script,
//! then a container runtime running the worker image.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::error::EmbedError;
use super::lock::{PidRecord, terminate_pid};

/// Default file name of the worker script.
pub const WORKER_SCRIPT_NAME: &str = "embedding_worker.py";

/// Default container image for the worker.
pub const WORKER_IMAGE: &str = "semantic-embed-worker:latest";

/// Everything a launcher needs to start one worker.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub socket: PathBuf,
    pub project: PathBuf,
    /// Worker stderr is appended to `worker.log` in this directory.
    pub log_dir: PathBuf,
}

impl LaunchSpec {
    pub fn socket_dir(&self) -> &Path {
        self.socket.parent().unwrap_or_else(|| Path::new("/"))
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join("worker.log")
    }
}

/// A running (or recently running) worker.
pub trait WorkerProcess: Send + fmt::Debug {
    /// OS pid, for workers that are direct children.
    fn pid(&self) -> Option<u32>;

    fn container(&self) -> Option<&str> {
        None
    }

    fn is_running(&mut self) -> bool;

    /// Stop the worker, escalating to a hard kill after `grace`.
    fn terminate(&mut self, grace: Duration);

    fn describe(&self) -> String;
}

/// A way to start the worker.
pub trait WorkerLauncher: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    fn is_available(&self) -> bool;

    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn WorkerProcess>, EmbedError>;

    /// Kill a worker recorded in a PID file by a process that no longer exists.
    fn kill_orphan(&self, record: &PidRecord, grace: Duration) {
        if let Some(pid) = record.worker_pid {
            warn!(pid, spawner = record.spawner_pid, "Killing orphaned worker");
            terminate_pid(pid, grace);
        }
    }
}

/// Runs the worker script under a local Python interpreter.
#[derive(Debug, Clone)]
pub struct NativeLauncher {
    interpreter: Option<PathBuf>,
    script: Option<PathBuf>,
}

impl NativeLauncher {
    /// Resolve `python3` on `PATH` and the first worker script found in
    /// `search_paths` (an explicit override wins).
    pub fn discover(script_override: Option<&Path>, search_paths: &[PathBuf]) -> Self {
        let interpreter = which::which("python3").or_else(|_| which::which("python")).ok();
        let script = match script_override {
            Some(path) => path.is_file().then(|| path.to_path_buf()),
            None => search_paths
                .iter()
                .map(|dir| dir.join(WORKER_SCRIPT_NAME))
                .find(|candidate| candidate.is_file()),
        };
        debug!(interpreter = ?interpreter, script = ?script, "Native worker discovery");
        Self { interpreter, script }
    }

    pub fn new(interpreter: PathBuf, script: PathBuf) -> Self {
        Self {
            interpreter: Some(interpreter),
            script: Some(script),
        }
    }

    pub fn script(&self) -> Option<&Path> {
        self.script.as_deref()
    }
}

impl WorkerLauncher for NativeLauncher {
    fn name(&self) -> &'static str {
        "native"
    }

    fn is_available(&self) -> bool {
        self.interpreter.is_some() && self.script.is_some()
    }

    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn WorkerProcess>, EmbedError> {
        let (Some(interpreter), Some(script)) = (&self.interpreter, &self.script) else {
            return Err(EmbedError::StartupFatal(
                "no Python interpreter or worker script found".into(),
            ));
        };
        fs::create_dir_all(&spec.log_dir)
            .and_then(|()| fs::create_dir_all(spec.socket_dir()))
            .map_err(|e| EmbedError::StartupFatal(format!("cannot prepare run dir: {e}")))?;
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(spec.log_file())
            .map_err(|e| EmbedError::StartupFatal(format!("cannot open worker log: {e}")))?;

        let mut cmd = Command::new(interpreter);
        cmd.arg(script)
            .arg("--service")
            .env("SPECMEM_SOCKET_DIR", spec.socket_dir())
            .env("SPECMEM_PROJECT_PATH", &spec.project)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log))
            // Own process group so terminal signals aimed at the client skip the worker.
            .process_group(0);
        let child = cmd.spawn().map_err(|e| {
            EmbedError::StartupFatal(format!("failed to spawn {}: {e}", interpreter.display()))
        })?;
        info!(
            pid = child.id(),
            script = %script.display(),
            socket = %spec.socket.display(),
            "Spawned native embedding worker"
        );
        Ok(Box::new(NativeProcess { child }))
    }
}

#[derive(Debug)]
pub struct NativeProcess {
    child: Child,
}

impl WorkerProcess for NativeProcess {
    fn pid(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn terminate(&mut self, grace: Duration) {
        if !self.is_running() {
            return;
        }
        let pid = self.child.id();
        if let Ok(raw) = libc::pid_t::try_from(pid) {
            // SAFETY: signalling our own child, which has not been reaped yet.
            unsafe {
                libc::kill(raw, libc::SIGTERM);
            }
        }
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = self.child.try_wait() {
                debug!(pid, %status, "Native worker exited");
                return;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        warn!(pid, "Native worker ignored SIGTERM, killing");
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    fn describe(&self) -> String {
        format!("native pid {}", self.child.id())
    }
}

/// Runs the worker image under docker or podman with resource caps.
#[derive(Debug, Clone)]
pub struct ContainerLauncher {
    runtime: Option<PathBuf>,
    image: String,
    cpus: String,
    memory: String,
    container_name: String,
}

impl ContainerLauncher {
    /// Resolve the runtime (`docker`, then `podman`, unless overridden).
    pub fn discover(runtime_override: Option<&str>, image: Option<&str>, project_hash: &str) -> Self {
        let runtime = match runtime_override {
            Some(name) => which::which(name).ok(),
            None => which::which("docker").or_else(|_| which::which("podman")).ok(),
        };
        Self {
            runtime,
            image: image.unwrap_or(WORKER_IMAGE).to_string(),
            cpus: "1".into(),
            memory: "2g".into(),
            container_name: format!("semantic-embed-{project_hash}"),
        }
    }

    pub fn with_limits(mut self, cpus: impl Into<String>, memory: impl Into<String>) -> Self {
        self.cpus = cpus.into();
        self.memory = memory.into();
        self
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    fn runtime_command(&self) -> Result<Command, EmbedError> {
        self.runtime
            .as_ref()
            .map(Command::new)
            .ok_or_else(|| EmbedError::StartupFatal("no container runtime found".into()))
    }

    fn image_present(&self) -> Result<bool, EmbedError> {
        let status = self
            .runtime_command()?
            .args(["image", "inspect", &self.image])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| EmbedError::StartupFatal(format!("container runtime failed: {e}")))?;
        Ok(status.success())
    }

    fn remove_container(&self, name: &str) {
        if let Ok(mut cmd) = self.runtime_command() {
            let _ = cmd
                .args(["rm", "-f", name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
    }
}

impl WorkerLauncher for ContainerLauncher {
    fn name(&self) -> &'static str {
        "container"
    }

    fn is_available(&self) -> bool {
        self.runtime.is_some()
    }

    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn WorkerProcess>, EmbedError> {
        if !self.image_present()? {
            return Err(EmbedError::StartupFatal(format!(
                "worker image {} is not available locally",
                self.image
            )));
        }
        fs::create_dir_all(spec.socket_dir())
            .map_err(|e| EmbedError::StartupFatal(format!("cannot prepare socket dir: {e}")))?;
        // A leftover container with our name would make `run` fail.
        self.remove_container(&self.container_name);

        let volume = format!("{}:/sockets", spec.socket_dir().display());
        let output = self
            .runtime_command()?
            .args(["run", "-d", "--rm", "--name", &self.container_name])
            .args(["--cpus", &self.cpus, "--memory", &self.memory])
            .args(["--network", "none"])
            .args(["-v", &volume])
            .args(["-e", "SPECMEM_SOCKET_DIR=/sockets"])
            .arg(&self.image)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| EmbedError::StartupFatal(format!("container runtime failed: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EmbedError::WorkerUnavailable {
                socket: spec.socket.clone(),
                reason: format!("container start failed: {}", stderr.trim()),
            });
        }
        info!(
            container = %self.container_name,
            image = %self.image,
            socket = %spec.socket.display(),
            "Started containerized embedding worker"
        );
        Ok(Box::new(ContainerProcess {
            launcher: self.clone(),
            name: self.container_name.clone(),
        }))
    }

    fn kill_orphan(&self, record: &PidRecord, grace: Duration) {
        match &record.container {
            Some(name) => {
                warn!(container = %name, spawner = record.spawner_pid, "Removing orphaned worker container");
                self.remove_container(name);
            }
            None => {
                if let Some(pid) = record.worker_pid {
                    terminate_pid(pid, grace);
                }
            }
        }
    }
}

#[derive(Debug)]
pub struct ContainerProcess {
    launcher: ContainerLauncher,
    name: String,
}

impl WorkerProcess for ContainerProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn container(&self) -> Option<&str> {
        Some(&self.name)
    }

    fn is_running(&mut self) -> bool {
        let Ok(mut cmd) = self.launcher.runtime_command() else {
            return false;
        };
        cmd.args(["inspect", "-f", "{{.State.Running}}", &self.name])
            .stderr(Stdio::null())
            .output()
            .map(|out| out.status.success() && String::from_utf8_lossy(&out.stdout).trim() == "true")
            .unwrap_or(false)
    }

    fn terminate(&mut self, grace: Duration) {
        if let Ok(mut cmd) = self.launcher.runtime_command() {
            let secs = grace.as_secs().max(1).to_string();
            let _ = cmd
                .args(["stop", "-t", &secs, &self.name])
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status();
        }
        self.launcher.remove_container(&self.name);
    }

    fn describe(&self) -> String {
        format!("container {}", self.name)
    }
}
