//! Shared fixtures: a scripted in-process embedding worker, a launcher that
//! starts it, log capture, and env/config helpers.

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use semantic_embed_client::EmbeddingClientConfig;
use semantic_embed_client::worker::{EmbedError, LaunchSpec, WorkerLauncher, WorkerProcess};
use serde_json::{Value, json};

/// How the fake worker answers embed and batch requests.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Behavior {
    Normal,
    /// Send `count` heartbeats, `gap` apart, before each embedding.
    Heartbeats { count: usize, gap: Duration },
    /// Read embed requests and never answer.
    Silent,
    /// Answer batch requests with an error frame.
    RejectBatch,
    /// Answer embed requests with an error frame.
    ErrorReply,
}

/// The vector the fake worker returns for `text`.
#[allow(dead_code)]
pub fn fake_vector(text: &str, dim: usize) -> Vec<f64> {
    (0..dim).map(|i| (text.len() + i + 1) as f64).collect()
}

/// `fake_vector` normalized to unit length.
#[allow(dead_code)]
pub fn expected_unit(text: &str, dim: usize) -> Vec<f64> {
    let v = fake_vector(text, dim);
    let norm = v.iter().map(|x| x * x).sum::<f64>().sqrt();
    v.into_iter().map(|x| x / norm).collect()
}

#[allow(dead_code)]
pub fn assert_close(a: &[f64], b: &[f64]) {
    assert_eq!(a.len(), b.len(), "length mismatch");
    for (x, y) in a.iter().zip(b) {
        assert!((x - y).abs() < 1e-9, "{a:?} != {b:?}");
    }
}

#[allow(dead_code)]
pub fn l2_norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

#[derive(Debug)]
pub struct WorkerShared {
    pub dim: usize,
    stop: AtomicBool,
    behavior: Mutex<Behavior>,
    drop_next: AtomicUsize,
    pub connections: AtomicUsize,
    pub embeds: AtomicUsize,
    pub batches: AtomicUsize,
    pub health_checks: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub keepalives: AtomicUsize,
    streams: Mutex<Vec<UnixStream>>,
}

/// A line-delimited JSON worker listening on a Unix socket.
#[derive(Debug)]
pub struct FakeWorker {
    socket: PathBuf,
    shared: Arc<WorkerShared>,
    accept: Option<JoinHandle<()>>,
}

#[allow(dead_code)]
impl FakeWorker {
    pub fn start(socket: &Path, dim: usize) -> Self {
        if let Some(parent) = socket.parent() {
            fs::create_dir_all(parent).expect("socket dir");
        }
        let _ = fs::remove_file(socket);
        let listener = UnixListener::bind(socket).expect("bind fake worker");
        listener.set_nonblocking(true).expect("nonblocking listener");
        let shared = Arc::new(WorkerShared {
            dim,
            stop: AtomicBool::new(false),
            behavior: Mutex::new(Behavior::Normal),
            drop_next: AtomicUsize::new(0),
            connections: AtomicUsize::new(0),
            embeds: AtomicUsize::new(0),
            batches: AtomicUsize::new(0),
            health_checks: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            keepalives: AtomicUsize::new(0),
            streams: Mutex::new(Vec::new()),
        });
        let accept_shared = Arc::clone(&shared);
        let path = socket.to_path_buf();
        let accept = std::thread::spawn(move || accept_loop(listener, accept_shared, path));
        Self {
            socket: socket.to_path_buf(),
            shared,
            accept: Some(accept),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn stats(&self) -> &WorkerShared {
        &self.shared
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.shared.behavior.lock().unwrap() = behavior;
    }

    /// Close the connection instead of answering the next `n` embed requests.
    pub fn drop_next(&self, n: usize) {
        self.shared.drop_next.store(n, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        !self.shared.stop.load(Ordering::SeqCst)
    }

    /// Stop accepting, sever live connections, and remove the socket file.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        for stream in self.shared.streams.lock().unwrap().drain(..) {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        if let Some(handle) = self.accept.take() {
            let _ = handle.join();
        }
        let _ = fs::remove_file(&self.socket);
    }
}

impl Drop for FakeWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(listener: UnixListener, shared: Arc<WorkerShared>, path: PathBuf) {
    while !shared.stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let _ = stream.set_nonblocking(false);
                shared.connections.fetch_add(1, Ordering::SeqCst);
                if let Ok(clone) = stream.try_clone() {
                    shared.streams.lock().unwrap().push(clone);
                }
                let conn_shared = Arc::clone(&shared);
                std::thread::spawn(move || serve(stream, conn_shared));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(_) => break,
        }
    }
    let _ = fs::remove_file(&path);
}

fn serve(stream: UnixStream, shared: Arc<WorkerShared>) {
    let Ok(read_half) = stream.try_clone() else {
        return;
    };
    let reader = BufReader::new(read_half);
    let mut writer = stream;
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if shared.stop.load(Ordering::SeqCst) {
            break;
        }
        let request: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => {
                if send(&mut writer, &json!({"error": "invalid JSON"})).is_err() {
                    break;
                }
                continue;
            }
        };
        if !respond(&shared, &request, &mut writer) {
            break;
        }
    }
    // The accept loop holds a clone of this stream; shut down so the peer sees EOF.
    let _ = writer.shutdown(std::net::Shutdown::Both);
}

fn send(writer: &mut UnixStream, value: &Value) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line)?;
    writer.flush()
}

/// Returns false when the connection should be closed.
fn respond(shared: &WorkerShared, request: &Value, writer: &mut UnixStream) -> bool {
    let behavior = *shared.behavior.lock().unwrap();
    if request.get("shutdown").and_then(Value::as_bool) == Some(true) {
        shared.shutdowns.fetch_add(1, Ordering::SeqCst);
        let _ = send(writer, &json!({"status": "shutting_down"}));
        shared.stop.store(true, Ordering::SeqCst);
        return false;
    }
    if let Some(texts) = request.get("texts").and_then(Value::as_array) {
        shared.batches.fetch_add(1, Ordering::SeqCst);
        let reply = if behavior == Behavior::RejectBatch {
            json!({"error": "batch requests are not supported"})
        } else {
            let vectors: Vec<Vec<f64>> = texts
                .iter()
                .map(|t| fake_vector(t.as_str().unwrap_or_default(), shared.dim))
                .collect();
            json!({"embeddings": vectors})
        };
        return send(writer, &reply).is_ok();
    }
    match request.get("type").and_then(Value::as_str) {
        Some("health") => {
            shared.health_checks.fetch_add(1, Ordering::SeqCst);
            send(writer, &json!({"status": "healthy", "model": "fake"})).is_ok()
        }
        Some("kys") => {
            shared.keepalives.fetch_add(1, Ordering::SeqCst);
            send(writer, &json!({"status": "alive", "model_loaded": true})).is_ok()
        }
        Some("get_dimension") => send(
            writer,
            &json!({"native_dimensions": shared.dim, "target_dimensions": shared.dim}),
        )
        .is_ok(),
        Some("embed") => {
            shared.embeds.fetch_add(1, Ordering::SeqCst);
            if shared
                .drop_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return false;
            }
            let text = request.get("text").and_then(Value::as_str).unwrap_or_default();
            let request_id = request.get("requestId").cloned().unwrap_or(Value::Null);
            match behavior {
                Behavior::Silent => true,
                Behavior::ErrorReply => send(
                    writer,
                    &json!({"error": "model failure", "requestId": request_id}),
                )
                .is_ok(),
                Behavior::Heartbeats { count, gap } => {
                    for _ in 0..count {
                        std::thread::sleep(gap);
                        let beat = json!({"status": "processing", "text_length": text.len(), "requestId": request_id});
                        if send(writer, &beat).is_err() {
                            return false;
                        }
                    }
                    send(
                        writer,
                        &json!({"embedding": fake_vector(text, shared.dim), "requestId": request_id}),
                    )
                    .is_ok()
                }
                Behavior::Normal | Behavior::RejectBatch => send(
                    writer,
                    &json!({"embedding": fake_vector(text, shared.dim), "requestId": request_id}),
                )
                .is_ok(),
            }
        }
        _ => send(writer, &json!({"error": "unknown request"})).is_ok(),
    }
}

/// Launches a [`FakeWorker`] on the requested socket.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct FakeLauncher {
    pub dim: usize,
    /// When false the "process" runs but never binds the socket.
    pub healthy: bool,
    pub available: Arc<AtomicBool>,
    pub launches: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl FakeLauncher {
    pub fn healthy(dim: usize) -> Self {
        Self {
            dim,
            healthy: true,
            available: Arc::new(AtomicBool::new(true)),
            launches: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn never_healthy() -> Self {
        Self {
            healthy: false,
            ..Self::healthy(8)
        }
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn boxed(&self) -> Vec<Box<dyn WorkerLauncher>> {
        vec![Box::new(self.clone())]
    }
}

impl WorkerLauncher for FakeLauncher {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn WorkerProcess>, EmbedError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let worker = self.healthy.then(|| FakeWorker::start(&spec.socket, self.dim));
        Ok(Box::new(FakeProcess {
            worker,
            running: true,
        }))
    }
}

#[derive(Debug)]
pub struct FakeProcess {
    worker: Option<FakeWorker>,
    running: bool,
}

impl WorkerProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_running(&mut self) -> bool {
        match &self.worker {
            Some(worker) => worker.is_running(),
            None => self.running,
        }
    }

    fn terminate(&mut self, _grace: Duration) {
        self.running = false;
        if let Some(worker) = self.worker.as_mut() {
            worker.stop();
        }
    }

    fn describe(&self) -> String {
        "fake worker".into()
    }
}

/// Config rooted in `dir` with timeouts short enough for tests.
#[allow(dead_code)]
pub fn test_config(dir: &Path) -> EmbeddingClientConfig {
    let mut config = EmbeddingClientConfig::for_project(dir.join("project"), dir);
    config.retry.initial_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(20);
    config.timeouts.initial = Duration::from_secs(2);
    config.timeouts.min = Duration::from_millis(100);
    config.timeouts.max = Duration::from_secs(5);
    config.search_timeout = Duration::from_secs(2);
    config.supervisor.startup_timeout = Duration::from_millis(400);
    config.supervisor.health_timeout = Duration::from_millis(500);
    config.supervisor.poll_interval = Duration::from_millis(20);
    config.supervisor.restart_cooldown = Duration::ZERO;
    config.supervisor.restart_backoff_base = Duration::from_millis(1);
    config.supervisor.restart_backoff_max = Duration::from_millis(5);
    config.supervisor.shutdown_grace = Duration::from_millis(200);
    config
}

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: Arc<Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(Arc<Mutex<Vec<u8>>>);

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[allow(dead_code)]
pub struct EnvGuard {
    key: String,
    prev: Option<String>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn set(key: &str, val: impl AsRef<str>) -> Self {
        let prev = std::env::var(key).ok();
        // SAFETY: callers are #[serial]; no other thread reads the environment concurrently.
        unsafe { std::env::set_var(key, val.as_ref()) };
        Self {
            key: key.to_string(),
            prev,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        // SAFETY: see `EnvGuard::set`.
        match &self.prev {
            Some(v) => unsafe { std::env::set_var(&self.key, v) },
            None => unsafe { std::env::remove_var(&self.key) },
        }
    }
}
