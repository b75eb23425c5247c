//! Legacy persistent connection: one long-lived socket shared by concurrent
//! callers, with responses routed back by `requestId`.
//!
//! A dedicated reader thread owns the receive side. Each in-flight call
//! registers a [`PendingRequest`] and waits on its own channel; any
//! transport or framing failure rejects every pending call at once and
//! tears the connection down.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::error::EmbedError;
use super::protocol::{FrameReader, WorkerFrame, WorkerRequest, encode_request, write_request};
use super::resource::{ResourceTracker, SocketHandle};

/// Delivered to a waiting caller.
#[derive(Debug)]
pub enum PendingEvent {
    /// The worker is still computing; the caller's idle timer restarts.
    Heartbeat,
    Frame(WorkerFrame),
    Failed(EmbedError),
}

/// One caller awaiting a response on the shared connection.
#[derive(Debug)]
pub struct PendingRequest {
    tx: Sender<PendingEvent>,
    deadline: Instant,
    created_at: Instant,
}

impl PendingRequest {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

#[derive(Debug)]
struct Shared {
    socket: PathBuf,
    pending: Mutex<HashMap<String, PendingRequest>>,
    handle: Mutex<Option<SocketHandle>>,
    alive: AtomicBool,
}

impl Shared {
    fn route(&self, frame: WorkerFrame) {
        let mut pending = self.pending.lock();
        let key = match frame.request_id() {
            Some(id) if pending.contains_key(id) => id.to_string(),
            Some(id) => {
                debug!(request_id = id, "Dropping response for unknown request");
                return;
            }
            // Frames without an id can only be attributed when exactly one call is waiting.
            None if pending.len() == 1 => match pending.keys().next() {
                Some(only) => only.clone(),
                None => return,
            },
            None => {
                warn!(
                    pending = pending.len(),
                    "Dropping uncorrelated response on persistent connection"
                );
                return;
            }
        };
        if frame.is_heartbeat() {
            if let Some(entry) = pending.get(&key) {
                let _ = entry.tx.send(PendingEvent::Heartbeat);
            }
            return;
        }
        if let Some(entry) = pending.remove(&key) {
            let _ = entry.tx.send(PendingEvent::Frame(frame));
        }
    }

    /// Reject every waiter and tear the socket down.
    fn fail_all(&self, cause: &EmbedError) {
        self.alive.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().take();
        drop(handle);
        let drained: Vec<(String, PendingRequest)> = self.pending.lock().drain().collect();
        if !drained.is_empty() {
            warn!(
                socket = %self.socket.display(),
                rejected = drained.len(),
                error = %cause,
                "Persistent connection failed, rejecting pending requests"
            );
        }
        for (_, entry) in drained {
            let _ = entry.tx.send(PendingEvent::Failed(rejection(cause, &self.socket)));
        }
    }
}

/// Rebuild a per-waiter copy of a shared failure.
fn rejection(cause: &EmbedError, socket: &Path) -> EmbedError {
    match cause {
        EmbedError::Transport { kind, source, .. } => EmbedError::Transport {
            socket: socket.to_path_buf(),
            kind: *kind,
            source: io::Error::new(source.kind(), source.to_string()),
        },
        _ => EmbedError::connection_lost(socket),
    }
}

/// Long-lived request-correlating connection to the worker.
#[derive(Debug)]
pub struct PersistentConnection {
    shared: Arc<Shared>,
    next_id: AtomicU64,
}

impl PersistentConnection {
    /// Connect and start the reader thread.
    pub fn connect(
        socket: &Path,
        tracker: &Arc<ResourceTracker>,
        write_timeout: Duration,
    ) -> Result<Arc<Self>, EmbedError> {
        let handle = SocketHandle::connect(socket, "persistent", tracker)?;
        // No read timeout: the reader thread blocks until data, EOF, or a forced shutdown.
        handle.set_timeouts(Duration::ZERO, write_timeout)?;
        let mut reader = FrameReader::new(handle.try_clone_stream()?, socket);
        let shared = Arc::new(Shared {
            socket: socket.to_path_buf(),
            pending: Mutex::new(HashMap::new()),
            handle: Mutex::new(Some(handle)),
            alive: AtomicBool::new(true),
        });
        let thread_shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("embed-persistent-reader".into())
            .spawn(move || {
                loop {
                    match reader.read_frame(Duration::ZERO) {
                        Ok(frame) => thread_shared.route(frame),
                        Err(err) => {
                            thread_shared.fail_all(&err);
                            break;
                        }
                    }
                }
                debug!(socket = %thread_shared.socket.display(), "Persistent reader exited");
            })
            .map_err(|e| EmbedError::transport(socket, e))?;
        debug!(socket = %socket.display(), "Opened persistent connection");
        Ok(Arc::new(Self {
            shared,
            next_id: AtomicU64::new(1),
        }))
    }

    pub fn socket_path(&self) -> &Path {
        &self.shared.socket
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    /// Register a completion slot for `request_id`.
    ///
    /// A second registration while the first is outstanding is rejected;
    /// the first waiter is left untouched.
    pub fn register(
        &self,
        request_id: &str,
        deadline: Instant,
    ) -> Result<Receiver<PendingEvent>, EmbedError> {
        if !self.is_alive() {
            return Err(EmbedError::connection_lost(&self.shared.socket));
        }
        let mut pending = self.shared.pending.lock();
        let now = Instant::now();
        pending.retain(|id, entry| {
            let keep = entry.deadline > now;
            if !keep {
                debug!(request_id = %id, age_ms = entry.age().as_millis() as u64, "Expiring overdue pending request");
            }
            keep
        });
        if pending.contains_key(request_id) {
            return Err(EmbedError::DuplicateRequestId(request_id.to_string()));
        }
        let (tx, rx) = unbounded();
        pending.insert(
            request_id.to_string(),
            PendingRequest {
                tx,
                deadline,
                created_at: now,
            },
        );
        Ok(rx)
    }

    /// Remove a pending registration; true if it was still present.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.shared.pending.lock().remove(request_id).is_some()
    }

    /// Send `request` and wait for its correlated terminal frame.
    pub fn request(&self, request: &WorkerRequest, idle: Duration) -> Result<WorkerFrame, EmbedError> {
        let request_id = match request.request_id() {
            Some(id) => id.to_string(),
            None => format!(
                "p{}-{}",
                std::process::id(),
                self.next_id.fetch_add(1, Ordering::Relaxed)
            ),
        };
        let tagged = request.with_request_id(&request_id);
        let line = encode_request(&tagged)?;
        let rx = self.register(&request_id, Instant::now() + idle)?;

        let written = {
            let mut guard = self.shared.handle.lock();
            match guard.as_mut() {
                Some(handle) => {
                    handle.touch();
                    write_request(handle.stream(), &self.shared.socket, &line)
                }
                None => Err(EmbedError::connection_lost(&self.shared.socket)),
            }
        };
        if let Err(err) = written {
            self.cancel(&request_id);
            self.shared.fail_all(&err);
            return Err(err);
        }

        loop {
            match rx.recv_timeout(idle) {
                Ok(PendingEvent::Heartbeat) => {
                    if let Some(entry) = self.shared.pending.lock().get_mut(&request_id) {
                        entry.deadline = Instant::now() + idle;
                    }
                    if let Some(handle) = self.shared.handle.lock().as_ref() {
                        handle.touch();
                    }
                    debug!(request_id = %request_id, "Heartbeat on persistent connection");
                }
                Ok(PendingEvent::Frame(frame)) => return frame.into_result(),
                Ok(PendingEvent::Failed(err)) => return Err(err),
                Err(RecvTimeoutError::Timeout) => {
                    self.cancel(&request_id);
                    let err = EmbedError::IdleTimeout {
                        socket: self.shared.socket.clone(),
                        idle,
                    };
                    self.shared.fail_all(&err);
                    return Err(err);
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EmbedError::connection_lost(&self.shared.socket));
                }
            }
        }
    }

    /// Close the connection, rejecting anything still pending.
    pub fn close(&self) {
        if self.is_alive() || self.shared.handle.lock().is_some() {
            self.shared.fail_all(&EmbedError::connection_lost(&self.shared.socket));
        }
    }
}

impl Drop for PersistentConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::os::unix::net::UnixListener;

    fn serve<F>(handler: F) -> (tempfile::TempDir, PathBuf)
    where
        F: FnOnce(std::os::unix::net::UnixStream) + Send + 'static,
    {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("p.sock");
        let listener = UnixListener::bind(&path).unwrap();
        std::thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                handler(stream);
            }
        });
        (dir, path)
    }

    #[test]
    fn duplicate_request_id_is_rejected() {
        let (_dir, path) = serve(|s| {
            std::thread::sleep(Duration::from_millis(200));
            drop(s);
        });
        let tracker = Arc::new(ResourceTracker::with_defaults());
        let conn = PersistentConnection::connect(&path, &tracker, Duration::from_secs(1)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        let _first = conn.register("same", deadline).unwrap();
        let second = conn.register("same", deadline);
        assert!(matches!(second, Err(EmbedError::DuplicateRequestId(id)) if id == "same"));
        assert_eq!(conn.pending_count(), 1);
        conn.close();
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn responses_are_routed_by_request_id() {
        let (_dir, path) = serve(|stream| {
            let mut writer = stream.try_clone().unwrap();
            let mut lines = BufReader::new(stream).lines();
            let mut ids = Vec::new();
            for _ in 0..2 {
                let line = lines.next().unwrap().unwrap();
                let v: serde_json::Value = serde_json::from_str(&line).unwrap();
                ids.push(v["requestId"].as_str().unwrap().to_string());
            }
            // Answer in reverse order, with a heartbeat first.
            for id in ids.iter().rev() {
                writeln!(writer, r#"{{"status":"processing","requestId":"{id}"}}"#).unwrap();
                let value = if id == "a" { 1.0 } else { 2.0 };
                writeln!(writer, r#"{{"embedding":[{value}],"requestId":"{id}"}}"#).unwrap();
            }
            std::thread::sleep(Duration::from_millis(200));
        });
        let tracker = Arc::new(ResourceTracker::with_defaults());
        let conn = PersistentConnection::connect(&path, &tracker, Duration::from_secs(1)).unwrap();
        let idle = Duration::from_secs(5);
        let c1 = Arc::clone(&conn);
        let t1 = std::thread::spawn(move || {
            c1.request(&WorkerRequest::embed("x").with_request_id("a"), idle)
        });
        let c2 = Arc::clone(&conn);
        let t2 = std::thread::spawn(move || {
            c2.request(&WorkerRequest::embed("y").with_request_id("b"), idle)
        });
        let a = t1.join().unwrap().unwrap();
        let b = t2.join().unwrap().unwrap();
        assert!(matches!(a, WorkerFrame::Embedding { ref vector, .. } if vector == &vec![1.0]));
        assert!(matches!(b, WorkerFrame::Embedding { ref vector, .. } if vector == &vec![2.0]));
        assert_eq!(conn.pending_count(), 0);
    }

    #[test]
    fn transport_failure_rejects_all_pending() {
        let (_dir, path) = serve(|stream| {
            let mut lines = BufReader::new(stream.try_clone().unwrap()).lines();
            let _ = lines.next();
            let _ = lines.next();
            drop(stream);
        });
        let tracker = Arc::new(ResourceTracker::with_defaults());
        let conn = PersistentConnection::connect(&path, &tracker, Duration::from_secs(1)).unwrap();
        let idle = Duration::from_secs(5);
        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|id| {
                let c = Arc::clone(&conn);
                std::thread::spawn(move || c.request(&WorkerRequest::embed(id).with_request_id(id), idle))
            })
            .collect();
        for h in handles {
            let err = h.join().unwrap().unwrap_err();
            assert!(err.is_retryable(), "got {err:?}");
        }
        assert_eq!(conn.pending_count(), 0);
        assert!(!conn.is_alive());
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn idle_timeout_removes_pending_and_destroys_socket() {
        let (_dir, path) = serve(|stream| {
            std::thread::sleep(Duration::from_millis(500));
            drop(stream);
        });
        let tracker = Arc::new(ResourceTracker::with_defaults());
        let conn = PersistentConnection::connect(&path, &tracker, Duration::from_secs(1)).unwrap();
        let err = conn
            .request(&WorkerRequest::embed("slow"), Duration::from_millis(50))
            .unwrap_err();
        assert!(err.is_idle_timeout());
        assert_eq!(conn.pending_count(), 0);
        assert_eq!(tracker.count(), 0);
    }
}
