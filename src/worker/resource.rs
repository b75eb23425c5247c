//! Resource tracking for worker sockets.
//!
//! Every [`SocketHandle`] registers itself with a [`ResourceTracker`] when it
//! is opened and deregisters the moment it closes. A background sweep
//! force-closes any handle that has been idle longer than the configured
//! maximum age; that sweep is a backstop for leaks, not the normal cleanup
//! path.

use std::collections::HashMap;
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::error::EmbedError;

/// Identifier assigned to a tracked handle.
pub type HandleId = u64;

#[derive(Debug)]
struct TrackedEntry {
    label: String,
    created_at: Instant,
    last_active: Instant,
    /// Clone of the tracked stream, used only to force a shutdown.
    closer: UnixStream,
}

/// Snapshot of one tracked handle, for diagnostics.
#[derive(Debug, Clone)]
pub struct TrackedHandleInfo {
    pub id: HandleId,
    pub label: String,
    pub age: Duration,
    pub idle: Duration,
}

/// Registry of open worker sockets.
#[derive(Debug)]
pub struct ResourceTracker {
    entries: Mutex<HashMap<HandleId, TrackedEntry>>,
    next_id: AtomicU64,
    max_age: Duration,
    sweep_interval: Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    stop: Arc<(Mutex<bool>, Condvar)>,
}

impl ResourceTracker {
    pub fn new(max_age: Duration, sweep_interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            max_age,
            sweep_interval,
            sweeper: Mutex::new(None),
            stop: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Tracker with the stock limits (60s max idle age, 5 minute sweep).
    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(60), Duration::from_secs(300))
    }

    pub fn allocate_id(&self) -> HandleId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register an open stream under `id`.
    ///
    /// Registering the same id twice is a defect and is rejected.
    pub fn register(&self, id: HandleId, stream: &UnixStream, label: &str) -> std::io::Result<()> {
        let closer = stream.try_clone()?;
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("socket handle {id} ({label}) registered twice"),
            ));
        }
        let now = Instant::now();
        entries.insert(
            id,
            TrackedEntry {
                label: label.to_string(),
                created_at: now,
                last_active: now,
                closer,
            },
        );
        debug!(id, label, tracked = entries.len(), "Tracked socket handle");
        Ok(())
    }

    /// Remove `id`; returns false if it was not registered.
    pub fn deregister(&self, id: HandleId) -> bool {
        let removed = self.entries.lock().remove(&id);
        match removed {
            Some(entry) => {
                debug!(id, label = %entry.label, "Released socket handle");
                true
            }
            None => false,
        }
    }

    /// Record activity so a busy long-lived handle is not swept.
    pub fn touch(&self, id: HandleId) {
        if let Some(entry) = self.entries.lock().get_mut(&id) {
            entry.last_active = Instant::now();
        }
    }

    pub fn is_tracked(&self, id: HandleId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    /// Number of handles currently registered.
    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn snapshot(&self) -> Vec<TrackedHandleInfo> {
        let now = Instant::now();
        let mut out: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(id, e)| TrackedHandleInfo {
                id: *id,
                label: e.label.clone(),
                age: now.duration_since(e.created_at),
                idle: now.duration_since(e.last_active),
            })
            .collect();
        out.sort_by_key(|h| h.id);
        out
    }

    /// Force-close and forget every handle idle longer than the max age.
    pub fn sweep(&self) -> usize {
        self.sweep_older_than(self.max_age)
    }

    pub fn sweep_older_than(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<(HandleId, TrackedEntry)> = {
            let mut entries = self.entries.lock();
            let ids: Vec<HandleId> = entries
                .iter()
                .filter(|(_, e)| now.duration_since(e.last_active) > max_age)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|e| (id, e)))
                .collect()
        };
        for (id, entry) in &expired {
            warn!(
                id,
                label = %entry.label,
                idle_ms = now.duration_since(entry.last_active).as_millis() as u64,
                "Sweeping leaked socket handle"
            );
            let _ = entry.closer.shutdown(Shutdown::Both);
        }
        expired.len()
    }

    /// Start the periodic sweep thread. Idempotent.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return;
        }
        *self.stop.0.lock() = false;
        let weak: Weak<Self> = Arc::downgrade(self);
        let stop = Arc::clone(&self.stop);
        let interval = self.sweep_interval;
        let spawned = std::thread::Builder::new()
            .name("embed-socket-sweeper".into())
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
                    let Some(tracker) = weak.upgrade() else {
                        break;
                    };
                    let swept = tracker.sweep();
                    if swept > 0 {
                        debug!(swept, "Socket sweep pass complete");
                    }
                }
            });
        match spawned {
            Ok(handle) => *slot = Some(handle),
            Err(e) => warn!(error = %e, "Failed to start socket sweeper"),
        }
    }

    /// Stop the sweep thread and wait for it to exit.
    pub fn stop_sweeper(&self) {
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            let (flag, cvar) = &*self.stop;
            *flag.lock() = true;
            cvar.notify_all();
            let _ = handle.join();
        }
    }
}

impl Drop for ResourceTracker {
    fn drop(&mut self) {
        let (flag, cvar) = &*self.stop;
        *flag.lock() = true;
        cvar.notify_all();
    }
}

/// Lifecycle of a [`SocketHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Connected,
    Closed,
}

/// One OS connection to the worker, registered with a tracker for its whole life.
#[derive(Debug)]
pub struct SocketHandle {
    id: HandleId,
    stream: UnixStream,
    state: SocketState,
    created_at: Instant,
    label: String,
    socket: PathBuf,
    tracker: Arc<ResourceTracker>,
}

impl SocketHandle {
    /// Connect to `socket` and register the new stream with `tracker`.
    pub fn connect(
        socket: &Path,
        label: &str,
        tracker: &Arc<ResourceTracker>,
    ) -> Result<Self, EmbedError> {
        let id = tracker.allocate_id();
        debug!(id, label, socket = %socket.display(), state = ?SocketState::Connecting, "Opening worker socket");
        let stream = UnixStream::connect(socket).map_err(|e| EmbedError::transport(socket, e))?;
        tracker
            .register(id, &stream, label)
            .map_err(|e| EmbedError::transport(socket, e))?;
        Ok(Self {
            id,
            stream,
            state: SocketState::Connected,
            created_at: Instant::now(),
            label: label.to_string(),
            socket: socket.to_path_buf(),
            tracker: Arc::clone(tracker),
        })
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn stream(&mut self) -> &mut UnixStream {
        &mut self.stream
    }

    pub fn try_clone_stream(&self) -> Result<UnixStream, EmbedError> {
        self.stream
            .try_clone()
            .map_err(|e| EmbedError::transport(&self.socket, e))
    }

    pub fn set_timeouts(&self, read: Duration, write: Duration) -> Result<(), EmbedError> {
        let read = (!read.is_zero()).then_some(read);
        let write = (!write.is_zero()).then_some(write);
        self.stream
            .set_read_timeout(read)
            .and_then(|()| self.stream.set_write_timeout(write))
            .map_err(|e| EmbedError::transport(&self.socket, e))
    }

    pub fn touch(&self) {
        self.tracker.touch(self.id);
    }

    /// True when the tracker swept this handle or the peer hung up.
    pub fn is_stale(&self) -> bool {
        self.state == SocketState::Closed || !self.tracker.is_tracked(self.id) || peer_closed(&self.stream)
    }

    /// Shut the connection down and deregister it. Idempotent.
    pub fn close(&mut self) {
        if self.state == SocketState::Closed {
            return;
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        self.tracker.deregister(self.id);
        self.state = SocketState::Closed;
    }
}

impl Drop for SocketHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Non-blocking peek: has the peer closed its end, or left unread bytes behind?
fn peer_closed(stream: &UnixStream) -> bool {
    use std::os::fd::AsRawFd;

    let mut byte = [0u8; 1];
    // SAFETY: recv on a valid fd into a 1-byte stack buffer; MSG_PEEK leaves data queued.
    let n = unsafe {
        libc::recv(
            stream.as_raw_fd(),
            byte.as_mut_ptr().cast::<libc::c_void>(),
            1,
            libc::MSG_PEEK | libc::MSG_DONTWAIT,
        )
    };
    if n == 0 {
        return true;
    }
    if n > 0 {
        // Unsolicited bytes on an idle connection: it cannot be reused safely.
        return true;
    }
    let err = std::io::Error::last_os_error();
    !matches!(err.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixListener;

    fn listener() -> (tempfile::TempDir, PathBuf, UnixListener) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.sock");
        let listener = UnixListener::bind(&path).unwrap();
        (dir, path, listener)
    }

    #[test]
    fn handle_registers_and_deregisters() {
        let (_dir, path, _listener) = listener();
        let tracker = Arc::new(ResourceTracker::with_defaults());
        let mut handle = SocketHandle::connect(&path, "test", &tracker).unwrap();
        assert_eq!(handle.state(), SocketState::Connected);
        assert_eq!(tracker.count(), 1);
        handle.close();
        assert_eq!(handle.state(), SocketState::Closed);
        assert_eq!(tracker.count(), 0);
        handle.close();
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn drop_deregisters() {
        let (_dir, path, _listener) = listener();
        let tracker = Arc::new(ResourceTracker::with_defaults());
        {
            let _a = SocketHandle::connect(&path, "a", &tracker).unwrap();
            let _b = SocketHandle::connect(&path, "b", &tracker).unwrap();
            assert_eq!(tracker.count(), 2);
        }
        assert_eq!(tracker.count(), 0);
    }

    #[test]
    fn double_registration_is_rejected() {
        let (a, _b) = UnixStream::pair().unwrap();
        let tracker = ResourceTracker::with_defaults();
        let id = tracker.allocate_id();
        tracker.register(id, &a, "dup").unwrap();
        let err = tracker.register(id, &a, "dup").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
        assert_eq!(tracker.count(), 1);
        assert!(tracker.deregister(id));
        assert!(!tracker.deregister(id));
    }

    #[test]
    fn sweep_closes_idle_handles() {
        let (_dir, path, listener) = listener();
        let tracker = Arc::new(ResourceTracker::new(
            Duration::from_millis(10),
            Duration::from_secs(300),
        ));
        let handle = SocketHandle::connect(&path, "leaky", &tracker).unwrap();
        let (_server_side, _) = listener.accept().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(tracker.sweep(), 1);
        assert_eq!(tracker.count(), 0);
        assert!(handle.is_stale());
    }

    #[test]
    fn touched_handles_survive_sweep() {
        let (a, _b) = UnixStream::pair().unwrap();
        let tracker = ResourceTracker::new(Duration::from_millis(50), Duration::from_secs(300));
        let id = tracker.allocate_id();
        tracker.register(id, &a, "busy").unwrap();
        std::thread::sleep(Duration::from_millis(30));
        tracker.touch(id);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(tracker.sweep(), 0);
        assert_eq!(tracker.count(), 1);
    }

    #[test]
    fn peer_close_is_detected() {
        let (a, b) = UnixStream::pair().unwrap();
        assert!(!peer_closed(&a));
        drop(b);
        assert!(peer_closed(&a));
    }

    #[test]
    fn sweeper_thread_stops() {
        let tracker = Arc::new(ResourceTracker::new(
            Duration::from_millis(5),
            Duration::from_millis(5),
        ));
        tracker.start_sweeper();
        tracker.start_sweeper();
        std::thread::sleep(Duration::from_millis(20));
        tracker.stop_sweeper();
        assert!(tracker.sweeper.lock().is_none());
    }
}
