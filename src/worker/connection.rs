//! Connection management for the embedding worker socket.
//!
//! Three strategies, tried in order on a preferred route:
//!
//! 1. **warm**: one reused connection, serialized by a mutex.
//! 2. **persistent**: one shared connection with `requestId` correlation.
//! 3. **direct**: a fresh connection per call, always closed afterwards.
//!
//! A strategy falls through to the next one only when it cannot connect.
//! A failure after the request was written is returned to the caller; the
//! retry loop then comes back on [`Route::DirectOnly`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::error::EmbedError;
use super::persistent::PersistentConnection;
use super::protocol::{FrameReader, WorkerFrame, WorkerRequest, encode_request, write_request};
use super::resource::{ResourceTracker, SocketHandle};

/// Which strategies a call may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// warm, then persistent, then direct.
    Preferred,
    /// Skip the long-lived connections.
    DirectOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Warm,
    Persistent,
    Direct,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Warm => "warm",
            Strategy::Persistent => "persistent",
            Strategy::Direct => "direct",
        }
    }
}

/// A completed request/response exchange.
#[derive(Debug)]
pub struct Exchange {
    pub frame: WorkerFrame,
    pub strategy: Strategy,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub warm: bool,
    pub persistent: bool,
    /// A warm connection unused for this long is discarded.
    pub warm_idle_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            warm: true,
            persistent: false,
            warm_idle_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(60),
        }
    }
}

/// Called after a long-lived connection is (re)established and before it is
/// handed to callers. Implementations must only use [`Route::DirectOnly`].
pub type ReconnectHook = Arc<dyn Fn(&ConnectionManager) + Send + Sync>;

enum Attempt {
    /// Could not connect; the next strategy may try.
    Unavailable(EmbedError),
    /// Connected but the exchange failed.
    Failed(EmbedError),
}

struct WarmConnection {
    handle: SocketHandle,
    reader: FrameReader,
    path: PathBuf,
    last_used: Instant,
}

impl WarmConnection {
    fn open(path: &Path, tracker: &Arc<ResourceTracker>, write_timeout: Duration) -> Result<Self, EmbedError> {
        let handle = SocketHandle::connect(path, "warm", tracker)?;
        handle.set_timeouts(Duration::ZERO, write_timeout)?;
        let reader = FrameReader::new(handle.try_clone_stream()?, path);
        info!(socket = %path.display(), "Warm connection established");
        Ok(Self {
            handle,
            reader,
            path: path.to_path_buf(),
            last_used: Instant::now(),
        })
    }

    fn discard_reason(&self, path: &Path, idle_limit: Duration) -> Option<&'static str> {
        if self.path != path {
            Some("socket path changed")
        } else if self.last_used.elapsed() > idle_limit {
            Some("idle")
        } else if self.handle.is_stale() {
            Some("closed by peer")
        } else {
            None
        }
    }

    fn exchange(&mut self, request: &WorkerRequest, idle: Duration) -> Result<WorkerFrame, EmbedError> {
        let WarmConnection {
            handle,
            reader,
            path,
            last_used,
        } = self;
        reader.set_idle_timeout(idle)?;
        let line = encode_request(request)?;
        write_request(handle.stream(), path, &line)?;
        handle.touch();
        let frame = read_terminal(reader, idle, request.request_id(), || handle.touch())?;
        *last_used = Instant::now();
        Ok(frame)
    }
}

/// Read frames until a terminal one arrives.
///
/// Heartbeats restart the idle timer. Frames tagged with some other
/// request's id are skipped.
pub(crate) fn read_terminal(
    reader: &mut FrameReader,
    idle: Duration,
    expected_id: Option<&str>,
    mut on_progress: impl FnMut(),
) -> Result<WorkerFrame, EmbedError> {
    loop {
        let frame = reader.read_frame(idle)?;
        on_progress();
        if let WorkerFrame::Heartbeat { text_length, .. } = &frame {
            debug!(text_length = ?text_length, "Worker heartbeat");
            continue;
        }
        if let (Some(expected), Some(got)) = (expected_id, frame.request_id())
            && expected != got
        {
            warn!(expected, got, "Skipping response for a different request");
            continue;
        }
        return frame.into_result();
    }
}

/// Owns every connection to the worker socket.
pub struct ConnectionManager {
    socket_path: RwLock<PathBuf>,
    options: ConnectionOptions,
    tracker: Arc<ResourceTracker>,
    warm: Mutex<Option<WarmConnection>>,
    persistent: Mutex<Option<Arc<PersistentConnection>>>,
    reconnect_hook: RwLock<Option<ReconnectHook>>,
    request_seq: AtomicU64,
    closed: AtomicBool,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("socket_path", &*self.socket_path.read())
            .field("options", &self.options)
            .field("tracked", &self.tracker.count())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(socket_path: PathBuf, options: ConnectionOptions, tracker: Arc<ResourceTracker>) -> Self {
        Self {
            socket_path: RwLock::new(socket_path),
            options,
            tracker,
            warm: Mutex::new(None),
            persistent: Mutex::new(None),
            reconnect_hook: RwLock::new(None),
            request_seq: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.read().clone()
    }

    /// Point at a new socket. Long-lived connections to the old path are dropped.
    pub fn set_socket_path(&self, path: PathBuf) {
        let mut current = self.socket_path.write();
        if *current != path {
            info!(old = %current.display(), new = %path.display(), "Worker socket path changed");
            *current = path;
            drop(current);
            self.disconnect();
        }
    }

    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.tracker
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn set_reconnect_hook(&self, hook: ReconnectHook) {
        *self.reconnect_hook.write() = Some(hook);
    }

    pub fn clear_reconnect_hook(&self) {
        *self.reconnect_hook.write() = None;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn has_warm_connection(&self) -> bool {
        self.warm.lock().is_some()
    }

    /// Send one request and wait for its terminal response.
    ///
    /// `idle` bounds the silence between frames, not the whole call.
    pub fn send(&self, request: &WorkerRequest, idle: Duration, route: Route) -> Result<Exchange, EmbedError> {
        if self.is_closed() {
            return Err(EmbedError::ShutDown);
        }
        let request = match request {
            WorkerRequest::Embed { request_id: None, .. } => {
                let seq = self.request_seq.fetch_add(1, Ordering::Relaxed);
                request.with_request_id(format!("{}-{seq}", std::process::id()))
            }
            other => other.clone(),
        };
        let path = self.socket_path();
        let started = Instant::now();

        if route == Route::Preferred {
            if self.options.warm {
                match self.send_warm(&path, &request, idle) {
                    Ok(frame) => return Ok(self.finish(frame, Strategy::Warm, started)),
                    Err(Attempt::Failed(err)) => return Err(err),
                    Err(Attempt::Unavailable(err)) => {
                        debug!(error = %err, "Warm connection unavailable");
                    }
                }
            }
            if self.options.persistent && matches!(request, WorkerRequest::Embed { .. }) {
                match self.send_persistent(&path, &request, idle) {
                    Ok(frame) => return Ok(self.finish(frame, Strategy::Persistent, started)),
                    Err(Attempt::Failed(err)) => return Err(err),
                    Err(Attempt::Unavailable(err)) => {
                        debug!(error = %err, "Persistent connection unavailable");
                    }
                }
            }
        }

        let frame = self.send_direct(&path, &request, idle)?;
        Ok(self.finish(frame, Strategy::Direct, started))
    }

    fn finish(&self, frame: WorkerFrame, strategy: Strategy, started: Instant) -> Exchange {
        let elapsed = started.elapsed();
        debug!(
            strategy = strategy.as_str(),
            elapsed_ms = elapsed.as_millis() as u64,
            "Worker exchange complete"
        );
        Exchange {
            frame,
            strategy,
            elapsed,
        }
    }

    fn send_warm(&self, path: &Path, request: &WorkerRequest, idle: Duration) -> Result<WorkerFrame, Attempt> {
        let mut slot = self.warm.lock();
        if let Some(reason) = slot
            .as_ref()
            .and_then(|conn| conn.discard_reason(path, self.options.warm_idle_timeout))
        {
            debug!(reason, "Discarding warm connection");
            *slot = None;
        }
        if slot.is_none() {
            let conn = WarmConnection::open(path, &self.tracker, self.options.write_timeout)
                .map_err(Attempt::Unavailable)?;
            // Backlog goes first: the hook runs before anyone else can use the new connection.
            self.run_reconnect_hook();
            *slot = Some(conn);
        }
        let Some(conn) = slot.as_mut() else {
            return Err(Attempt::Unavailable(EmbedError::connection_lost(path)));
        };
        match conn.exchange(request, idle) {
            Ok(frame) => Ok(frame),
            Err(err) => {
                debug!(error = %err, "Warm exchange failed, discarding connection");
                *slot = None;
                Err(Attempt::Failed(err))
            }
        }
    }

    fn send_persistent(
        &self,
        path: &Path,
        request: &WorkerRequest,
        idle: Duration,
    ) -> Result<WorkerFrame, Attempt> {
        let conn = {
            let mut slot = self.persistent.lock();
            if let Some(existing) = slot.as_ref()
                && (!existing.is_alive() || existing.socket_path() != path)
            {
                existing.close();
                *slot = None;
            }
            match slot.as_ref() {
                Some(existing) => Arc::clone(existing),
                None => {
                    let conn = PersistentConnection::connect(path, &self.tracker, self.options.write_timeout)
                        .map_err(Attempt::Unavailable)?;
                    self.run_reconnect_hook();
                    *slot = Some(Arc::clone(&conn));
                    conn
                }
            }
        };
        conn.request(request, idle).map_err(Attempt::Failed)
    }

    fn send_direct(&self, path: &Path, request: &WorkerRequest, idle: Duration) -> Result<WorkerFrame, EmbedError> {
        let mut handle = SocketHandle::connect(path, "direct", &self.tracker)?;
        let result = self.direct_exchange(&mut handle, path, request, idle);
        handle.close();
        result
    }

    fn direct_exchange(
        &self,
        handle: &mut SocketHandle,
        path: &Path,
        request: &WorkerRequest,
        idle: Duration,
    ) -> Result<WorkerFrame, EmbedError> {
        handle.set_timeouts(idle, self.options.write_timeout)?;
        let mut reader = FrameReader::new(handle.try_clone_stream()?, path);
        let line = encode_request(request)?;
        write_request(handle.stream(), path, &line)?;
        let id = handle.id();
        let tracker = &self.tracker;
        read_terminal(&mut reader, idle, request.request_id(), || tracker.touch(id))
    }

    fn run_reconnect_hook(&self) {
        let hook = self.reconnect_hook.read().clone();
        if let Some(hook) = hook {
            hook(self);
        }
    }

    /// One health probe on a fresh connection; any non-error answer is healthy.
    pub fn probe_health(&self, timeout: Duration) -> Result<WorkerFrame, EmbedError> {
        if self.is_closed() {
            return Err(EmbedError::ShutDown);
        }
        let path = self.socket_path();
        self.send_direct(&path, &WorkerRequest::Health, timeout)
    }

    /// Whether anything is accepting connections on the socket right now.
    pub fn is_listening(&self) -> bool {
        let path = self.socket_path();
        match SocketHandle::connect(&path, "liveness", &self.tracker) {
            Ok(mut handle) => {
                handle.close();
                true
            }
            Err(_) => false,
        }
    }

    /// Drop the warm and persistent connections without closing the manager.
    pub fn disconnect(&self) {
        if self.warm.lock().take().is_some() {
            debug!("Warm connection dropped");
        }
        if let Some(conn) = self.persistent.lock().take() {
            conn.close();
        }
    }

    /// Close every connection; further sends fail with [`EmbedError::ShutDown`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnect();
        self.clear_reconnect_hook();
        if self.tracker.count() > 0 {
            warn!(tracked = self.tracker.count(), "Sockets still tracked at close");
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}
