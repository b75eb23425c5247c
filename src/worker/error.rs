//! Error taxonomy for talking to the embedding worker.
//!
//! Every component returns [`EmbedError`]; the retry controller consults
//! [`EmbedError::is_retryable`] and the façade decides between failing
//! loudly and handing the request to the overflow queue.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Transport failure classes that are worth retrying on a fresh connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Peer reset or closed the connection (includes EOF mid-response).
    Reset,
    /// Nothing is listening on the socket.
    Refused,
    /// Write to a socket the peer already closed.
    BrokenPipe,
    /// The socket file does not exist.
    MissingSocket,
    /// Anything else the OS reported.
    Other,
}

impl TransportKind {
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected => TransportKind::Reset,
            io::ErrorKind::ConnectionRefused => TransportKind::Refused,
            io::ErrorKind::BrokenPipe => TransportKind::BrokenPipe,
            io::ErrorKind::NotFound => TransportKind::MissingSocket,
            _ => TransportKind::Other,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Reset => "connection reset",
            TransportKind::Refused => "connection refused",
            TransportKind::BrokenPipe => "broken pipe",
            TransportKind::MissingSocket => "socket file missing",
            TransportKind::Other => "transport failure",
        }
    }
}

/// Errors produced by the embedding client.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("{} on {}: {source}", kind.as_str(), socket.display())]
    Transport {
        socket: PathBuf,
        kind: TransportKind,
        #[source]
        source: io::Error,
    },

    #[error("worker at {} sent nothing for {}ms", socket.display(), idle.as_millis())]
    IdleTimeout { socket: PathBuf, idle: Duration },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("worker reported error: {0}")]
    Worker(String),

    #[error(
        "embedding worker at {} failed after {attempts} attempts: {last}",
        socket.display()
    )]
    RetriesExhausted {
        socket: PathBuf,
        attempts: u32,
        #[source]
        last: Box<EmbedError>,
    },

    #[error("embedding worker unavailable at {}: {reason}", socket.display())]
    WorkerUnavailable { socket: PathBuf, reason: String },

    #[error("embedding worker cannot be started: {0}")]
    StartupFatal(String),

    #[error("worker restart limit reached ({restarts} restarts)")]
    RestartsExhausted { restarts: u32 },

    #[error("request id {0} already has a pending completion")]
    DuplicateRequestId(String),

    #[error("overflow queue: {0}")]
    Queue(#[from] QueueError),

    #[error("dimension error: {0}")]
    Dimension(String),

    #[error("embedding client is shut down")]
    ShutDown,
}

impl EmbedError {
    /// Wrap an I/O error from a socket operation.
    pub fn transport(socket: impl Into<PathBuf>, source: io::Error) -> Self {
        let socket = socket.into();
        if matches!(
            source.kind(),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
        ) {
            // Read/write timeouts on a blocking socket surface as WouldBlock on Linux.
            return EmbedError::IdleTimeout {
                socket,
                idle: Duration::ZERO,
            };
        }
        EmbedError::Transport {
            kind: TransportKind::from_io(&source),
            socket,
            source,
        }
    }

    /// The worker closed the stream before a terminal response arrived.
    pub fn connection_lost(socket: impl Into<PathBuf>) -> Self {
        EmbedError::Transport {
            socket: socket.into(),
            kind: TransportKind::Reset,
            source: io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "worker closed connection before responding",
            ),
        }
    }

    /// Connection-reset, refused, broken-pipe, missing-socket and timeouts are
    /// retryable; protocol errors and worker-reported errors are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            EmbedError::Transport { kind, .. } => *kind != TransportKind::Other,
            EmbedError::IdleTimeout { .. } => true,
            _ => false,
        }
    }

    pub fn is_idle_timeout(&self) -> bool {
        matches!(self, EmbedError::IdleTimeout { .. })
    }

    /// Whether the failure means nothing is serving the socket right now.
    pub fn is_worker_absent(&self) -> bool {
        matches!(
            self,
            EmbedError::Transport {
                kind: TransportKind::Refused | TransportKind::MissingSocket,
                ..
            }
        )
    }

    /// Unwraps `RetriesExhausted` down to the underlying cause.
    pub fn root(&self) -> &EmbedError {
        match self {
            EmbedError::RetriesExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

/// Errors from the overflow queue's durable store.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("result encoding error: {0}")]
    Encoding(String),

    #[error("queue item {0} not found")]
    NotFound(i64),

    #[error("queued embedding {id} abandoned after {attempts} attempts: {last_error}")]
    Abandoned {
        id: i64,
        attempts: u32,
        last_error: String,
    },
}
