//! Client side of the embedding worker.
//!
//! The worker is a separate process that turns text into vectors. This
//! module owns everything about reaching it:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  ConnectionManager                                           │
//! │    warm (mutex) ─▶ persistent (requestId map) ─▶ direct      │
//! │         │                  │                       │         │
//! │         └──────── SocketHandle ◀── ResourceTracker ┘         │
//! ├──────────────────────────────────────────────────────────────┤
//! │  Supervisor                                                  │
//! │    AdvisoryLock + PidFile ─▶ WorkerLauncher (native/container)│
//! ├──────────────────────────────────────────────────────────────┤
//! │  RetryPolicy · AdaptiveTimeout                               │
//! └──────────────────────────────────────────────────────────────┘
//!                  │ line-delimited JSON over a Unix socket
//!                  ▼
//!          embedding worker process
//! ```

pub mod connection;
pub mod error;
pub mod launcher;
pub mod lock;
pub mod persistent;
pub mod protocol;
pub mod resource;
pub mod retry;
pub mod supervisor;
pub mod timeout;

pub use connection::{ConnectionManager, ConnectionOptions, Exchange, Route, Strategy};
pub use error::{EmbedError, QueueError, TransportKind};
pub use launcher::{ContainerLauncher, LaunchSpec, NativeLauncher, WorkerLauncher, WorkerProcess};
pub use lock::{AdvisoryLock, PidFile, PidRecord};
pub use protocol::{WorkerFrame, WorkerRequest};
pub use resource::{ResourceTracker, SocketHandle, SocketState};
pub use retry::RetryPolicy;
pub use supervisor::{Supervisor, SupervisorConfig, WorkerPaths, WorkerProcessState, WorkerState};
pub use timeout::{AdaptiveTimeout, TimeoutBounds};
