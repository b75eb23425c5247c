//! The embedding client façade.
//!
//! [`EmbeddingClient`] composes the connection manager, supervisor,
//! adaptive timeout, retry policy, dimension negotiator, batch handler and
//! overflow queue. It is the only place that decides between failing loudly
//! and queueing: a vector handed to a caller always came from the worker.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::batch::{BatchHandler, BatchTransport};
use super::dimension::{DimensionNegotiator, DimensionSource};
use super::queue::{OverflowQueue, PendingEmbedding, QueueStore};
use crate::config::EmbeddingClientConfig;
use crate::storage::sqlite::SqliteQueueStore;
use crate::worker::connection::{ConnectionManager, Route};
use crate::worker::error::EmbedError;
use crate::worker::launcher::{ContainerLauncher, NativeLauncher, WorkerLauncher};
use crate::worker::protocol::{WorkerFrame, WorkerRequest};
use crate::worker::resource::ResourceTracker;
use crate::worker::supervisor::{Supervisor, WorkerState};
use crate::worker::timeout::AdaptiveTimeout;

/// Result of [`EmbeddingClient::generate_embedding`].
#[derive(Debug)]
pub enum EmbeddingOutcome {
    /// Conformed, unit-length vector from the worker.
    Ready(Vec<f64>),
    /// The worker was unreachable; a later drain resolves this handle.
    Queued(PendingEmbedding),
}

impl EmbeddingOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, EmbeddingOutcome::Queued(_))
    }

    pub fn into_ready(self) -> Option<Vec<f64>> {
        match self {
            EmbeddingOutcome::Ready(vector) => Some(vector),
            EmbeddingOutcome::Queued(_) => None,
        }
    }

    /// Block until a vector is available or `timeout` passes.
    pub fn wait(self, timeout: Duration) -> Option<Result<Vec<f64>, EmbedError>> {
        match self {
            EmbeddingOutcome::Ready(vector) => Some(Ok(vector)),
            EmbeddingOutcome::Queued(pending) => pending.wait(timeout),
        }
    }
}

/// Dimensions reported by the worker's `get_dimension` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerDimensions {
    pub native: Option<usize>,
    pub target: Option<usize>,
}

enum QueueChoice {
    FromConfig,
    Store(Box<dyn QueueStore>),
    Disabled,
}

/// Builder for [`EmbeddingClient`] with injectable collaborators.
pub struct EmbeddingClientBuilder {
    config: EmbeddingClientConfig,
    dimension_source: Option<Arc<dyn DimensionSource>>,
    queue: QueueChoice,
    launchers: Option<Vec<Box<dyn WorkerLauncher>>>,
}

impl EmbeddingClientBuilder {
    pub fn new(config: EmbeddingClientConfig) -> Self {
        Self {
            config,
            dimension_source: None,
            queue: QueueChoice::FromConfig,
            launchers: None,
        }
    }

    /// Where the target dimension comes from; without one, worker output
    /// keeps its native length.
    pub fn dimension_source(mut self, source: Arc<dyn DimensionSource>) -> Self {
        self.dimension_source = Some(source);
        self
    }

    pub fn queue_store(mut self, store: Box<dyn QueueStore>) -> Self {
        self.queue = QueueChoice::Store(store);
        self
    }

    /// Fail loudly instead of queueing when the worker is unreachable.
    pub fn without_queue(mut self) -> Self {
        self.queue = QueueChoice::Disabled;
        self
    }

    /// Replace the discovered native and container launchers.
    pub fn launchers(mut self, launchers: Vec<Box<dyn WorkerLauncher>>) -> Self {
        self.launchers = Some(launchers);
        self
    }

    pub fn build(self) -> Result<EmbeddingClient, EmbedError> {
        let config = self.config;

        let queue = match self.queue {
            QueueChoice::Disabled => None,
            QueueChoice::Store(store) => Some(OverflowQueue::new(store, config.queue_max_attempts)),
            QueueChoice::FromConfig => match &config.queue_db {
                Some(path) => Some(OverflowQueue::new(
                    Box::new(SqliteQueueStore::open(path)?),
                    config.queue_max_attempts,
                )),
                None => None,
            },
        };

        let launchers = self.launchers.unwrap_or_else(|| default_launchers(&config));

        let tracker = Arc::new(ResourceTracker::new(
            config.socket_max_age,
            config.socket_sweep_interval,
        ));
        tracker.start_sweeper();
        let connections = Arc::new(ConnectionManager::new(
            config.socket_path.clone(),
            config.connection.clone(),
            Arc::clone(&tracker),
        ));
        let supervisor = Supervisor::new(
            config.supervisor.clone(),
            config.worker_paths(),
            launchers,
            Arc::clone(&connections),
        );

        let inner = Arc::new(ClientInner {
            timeout: AdaptiveTimeout::new(config.timeouts),
            dimensions: DimensionNegotiator::new(self.dimension_source),
            batch: BatchHandler::new(config.batch),
            connections,
            supervisor,
            queue,
            tracker,
            shut_down: AtomicBool::new(false),
            config,
        });

        let weak: Weak<ClientInner> = Arc::downgrade(&inner);
        inner.connections.set_reconnect_hook(Arc::new(move |_: &ConnectionManager| {
            if let Some(inner) = weak.upgrade() {
                inner.drain_queue();
            }
        }));

        info!(
            socket = %inner.config.socket_path.display(),
            queue = inner.queue.is_some(),
            warm = inner.config.connection.warm,
            persistent = inner.config.connection.persistent,
            "Embedding client ready"
        );

        if inner.config.autostart {
            match inner.supervisor.start() {
                Ok(()) => {
                    inner.drain_queue();
                }
                Err(err) => warn!(error = %err, "Worker autostart failed"),
            }
        }

        Ok(EmbeddingClient { inner })
    }
}

fn default_launchers(config: &EmbeddingClientConfig) -> Vec<Box<dyn WorkerLauncher>> {
    vec![
        Box::new(NativeLauncher::discover(
            config.worker_script.as_deref(),
            &config.worker_search_paths,
        )),
        Box::new(ContainerLauncher::discover(
            config.container_runtime.as_deref(),
            config.worker_image.as_deref(),
            &config.project_hash,
        )),
    ]
}

struct ClientInner {
    config: EmbeddingClientConfig,
    connections: Arc<ConnectionManager>,
    supervisor: Supervisor,
    timeout: AdaptiveTimeout,
    dimensions: DimensionNegotiator,
    batch: BatchHandler,
    queue: Option<OverflowQueue>,
    tracker: Arc<ResourceTracker>,
    shut_down: AtomicBool,
}

impl ClientInner {
    fn ensure_open(&self) -> Result<(), EmbedError> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(EmbedError::ShutDown);
        }
        Ok(())
    }

    fn call_timeout(&self, cap: Option<Duration>) -> Duration {
        let adaptive = self.timeout.get_timeout();
        match cap {
            Some(cap) => adaptive.min(cap),
            None => adaptive,
        }
    }

    /// One request on the given route. Successes feed the adaptive timeout
    /// and the supervisor's failure counter.
    fn attempt(
        &self,
        text: &str,
        route: Route,
        cap: Option<Duration>,
        may_start: bool,
    ) -> Result<Vec<f64>, EmbedError> {
        let idle = self.call_timeout(cap);
        match self.connections.send(&WorkerRequest::embed(text), idle, route) {
            Ok(exchange) => {
                self.timeout.record(exchange.elapsed);
                self.supervisor.record_success();
                self.dimensions.conform(expect_embedding(exchange.frame)?)
            }
            Err(err) => {
                self.supervisor.record_failure();
                if err.is_idle_timeout() {
                    debug!(idle_ms = idle.as_millis() as u64, "Idle timeout, checking worker health");
                    self.supervisor.check_health();
                } else if may_start
                    && err.is_worker_absent()
                    && self.supervisor.state() == WorkerState::Stopped
                {
                    // First sign of a missing worker: bring one up before the next attempt.
                    self.start_worker()?;
                }
                Err(err)
            }
        }
    }

    fn start_worker(&self) -> Result<(), EmbedError> {
        match self.supervisor.start() {
            Ok(()) => {
                self.drain_queue();
                Ok(())
            }
            Err(err) if is_fatal(&err) => Err(err),
            Err(err) => {
                debug!(error = %err, "Worker start failed, retrying request");
                Ok(())
            }
        }
    }

    /// Retries, then one supervisor recovery and a final direct attempt.
    fn embed_now(&self, text: &str, cap: Option<Duration>) -> Result<Vec<f64>, EmbedError> {
        self.ensure_open()?;
        self.dimensions.ensure_target_dimension();
        let socket = self.connections.socket_path();
        let last = match self.config.retry.run(&socket, |attempt| {
            let route = if attempt == 1 {
                Route::Preferred
            } else {
                Route::DirectOnly
            };
            self.attempt(text, route, cap, attempt == 1)
        }) {
            Ok(vector) => return Ok(vector),
            Err(err) if is_fatal(&err) => return Err(err),
            Err(err) if !err.root().is_retryable() => return Err(err),
            Err(err) => err,
        };

        warn!(error = %last, "Embedding retries exhausted, recovering worker");
        if let Err(err) = self.recover_worker() {
            if is_fatal(&err) {
                return Err(err);
            }
            return Err(EmbedError::WorkerUnavailable {
                socket,
                reason: format!("{last}; recovery failed: {err}"),
            });
        }
        self.attempt(text, Route::DirectOnly, cap, false).map_err(|err| {
            if err.is_retryable() {
                EmbedError::WorkerUnavailable {
                    socket,
                    reason: format!("worker recovered but request failed: {err}"),
                }
            } else {
                err
            }
        })
    }

    fn recover_worker(&self) -> Result<(), EmbedError> {
        let fresh = self.supervisor.state() == WorkerState::Stopped && self.supervisor.restart_count() == 0;
        if fresh {
            self.supervisor.start()?;
        } else {
            self.supervisor.restart()?;
        }
        self.drain_queue();
        Ok(())
    }

    /// Embed through a direct connection for the overflow queue.
    fn embed_for_drain(&self, text: &str) -> Result<Vec<f64>, EmbedError> {
        let idle = self.call_timeout(None);
        let exchange = self
            .connections
            .send(&WorkerRequest::embed(text), idle, Route::DirectOnly)?;
        self.timeout.record(exchange.elapsed);
        self.dimensions.conform(expect_embedding(exchange.frame)?)
    }

    fn drain_queue(&self) -> usize {
        let Some(queue) = &self.queue else {
            return 0;
        };
        match queue.drain(|text| self.embed_for_drain(text)) {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "Overflow queue drain failed");
                0
            }
        }
    }
}

impl BatchTransport for ClientInner {
    fn send_batch(&self, texts: &[String], timeout: Duration) -> Result<Vec<Vec<f64>>, EmbedError> {
        let request = WorkerRequest::Batch {
            texts: texts.to_vec(),
        };
        let exchange = self.connections.send(&request, timeout, Route::Preferred)?;
        match exchange.frame {
            WorkerFrame::Batch { vectors } => vectors
                .into_iter()
                .map(|vector| self.dimensions.conform(vector))
                .collect(),
            other => Err(EmbedError::Protocol(format!(
                "expected batch embeddings, got {other:?}"
            ))),
        }
    }

    fn embed_one(&self, text: &str) -> Result<Vec<f64>, EmbedError> {
        self.embed_now(text, None)
    }
}

fn expect_embedding(frame: WorkerFrame) -> Result<Vec<f64>, EmbedError> {
    match frame {
        WorkerFrame::Embedding { vector, .. } => Ok(vector),
        other => Err(EmbedError::Protocol(format!("expected an embedding, got {other:?}"))),
    }
}

/// Conditions that must reach the caller even when a queue is configured.
fn is_fatal(err: &EmbedError) -> bool {
    matches!(
        err.root(),
        EmbedError::StartupFatal(_) | EmbedError::RestartsExhausted { .. } | EmbedError::ShutDown
    )
}

fn parse_dimension(body: &serde_json::Map<String, Value>, key: &str) -> Option<usize> {
    body.get(key)
        .and_then(Value::as_u64)
        .and_then(|n| usize::try_from(n).ok())
}

/// Resilient client for the local embedding worker.
pub struct EmbeddingClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for EmbeddingClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingClient")
            .field("socket", &self.inner.config.socket_path)
            .field("state", &self.inner.supervisor.state())
            .field("queue", &self.inner.queue)
            .field("shut_down", &self.inner.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl EmbeddingClient {
    pub fn new(config: EmbeddingClientConfig) -> Result<Self, EmbedError> {
        EmbeddingClientBuilder::new(config).build()
    }

    pub fn builder(config: EmbeddingClientConfig) -> EmbeddingClientBuilder {
        EmbeddingClientBuilder::new(config)
    }

    /// Embed `text`, queueing it if the worker cannot be reached.
    ///
    /// Without a queue an unreachable worker yields
    /// [`EmbedError::WorkerUnavailable`]. Fatal startup conditions and an
    /// exhausted restart budget are always returned as errors.
    pub fn generate_embedding(&self, text: &str) -> Result<EmbeddingOutcome, EmbedError> {
        let inner = &self.inner;
        match inner.embed_now(text, None) {
            Ok(vector) => Ok(EmbeddingOutcome::Ready(vector)),
            Err(err) if is_fatal(&err) => Err(err),
            Err(err @ EmbedError::WorkerUnavailable { .. }) => match &inner.queue {
                Some(queue) => {
                    info!(error = %err, "Worker unavailable, queueing embedding request");
                    Ok(EmbeddingOutcome::Queued(queue.enqueue(text)?))
                }
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    /// Embed a search query. Bounded by the search timeout and never queued.
    pub fn generate_search_embedding(&self, query: &str) -> Result<Vec<f64>, EmbedError> {
        self.inner
            .embed_now(query, Some(self.inner.config.search_timeout))
    }

    /// Embed several texts in one request where possible, in input order.
    pub fn generate_embeddings_batch(&self, texts: &[String]) -> Result<Vec<Vec<f64>>, EmbedError> {
        self.inner.ensure_open()?;
        self.inner.dimensions.ensure_target_dimension();
        self.inner.batch.embed_batch(self.inner.as_ref(), texts)
    }

    /// Ask the worker for its native and target dimensions.
    pub fn worker_dimensions(&self) -> Result<WorkerDimensions, EmbedError> {
        self.inner.ensure_open()?;
        let exchange = self.inner.connections.send(
            &WorkerRequest::GetDimension,
            self.inner.config.supervisor.health_timeout,
            Route::DirectOnly,
        )?;
        match exchange.frame {
            WorkerFrame::Ack { body, .. } => Ok(WorkerDimensions {
                native: parse_dimension(&body, "native_dimensions"),
                target: parse_dimension(&body, "target_dimensions"),
            }),
            other => Err(EmbedError::Protocol(format!(
                "unexpected reply to get_dimension: {other:?}"
            ))),
        }
    }

    /// Drain the overflow queue now. Returns the number of items completed.
    pub fn drain_queue(&self) -> Result<usize, EmbedError> {
        self.inner.ensure_open()?;
        Ok(self.inner.drain_queue())
    }

    pub fn config(&self) -> &EmbeddingClientConfig {
        &self.inner.config
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.inner.supervisor
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    pub fn queue(&self) -> Option<&OverflowQueue> {
        self.inner.queue.as_ref()
    }

    pub fn dimensions(&self) -> &DimensionNegotiator {
        &self.inner.dimensions
    }

    pub fn adaptive_timeout(&self) -> &AdaptiveTimeout {
        &self.inner.timeout
    }

    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.inner.tracker
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Stop the worker this client spawned and close every connection. Idempotent.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        inner.connections.clear_reconnect_hook();
        inner.supervisor.shutdown();
        inner.connections.close();
        inner.tracker.stop_sweeper();
        info!("Embedding client shut down");
    }
}

impl Drop for EmbeddingClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn offline_config(dir: &Path) -> EmbeddingClientConfig {
        let mut config = EmbeddingClientConfig::for_project(dir.join("project"), dir);
        config.retry.initial_delay = Duration::from_millis(1);
        config.retry.max_delay = Duration::from_millis(5);
        config.supervisor.health_timeout = Duration::from_millis(200);
        config.supervisor.startup_timeout = Duration::from_millis(200);
        config
    }

    #[test]
    fn no_launcher_is_a_fatal_error_even_with_a_queue() {
        let dir = tempfile::tempdir().unwrap();
        let client = EmbeddingClient::builder(offline_config(dir.path()))
            .queue_store(Box::new(SqliteQueueStore::open_in_memory().unwrap()))
            .launchers(Vec::new())
            .build()
            .unwrap();
        let err = client.generate_embedding("hello").unwrap_err();
        assert!(matches!(err, EmbedError::StartupFatal(_)), "got {err:?}");
        assert_eq!(client.queue().unwrap().pending_count().unwrap(), 0);
        assert!(client.supervisor().fatal_error().is_some());
    }

    #[test]
    fn shutdown_is_idempotent_and_rejects_new_calls() {
        let dir = tempfile::tempdir().unwrap();
        let client = EmbeddingClient::builder(offline_config(dir.path()))
            .without_queue()
            .launchers(Vec::new())
            .build()
            .unwrap();
        client.shutdown();
        client.shutdown();
        assert!(client.is_shut_down());
        assert!(matches!(
            client.generate_embedding("x"),
            Err(EmbedError::ShutDown)
        ));
        assert!(matches!(
            client.generate_embeddings_batch(&["a".into(), "b".into()]),
            Err(EmbedError::ShutDown)
        ));
    }

    #[test]
    fn empty_batch_needs_no_worker() {
        let dir = tempfile::tempdir().unwrap();
        let client = EmbeddingClient::builder(offline_config(dir.path()))
            .without_queue()
            .launchers(Vec::new())
            .build()
            .unwrap();
        assert!(client.generate_embeddings_batch(&[]).unwrap().is_empty());
    }

    #[test]
    fn queue_path_comes_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = offline_config(dir.path());
        let db = config.queue_db.clone().unwrap();
        let client = EmbeddingClient::builder(config)
            .launchers(Vec::new())
            .build()
            .unwrap();
        assert!(client.queue().is_some());
        assert!(db.exists());
    }

    #[test]
    fn outcome_helpers() {
        let ready = EmbeddingOutcome::Ready(vec![1.0]);
        assert!(!ready.is_queued());
        assert_eq!(ready.into_ready(), Some(vec![1.0]));
    }
}
