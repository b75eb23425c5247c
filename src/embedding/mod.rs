//! Embedding generation on top of the worker client: dimension negotiation,
//! batching, the overflow queue, and the [`EmbeddingClient`] façade.

pub mod batch;
pub mod client;
pub mod dimension;
pub mod queue;

pub use batch::{BatchHandler, BatchPolicy, BatchTransport};
pub use client::{EmbeddingClient, EmbeddingClientBuilder, EmbeddingOutcome, WorkerDimensions};
pub use dimension::{DimensionNegotiator, DimensionSource, FixedDimension};
pub use queue::{ItemStatus, OverflowQueue, PendingEmbedding, QueueItem, QueueResult, QueueStats, QueueStore};
