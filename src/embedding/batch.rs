//! Multi-text embedding requests with a sequential fallback.

use std::time::Duration;

use tracing::{debug, warn};

use crate::worker::error::EmbedError;

/// Largest number of texts sent in one request.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub per_item_timeout: Duration,
    pub max_timeout: Duration,
    pub max_batch_size: usize,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            per_item_timeout: Duration::from_secs(60),
            max_timeout: Duration::from_secs(300),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

impl BatchPolicy {
    /// `per_item_timeout * ceil(n / 10)`, capped at `max_timeout`.
    pub fn timeout_for(&self, n: usize) -> Duration {
        let groups = n.div_ceil(10).max(1);
        let groups = u32::try_from(groups).unwrap_or(u32::MAX);
        self.per_item_timeout
            .saturating_mul(groups)
            .min(self.max_timeout)
    }
}

/// What the batch handler needs from the client.
pub trait BatchTransport {
    /// One `{"texts":[...]}` round trip; vectors come back conformed and in order.
    fn send_batch(&self, texts: &[String], timeout: Duration) -> Result<Vec<Vec<f64>>, EmbedError>;

    /// The scalar path, used for single texts and as the fallback.
    fn embed_one(&self, text: &str) -> Result<Vec<f64>, EmbedError>;
}

#[derive(Debug, Clone, Default)]
pub struct BatchHandler {
    policy: BatchPolicy,
}

impl BatchHandler {
    pub fn new(policy: BatchPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &BatchPolicy {
        &self.policy
    }

    /// Embed `texts`, preserving order.
    pub fn embed_batch<T>(&self, transport: &T, texts: &[String]) -> Result<Vec<Vec<f64>>, EmbedError>
    where
        T: BatchTransport + ?Sized,
    {
        match texts {
            [] => return Ok(Vec::new()),
            [single] => return Ok(vec![transport.embed_one(single)?]),
            _ => {}
        }
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.policy.max_batch_size.max(1)) {
            out.extend(self.embed_chunk(transport, chunk)?);
        }
        Ok(out)
    }

    fn embed_chunk<T>(&self, transport: &T, chunk: &[String]) -> Result<Vec<Vec<f64>>, EmbedError>
    where
        T: BatchTransport + ?Sized,
    {
        if let [single] = chunk {
            return Ok(vec![transport.embed_one(single)?]);
        }
        let timeout = self.policy.timeout_for(chunk.len());
        let failure = match transport.send_batch(chunk, timeout) {
            Ok(vectors) if vectors.len() == chunk.len() => {
                debug!(count = chunk.len(), "Batch embedding complete");
                return Ok(vectors);
            }
            Ok(vectors) => format!(
                "worker returned {} embeddings for {} texts",
                vectors.len(),
                chunk.len()
            ),
            Err(err) => err.to_string(),
        };
        warn!(
            count = chunk.len(),
            error = %failure,
            "Batch embedding failed, falling back to sequential requests"
        );
        chunk.iter().map(|text| transport.embed_one(text)).collect()
    }
}
