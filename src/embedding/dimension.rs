//! Target-dimension negotiation and vector resampling.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{debug, warn};

use crate::worker::error::EmbedError;

/// Where the expected vector dimension comes from (normally the vector store).
pub trait DimensionSource: Send + Sync {
    /// `Ok(None)` when the store does not know yet.
    fn target_dimension(&self) -> anyhow::Result<Option<usize>>;
}

impl<F> DimensionSource for F
where
    F: Fn() -> anyhow::Result<Option<usize>> + Send + Sync,
{
    fn target_dimension(&self) -> anyhow::Result<Option<usize>> {
        self()
    }
}

/// A dimension that never changes.
#[derive(Debug, Clone, Copy)]
pub struct FixedDimension(pub usize);

impl DimensionSource for FixedDimension {
    fn target_dimension(&self) -> anyhow::Result<Option<usize>> {
        Ok((self.0 > 0).then_some(self.0))
    }
}

/// Caches the storage layer's dimension and conforms worker output to it.
pub struct DimensionNegotiator {
    source: Option<Arc<dyn DimensionSource>>,
    /// 0 means unknown.
    cached: AtomicUsize,
}

impl fmt::Debug for DimensionNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DimensionNegotiator")
            .field("has_source", &self.source.is_some())
            .field("cached", &self.cached.load(Ordering::Relaxed))
            .finish()
    }
}

impl DimensionNegotiator {
    pub fn new(source: Option<Arc<dyn DimensionSource>>) -> Self {
        Self {
            source,
            cached: AtomicUsize::new(0),
        }
    }

    /// Known target dimension, querying the source on first use. Returns 0
    /// when unknown; unknown results are not cached.
    pub fn ensure_target_dimension(&self) -> usize {
        let cached = self.cached.load(Ordering::Acquire);
        if cached > 0 {
            return cached;
        }
        let Some(source) = &self.source else {
            return 0;
        };
        match source.target_dimension() {
            Ok(Some(dim)) if dim > 0 => {
                debug!(dimension = dim, "Learned target embedding dimension");
                self.cached.store(dim, Ordering::Release);
                dim
            }
            Ok(_) => 0,
            Err(err) => {
                warn!(error = %err, "Target dimension lookup failed");
                0
            }
        }
    }

    pub fn cached(&self) -> Option<usize> {
        match self.cached.load(Ordering::Acquire) {
            0 => None,
            dim => Some(dim),
        }
    }

    /// Forget the cached dimension; the next call re-queries the source.
    pub fn invalidate(&self) {
        self.cached.store(0, Ordering::Release);
    }

    /// Validate a worker vector, resample it to the target dimension, and
    /// normalize it to unit length.
    pub fn conform(&self, vector: Vec<f64>) -> Result<Vec<f64>, EmbedError> {
        if vector.is_empty() {
            return Err(EmbedError::Dimension("worker returned an empty vector".into()));
        }
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(EmbedError::Dimension(
                "worker returned a vector with non-finite values".into(),
            ));
        }
        let target = match self.ensure_target_dimension() {
            0 => vector.len(),
            dim => dim,
        };
        if target != vector.len() {
            debug!(from = vector.len(), to = target, "Rescaling embedding");
        }
        let mut out = scale(&vector, target);
        if !normalize(&mut out) {
            return Err(EmbedError::Dimension("embedding has zero norm".into()));
        }
        Ok(out)
    }
}

/// Resample `vector` to `target` components.
///
/// Equal length is a no-op. Shrinking averages proportional slices; growing
/// interpolates linearly between neighbours. Resampled output is
/// normalized to unit length.
pub fn scale(vector: &[f64], target: usize) -> Vec<f64> {
    let src = vector.len();
    if target == src {
        return vector.to_vec();
    }
    if target == 0 || src == 0 {
        return vec![0.0; target];
    }
    let mut out = if target < src {
        let ratio = src as f64 / target as f64;
        (0..target)
            .map(|i| {
                let start = ((i as f64 * ratio).floor() as usize).min(src - 1);
                let end = (((i + 1) as f64 * ratio).floor() as usize).clamp(start + 1, src);
                let slice = &vector[start..end];
                slice.iter().sum::<f64>() / slice.len() as f64
            })
            .collect::<Vec<_>>()
    } else if src == 1 {
        vec![vector[0]; target]
    } else {
        let step = (src - 1) as f64 / (target - 1) as f64;
        (0..target)
            .map(|i| {
                let pos = i as f64 * step;
                let lo = (pos.floor() as usize).min(src - 1);
                let hi = (lo + 1).min(src - 1);
                let frac = pos - lo as f64;
                vector[lo] * (1.0 - frac) + vector[hi] * frac
            })
            .collect::<Vec<_>>()
    };
    normalize(&mut out);
    out
}

/// Scale to unit L2 norm in place. Returns false (leaving the input alone)
/// for a zero or non-finite norm.
pub fn normalize(vector: &mut [f64]) -> bool {
    let norm = vector.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm == 0.0 || !norm.is_finite() {
        return false;
    }
    for x in vector.iter_mut() {
        *x /= norm;
    }
    true
}

pub fn l2_norm(vector: &[f64]) -> f64 {
    vector.iter().map(|x| x * x).sum::<f64>().sqrt()
}
