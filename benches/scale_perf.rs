use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use semantic_embed_client::embedding::dimension::{DimensionNegotiator, FixedDimension, scale};
use semantic_embed_client::worker::protocol::decode_frame;
use semantic_embed_client::worker::{AdaptiveTimeout, TimeoutBounds};
use std::hint::black_box;
use std::sync::Arc;

fn sample_vector(dim: usize) -> Vec<f64> {
    (0..dim).map(|i| ((i * 31 % 97) as f64 + 1.0) / 97.0).collect()
}

// =============================================================================
// Dimension scaling
// =============================================================================

/// Resample common model widths to a 768-dim store and back.
fn bench_scale(c: &mut Criterion) {
    let mut group = c.benchmark_group("scale");
    for (from, to) in [(384, 768), (1024, 768), (768, 384), (1536, 384)] {
        let vector = sample_vector(from);
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{from}->{to}")),
            &vector,
            |b, v| b.iter(|| black_box(scale(v, to))),
        );
    }
    group.finish();
}

fn bench_conform(c: &mut Criterion) {
    let negotiator = DimensionNegotiator::new(Some(Arc::new(FixedDimension(768))));
    let vector = sample_vector(384);
    c.bench_function("conform_384_to_768", |b| {
        b.iter(|| black_box(negotiator.conform(vector.clone())))
    });
}

// =============================================================================
// Adaptive timeout
// =============================================================================

/// Timeout computation over a full sample window.
fn bench_adaptive_timeout(c: &mut Criterion) {
    let timeout = AdaptiveTimeout::new(TimeoutBounds::default());
    for ms in [800u64, 1200, 950, 3000, 1100, 870, 990, 1500, 2000, 1000] {
        timeout.record_sample(ms);
        timeout.record_sample(ms + 50);
    }
    c.bench_function("adaptive_get_timeout", |b| {
        b.iter(|| black_box(timeout.get_timeout()))
    });
    c.bench_function("adaptive_record_sample", |b| {
        let mut ms = 900u64;
        b.iter(|| {
            ms = 900 + (ms * 7 % 400);
            timeout.record_sample(black_box(ms));
        })
    });
}

// =============================================================================
// Wire decoding
// =============================================================================

fn bench_decode_embedding(c: &mut Criterion) {
    let vector = sample_vector(768);
    let line = serde_json::json!({"embedding": vector, "requestId": "1-1"}).to_string();
    c.bench_function("decode_embedding_768", |b| {
        b.iter(|| black_box(decode_frame(&line)))
    });
}

criterion_group!(
    benches,
    bench_scale,
    bench_conform,
    bench_adaptive_timeout,
    bench_decode_embedding,
);

criterion_main!(benches);
