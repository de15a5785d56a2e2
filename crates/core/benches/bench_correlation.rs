//! Correlation table routing throughput
//!
//! Measures how fast the dispatcher path can attribute responses when many
//! requests are interleaved on one stream.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use remotemedia_decoupled::client::{CorrelationTable, RouteOutcome};
use remotemedia_decoupled::data::{InferResponse, Tensor};

const CHUNKS_PER_REQUEST: u64 = 16;

/// Responses for `requests` requests, round-robin interleaved
fn interleaved(requests: usize) -> Vec<InferResponse> {
    let payload = Tensor::from_bytes("OUTPUT0", vec![0u8; 64]);
    let mut responses = Vec::with_capacity(requests * (CHUNKS_PER_REQUEST as usize + 1));
    for seq in 0..CHUNKS_PER_REQUEST {
        for r in 0..requests {
            responses.push(InferResponse::chunk(
                format!("req{}", r),
                "nvdec",
                seq,
                vec![payload.clone()],
            ));
        }
    }
    for r in 0..requests {
        responses.push(InferResponse::final_marker(
            format!("req{}", r),
            "nvdec",
            CHUNKS_PER_REQUEST,
        ));
    }
    responses
}

fn bench_route(c: &mut Criterion) {
    let mut group = c.benchmark_group("correlation_route");

    for requests in [1usize, 16, 256] {
        let responses = interleaved(requests);
        group.throughput(Throughput::Elements(responses.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(requests),
            &responses,
            |b, responses| {
                b.iter(|| {
                    let mut table = CorrelationTable::new();
                    for r in 0..requests {
                        table.register(&format!("req{}", r)).unwrap();
                    }
                    for response in responses.iter().cloned() {
                        let outcome = table.route(response);
                        debug_assert!(!matches!(
                            outcome,
                            RouteOutcome::Violation(_) | RouteOutcome::OutOfSequence { .. }
                        ));
                        black_box(outcome);
                    }
                    for r in 0..requests {
                        black_box(table.take_finished(&format!("req{}", r)));
                    }
                })
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_route);
criterion_main!(benches);
