//! Benchmarks for the span ingest hot path.
//!
//! `on_end` is called synchronously on every span end in instrumented code,
//! so its cost directly taxes the application. The control task and exporter
//! run in the background on the runtime driving the processor.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use otel_pipeline::{
    BatchConfig, BatchSpanProcessor, InstrumentationScope, NoopExporter, SpanRecord,
};
use std::sync::Arc;
use std::time::Duration;

fn bench_on_end(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let processor = runtime.block_on(BatchSpanProcessor::new(
        BatchConfig {
            max_queue_size: 1 << 20,
            scheduled_delay: Duration::from_millis(100),
            ..Default::default()
        },
        Some(Arc::new(NoopExporter::new())),
    ));
    let scope = InstrumentationScope::new("bench");

    let mut group = c.benchmark_group("ingest");
    group.throughput(Throughput::Elements(1));

    group.bench_function("on_end_accepted", |b| {
        let mut span_id = 0u64;
        b.iter(|| {
            span_id += 1;
            let span = SpanRecord::new(1, span_id, 0, "op", scope.clone());
            black_box(processor.on_end(span))
        });
    });

    group.bench_function("on_end_unsampled", |b| {
        b.iter(|| {
            let span = SpanRecord::new(1, 1, 0, "op", scope.clone()).with_sampled(false);
            black_box(processor.on_end(span))
        });
    });

    group.finish();
    runtime.block_on(processor.shutdown()).unwrap();
}

criterion_group!(benches, bench_on_end);
criterion_main!(benches);
