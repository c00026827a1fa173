//! Telemetry Pipeline Core
//!
//! The machinery between instrumented application code and external telemetry
//! backends: bounded in-memory buffering of finished spans with background
//! batch export, and periodic metric collection with per-reader aggregation
//! state.
//!
//! # Subsystems
//!
//! - [`BatchSpanProcessor`]: a dual-buffer span pipeline. Producers append
//!   finished spans from arbitrary threads; a control task swaps buffers and
//!   hands full ones to transient export runners, bounded by an export
//!   timeout. Producers never block on exporter progress.
//! - [`MetricReader`]: a periodic (or on-demand) collector that drives
//!   observable-instrument callbacks, checkpoints aggregation state under a
//!   reader identity with cumulative or delta temporality, and exports the
//!   resulting metric stream.
//!
//! # Example
//!
//! ```no_run
//! use otel_pipeline::{
//!     BatchConfig, BatchSpanProcessor, InstrumentationScope, SpanRecord, StdoutExporter,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let exporter = Arc::new(StdoutExporter::new(true));
//!     let processor = BatchSpanProcessor::new(BatchConfig::default(), Some(exporter)).await;
//!
//!     let scope = InstrumentationScope::new("my-lib").with_version("1.0.0");
//!     let mut span = SpanRecord::new(1, 1, 0, "handle-request", scope);
//!     span.finish(otel_pipeline::SpanStatus::Ok);
//!     processor.on_end(span);
//!
//!     processor.shutdown().await.unwrap();
//! }
//! ```

pub mod buffer;
pub mod exporter;
mod invariants;
pub mod metrics;
pub mod processor;
pub mod resource;
pub mod span;

// Re-export main types
pub use buffer::{ScopeSpans, SpanBatch, SpanBuffer};
pub use exporter::{
    ExportError, ExporterHandle, JsonFileExporter, NoopExporter, StdoutExporter,
    TelemetryExporter, TelemetryExporterBoxed,
};
pub use metrics::{
    Aggregation, AggregationMapping, Counter, Histogram, InstrumentDescriptor, InstrumentKind,
    Meter, MeterRegistry, MetricData, MetricReader, MetricRecord, ReaderConfig, ReaderId,
    Temporality, TemporalityMapping, UpDownCounter,
};
pub use processor::{
    BatchConfig, BatchSpanProcessor, DropReason, IngestError, OnEnd, ProcessorMetrics,
};
pub use resource::Resource;
pub use span::{
    AttributeSet, AttributeValue, InstrumentationScope, SpanEvent, SpanKind, SpanLink, SpanRecord,
    SpanStatus,
};
