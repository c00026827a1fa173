//! Metric pipeline: instruments, shared aggregation tables, and readers.
//!
//! Producers record through [`Meter`]-created instruments into the shared
//! metrics table; each [`MetricReader`] periodically (or on demand) runs
//! observable callbacks, checkpoints the view aggregations it owns, and
//! hands the collected stream to its exporter.

pub mod aggregation;
pub mod instrument;
pub mod reader;
pub mod registry;

pub use aggregation::{
    default_histogram_bounds, Aggregation, AggregationMapping, HistogramPoint, MetricData,
    MetricRecord, MetricsTable, NumberPoint, Temporality, TemporalityMapping, ViewAggregation,
    ViewAggregationId, ViewAggregations,
};
pub use instrument::{
    Counter, Histogram, Instrument, InstrumentDescriptor, InstrumentId, InstrumentKind, Meter,
    UpDownCounter,
};
pub use reader::{MetricReader, ReaderConfig, ReaderId};
pub use registry::{run_callbacks, CallbackRegistry, MeterRegistry, Observer, ReaderBinding};
