//! Aggregation state and the shared metric tables.
//!
//! Two tables back the metric pipeline: *view-aggregations* (keyed by
//! instrument, yielding the aggregation applied for each reader) and
//! *metrics* (keyed by `(view-aggregation, attribute-set)`, holding live
//! datapoints). Producers mutate datapoints through per-cell atomics or a
//! per-cell mutex; only the owning reader checkpoints them, so a producer
//! update and a delta reset never race on the same value.

use crate::metrics::instrument::{Instrument, InstrumentKind};
use crate::metrics::reader::ReaderId;
use crate::span::{AttributeSet, InstrumentationScope};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Whether a metric value is reported since start or per collection interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Temporality {
    /// Values accumulate for the lifetime of the datapoint; never reset
    Cumulative,
    /// Values cover one collection interval; reset at checkpoint
    Delta,
}

/// The aggregation shape applied to an instrument for one reader.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregation {
    /// Sentinel: measurements are discarded and collection skips the entry
    Drop,
    /// Running sum; monotonic for counter-like instruments
    Sum { monotonic: bool },
    /// Most recent observation wins
    LastValue,
    /// Explicit-boundary bucket histogram
    ExplicitBucketHistogram { bounds: Vec<f64> },
}

/// Default bucket boundaries for histogram instruments.
pub fn default_histogram_bounds() -> Vec<f64> {
    vec![
        0.0, 5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0, 500.0, 750.0, 1000.0, 2500.0, 5000.0,
        7500.0, 10000.0,
    ]
}

impl Aggregation {
    /// The canonical aggregation for an instrument kind.
    pub fn default_for(kind: InstrumentKind) -> Self {
        match kind {
            InstrumentKind::Counter | InstrumentKind::ObservableCounter => {
                Self::Sum { monotonic: true }
            }
            InstrumentKind::UpDownCounter | InstrumentKind::ObservableUpDownCounter => {
                Self::Sum { monotonic: false }
            }
            InstrumentKind::Histogram => Self::ExplicitBucketHistogram {
                bounds: default_histogram_bounds(),
            },
            InstrumentKind::ObservableGauge => Self::LastValue,
        }
    }

    #[inline]
    pub fn is_drop(&self) -> bool {
        matches!(self, Self::Drop)
    }
}

/// Instrument-kind → aggregation mapping supplied per reader.
#[derive(Debug, Clone)]
pub struct AggregationMapping {
    pub counter: Aggregation,
    pub up_down_counter: Aggregation,
    pub histogram: Aggregation,
    pub observable_counter: Aggregation,
    pub observable_up_down_counter: Aggregation,
    pub observable_gauge: Aggregation,
}

impl Default for AggregationMapping {
    fn default() -> Self {
        Self {
            counter: Aggregation::default_for(InstrumentKind::Counter),
            up_down_counter: Aggregation::default_for(InstrumentKind::UpDownCounter),
            histogram: Aggregation::default_for(InstrumentKind::Histogram),
            observable_counter: Aggregation::default_for(InstrumentKind::ObservableCounter),
            observable_up_down_counter: Aggregation::default_for(
                InstrumentKind::ObservableUpDownCounter,
            ),
            observable_gauge: Aggregation::default_for(InstrumentKind::ObservableGauge),
        }
    }
}

impl AggregationMapping {
    pub fn for_kind(&self, kind: InstrumentKind) -> &Aggregation {
        match kind {
            InstrumentKind::Counter => &self.counter,
            InstrumentKind::UpDownCounter => &self.up_down_counter,
            InstrumentKind::Histogram => &self.histogram,
            InstrumentKind::ObservableCounter => &self.observable_counter,
            InstrumentKind::ObservableUpDownCounter => &self.observable_up_down_counter,
            InstrumentKind::ObservableGauge => &self.observable_gauge,
        }
    }
}

/// Instrument-kind → temporality mapping supplied per reader.
#[derive(Debug, Clone)]
pub struct TemporalityMapping {
    pub counter: Temporality,
    pub up_down_counter: Temporality,
    pub histogram: Temporality,
    pub observable_counter: Temporality,
    pub observable_up_down_counter: Temporality,
    pub observable_gauge: Temporality,
}

impl Default for TemporalityMapping {
    fn default() -> Self {
        Self::uniform(Temporality::Cumulative)
    }
}

impl TemporalityMapping {
    /// The same temporality for every instrument kind.
    pub fn uniform(temporality: Temporality) -> Self {
        Self {
            counter: temporality,
            up_down_counter: temporality,
            histogram: temporality,
            observable_counter: temporality,
            observable_up_down_counter: temporality,
            observable_gauge: temporality,
        }
    }

    pub fn for_kind(&self, kind: InstrumentKind) -> Temporality {
        match kind {
            InstrumentKind::Counter => self.counter,
            InstrumentKind::UpDownCounter => self.up_down_counter,
            InstrumentKind::Histogram => self.histogram,
            InstrumentKind::ObservableCounter => self.observable_counter,
            InstrumentKind::ObservableUpDownCounter => self.observable_up_down_counter,
            InstrumentKind::ObservableGauge => self.observable_gauge,
        }
    }
}

/// Stable identifier of one (instrument, reader) view aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewAggregationId(u64);

static VIEW_AGG_SEQ: AtomicU64 = AtomicU64::new(0);

impl ViewAggregationId {
    pub(crate) fn fresh() -> Self {
        Self(VIEW_AGG_SEQ.fetch_add(1, Ordering::Relaxed))
    }
}

/// The binding of an instrument to an aggregation shape for one reader.
#[derive(Debug)]
pub struct ViewAggregation {
    pub id: ViewAggregationId,
    pub reader: ReaderId,
    pub instrument: Arc<Instrument>,
    pub aggregation: Aggregation,
    pub temporality: Temporality,
}

/// The view-aggregations table: instrument → aggregations applied per reader.
#[derive(Debug, Default)]
pub struct ViewAggregations {
    by_instrument: DashMap<crate::metrics::instrument::InstrumentId, Vec<Arc<ViewAggregation>>>,
}

impl ViewAggregations {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, view: Arc<ViewAggregation>) {
        self.by_instrument
            .entry(view.instrument.id)
            .or_default()
            .push(view);
    }

    /// The aggregations applied to one instrument, across all readers.
    pub fn for_instrument(
        &self,
        instrument: crate::metrics::instrument::InstrumentId,
    ) -> Vec<Arc<ViewAggregation>> {
        self.by_instrument
            .get(&instrument)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Every entry owned by the given reader, in registration order.
    pub fn for_reader(&self, reader: ReaderId) -> Vec<Arc<ViewAggregation>> {
        let mut views: Vec<Arc<ViewAggregation>> = self
            .by_instrument
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|va| va.reader == reader)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        views.sort_by_key(|va| {
            let ViewAggregationId(id) = va.id;
            id
        });
        views
    }
}

/// An f64 cell supporting lock-free add/swap, stored as bits in an AtomicU64.
#[derive(Debug)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn new(value: f64) -> Self {
        Self(AtomicU64::new(value.to_bits()))
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }

    fn store(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    fn swap(&self, value: f64) -> f64 {
        f64::from_bits(self.0.swap(value.to_bits(), Ordering::AcqRel))
    }

    fn add(&self, delta: f64) {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self.0.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

/// Mutable histogram state, guarded by the datapoint's mutex.
#[derive(Debug, Clone)]
struct HistogramCell {
    bucket_counts: Vec<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl HistogramCell {
    fn new(bucket_len: usize) -> Self {
        Self {
            bucket_counts: vec![0; bucket_len],
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn record(&mut self, value: f64, bounds: &[f64]) {
        let bucket = bounds.partition_point(|b| *b < value);
        self.bucket_counts[bucket] += 1;
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    fn reset(&mut self) {
        self.bucket_counts.fill(0);
        self.count = 0;
        self.sum = 0.0;
        self.min = f64::INFINITY;
        self.max = f64::NEG_INFINITY;
    }
}

/// The live value of one datapoint.
#[derive(Debug)]
enum PointCell {
    Sum(AtomicF64),
    LastValue(AtomicF64),
    Histogram(Mutex<HistogramCell>),
}

/// The snapshot produced by the latest checkpoint, read back by `collect`.
#[derive(Debug, Clone)]
enum Reported {
    None,
    Number { start_time: u64, value: f64 },
    Histogram { start_time: u64, cell: HistogramCell },
}

/// One `(view-aggregation, attribute-set)` datapoint.
///
/// Producers mutate the cell; the owning reader checkpoints it into the
/// `reported` slot and, for delta temporality, resets the cell and advances
/// the start time.
#[derive(Debug)]
pub struct DataPoint {
    attributes: AttributeSet,
    start_time: AtomicU64,
    cell: PointCell,
    reported: Mutex<Reported>,
}

impl DataPoint {
    fn new(aggregation: &Aggregation, attributes: AttributeSet, now: u64) -> Self {
        let cell = match aggregation {
            Aggregation::Sum { .. } => PointCell::Sum(AtomicF64::new(0.0)),
            Aggregation::LastValue => PointCell::LastValue(AtomicF64::new(0.0)),
            Aggregation::ExplicitBucketHistogram { bounds } => {
                PointCell::Histogram(Mutex::new(HistogramCell::new(bounds.len() + 1)))
            }
            // Drop aggregations never materialize datapoints
            Aggregation::Drop => PointCell::Sum(AtomicF64::new(0.0)),
        };
        Self {
            attributes,
            start_time: AtomicU64::new(now),
            cell,
            reported: Mutex::new(Reported::None),
        }
    }
}

/// The metrics table: live datapoints for every view aggregation.
#[derive(Debug, Default)]
pub struct MetricsTable {
    points: DashMap<ViewAggregationId, HashMap<AttributeSet, Arc<DataPoint>>>,
}

impl MetricsTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one measurement under a view aggregation.
    ///
    /// Creates the datapoint on first observation; the creation time becomes
    /// the point's start timestamp.
    pub fn record(&self, view: &ViewAggregation, attributes: AttributeSet, value: f64) {
        if view.aggregation.is_drop() {
            return;
        }
        let now = crate::span::unix_nanos_now();
        let mut entry = self.points.entry(view.id).or_default();
        let point = entry
            .entry(attributes.clone())
            .or_insert_with(|| Arc::new(DataPoint::new(&view.aggregation, attributes, now)))
            .clone();
        drop(entry);

        match (&point.cell, &view.aggregation) {
            (PointCell::Sum(cell), _) => cell.add(value),
            (PointCell::LastValue(cell), _) => cell.store(value),
            (PointCell::Histogram(cell), Aggregation::ExplicitBucketHistogram { bounds }) => {
                cell.lock().unwrap().record(value, bounds);
            }
            _ => {}
        }
    }

    fn points_for(&self, view: ViewAggregationId) -> Vec<Arc<DataPoint>> {
        self.points
            .get(&view)
            .map(|entry| entry.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl Aggregation {
    /// Snapshots every datapoint of `view` into its reportable slot.
    ///
    /// For delta temporality this also resets the live cell and advances the
    /// point's start time to `t`, so the next interval begins where this one
    /// ended. Only the reader owning `view` may call this.
    pub fn checkpoint(&self, table: &MetricsTable, view: &ViewAggregation, t: u64) {
        for point in table.points_for(view.id) {
            let mut reported = point.reported.lock().unwrap();
            match &point.cell {
                PointCell::Sum(cell) => {
                    let start_time = point.start_time.load(Ordering::Acquire);
                    let value = match view.temporality {
                        Temporality::Cumulative => cell.load(),
                        Temporality::Delta => {
                            let value = cell.swap(0.0);
                            point.start_time.store(t, Ordering::Release);
                            value
                        }
                    };
                    *reported = Reported::Number { start_time, value };
                }
                PointCell::LastValue(cell) => {
                    let start_time = point.start_time.load(Ordering::Acquire);
                    *reported = Reported::Number {
                        start_time,
                        value: cell.load(),
                    };
                }
                PointCell::Histogram(cell) => {
                    let start_time = point.start_time.load(Ordering::Acquire);
                    let mut cell = cell.lock().unwrap();
                    let snapshot = cell.clone();
                    if view.temporality == Temporality::Delta {
                        cell.reset();
                        point.start_time.store(t, Ordering::Release);
                    }
                    *reported = Reported::Histogram {
                        start_time,
                        cell: snapshot,
                    };
                }
            }
        }
    }

    /// Reads the checkpointed snapshots of `view` into a reportable data
    /// stream with observation time `t`.
    pub fn collect(&self, table: &MetricsTable, view: &ViewAggregation, t: u64) -> MetricData {
        let mut points = table.points_for(view.id);
        points.sort_by(|a, b| {
            a.start_time
                .load(Ordering::Relaxed)
                .cmp(&b.start_time.load(Ordering::Relaxed))
        });

        match self {
            Aggregation::Drop => MetricData::Gauge { points: Vec::new() },
            Aggregation::Sum { monotonic } => MetricData::Sum {
                temporality: view.temporality,
                monotonic: *monotonic,
                points: number_points(&points, t),
            },
            Aggregation::LastValue => MetricData::Gauge {
                points: number_points(&points, t),
            },
            Aggregation::ExplicitBucketHistogram { bounds } => {
                let mut out = Vec::with_capacity(points.len());
                for point in &points {
                    let reported = point.reported.lock().unwrap();
                    if let Reported::Histogram { start_time, cell } = &*reported {
                        out.push(HistogramPoint {
                            attributes: point.attributes.clone(),
                            start_time: *start_time,
                            time: t,
                            count: cell.count,
                            sum: cell.sum,
                            min: (cell.count > 0).then_some(cell.min),
                            max: (cell.count > 0).then_some(cell.max),
                            bounds: bounds.clone(),
                            bucket_counts: cell.bucket_counts.clone(),
                        });
                    }
                }
                MetricData::Histogram {
                    temporality: view.temporality,
                    points: out,
                }
            }
        }
    }
}

fn number_points(points: &[Arc<DataPoint>], t: u64) -> Vec<NumberPoint> {
    points
        .iter()
        .filter_map(|point| {
            let reported = point.reported.lock().unwrap();
            if let Reported::Number { start_time, value } = &*reported {
                Some(NumberPoint {
                    attributes: point.attributes.clone(),
                    start_time: *start_time,
                    time: t,
                    value: *value,
                })
            } else {
                None
            }
        })
        .collect()
}

/// One numeric datapoint in a reportable stream.
#[derive(Debug, Clone, Serialize)]
pub struct NumberPoint {
    pub attributes: AttributeSet,
    pub start_time: u64,
    pub time: u64,
    pub value: f64,
}

/// One histogram datapoint in a reportable stream.
#[derive(Debug, Clone, Serialize)]
pub struct HistogramPoint {
    pub attributes: AttributeSet,
    pub start_time: u64,
    pub time: u64,
    pub count: u64,
    pub sum: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub bounds: Vec<f64>,
    pub bucket_counts: Vec<u64>,
}

/// The data stream of one collected metric.
#[derive(Debug, Clone, Serialize)]
pub enum MetricData {
    Sum {
        temporality: Temporality,
        monotonic: bool,
        points: Vec<NumberPoint>,
    },
    Gauge {
        points: Vec<NumberPoint>,
    },
    Histogram {
        temporality: Temporality,
        points: Vec<HistogramPoint>,
    },
}

impl MetricData {
    /// The value of the single numeric point, if the stream has exactly one.
    pub fn single_value(&self) -> Option<f64> {
        match self {
            Self::Sum { points, .. } | Self::Gauge { points } => {
                (points.len() == 1).then(|| points[0].value)
            }
            Self::Histogram { .. } => None,
        }
    }
}

/// One collected metric: scope and identity plus the datapoint stream.
#[derive(Debug, Clone, Serialize)]
pub struct MetricRecord {
    pub scope: InstrumentationScope,
    pub name: String,
    pub description: String,
    pub unit: String,
    pub data: MetricData,
}
