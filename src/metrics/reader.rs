//! Periodic and on-demand metric collection.
//!
//! One [`MetricReader`] per configured reader. Each owns a control task that
//! registers with the meter server, then serves timer-driven and manual
//! collection passes: run callbacks, sample the collection start time, walk
//! the view-aggregations owned by this reader, checkpoint and collect each,
//! and hand the resulting metric stream to the exporter.

use crate::exporter::ExporterHandle;
use crate::metrics::aggregation::MetricRecord;
use crate::metrics::registry::{run_callbacks, MeterRegistry, ReaderBinding};
use crate::metrics::{AggregationMapping, TemporalityMapping};
use crate::span::unix_nanos_now;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Opaque stable token identifying the reader that owns a collection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReaderId(u64);

static READER_SEQ: AtomicU64 = AtomicU64::new(0);

impl ReaderId {
    pub(crate) fn fresh() -> Self {
        Self(READER_SEQ.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ReaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reader-{}", self.0)
    }
}

/// Configuration for a metric reader
#[derive(Debug, Clone, Default)]
pub struct ReaderConfig {
    /// Period between automatic collections; absent means manual only
    pub export_interval: Option<Duration>,
    /// Instrument-kind → aggregation applied for this reader
    pub default_aggregations: AggregationMapping,
    /// Instrument-kind → temporality applied for this reader
    pub default_temporalities: TemporalityMapping,
}

enum ReaderControl {
    Collect(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to one metric reader and its control task.
pub struct MetricReader {
    id: ReaderId,
    control_tx: mpsc::UnboundedSender<ReaderControl>,
    task: Option<JoinHandle<()>>,
}

impl MetricReader {
    /// Creates a reader and spawns its control task, which registers with
    /// the meter server asynchronously. A `collect` arriving before
    /// registration completes is a no-op.
    ///
    /// Without an exporter every collection pass is a no-op; without an
    /// `export_interval` collection only happens through [`collect`].
    ///
    /// [`collect`]: Self::collect
    pub async fn new(
        registry: &MeterRegistry,
        config: ReaderConfig,
        exporter: Option<ExporterHandle>,
    ) -> Self {
        let id = ReaderId::fresh();
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let worker = ReaderWorker {
            registry: registry.clone(),
            config,
            exporter,
            id,
            control_rx,
        };
        let task = Some(tokio::spawn(worker.run()));

        Self {
            id,
            control_tx,
            task,
        }
    }

    pub fn id(&self) -> ReaderId {
        self.id
    }

    /// Performs one full collection pass, synchronous from the caller's
    /// view, and rearms the periodic timer so collections don't pile up
    /// right after a manual pass. A no-op after shutdown.
    pub async fn collect(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .control_tx
            .send(ReaderControl::Collect(ack_tx))
            .is_ok()
        {
            let _ = ack_rx.await;
        }
    }

    /// Stops further collections. Idempotent.
    pub async fn shutdown(&mut self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .control_tx
            .send(ReaderControl::Shutdown(ack_tx))
            .is_ok()
        {
            let _ = ack_rx.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

struct ReaderWorker {
    registry: MeterRegistry,
    config: ReaderConfig,
    exporter: Option<ExporterHandle>,
    id: ReaderId,
    control_rx: mpsc::UnboundedReceiver<ReaderControl>,
}

/// Resolves the next periodic tick, or never when collection is manual-only.
async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

impl ReaderWorker {
    async fn run(mut self) {
        // Registering phase: serve (and complete as no-ops) control requests
        // until the meter server hands back the shared tables.
        let registration = self.registry.add_metric_reader(
            self.id,
            self.config.default_aggregations.clone(),
            self.config.default_temporalities.clone(),
        );
        tokio::pin!(registration);

        let binding: ReaderBinding = loop {
            tokio::select! {
                binding = &mut registration => break binding,
                msg = self.control_rx.recv() => match msg {
                    Some(ReaderControl::Collect(ack)) => {
                        let _ = ack.send(());
                    }
                    Some(ReaderControl::Shutdown(ack)) => {
                        let _ = ack.send(());
                        return;
                    }
                    None => return,
                },
            }
        };

        let mut timer = self.config.export_interval.map(|period| {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });

        loop {
            tokio::select! {
                _ = next_tick(&mut timer) => {
                    // The interval rearms itself after a periodic pass.
                    self.collect_once(&binding).await;
                }
                msg = self.control_rx.recv() => match msg {
                    Some(ReaderControl::Collect(ack)) => {
                        self.collect_once(&binding).await;
                        if let Some(timer) = &mut timer {
                            timer.reset();
                        }
                        let _ = ack.send(());
                    }
                    Some(ReaderControl::Shutdown(ack)) => {
                        let _ = ack.send(());
                        return;
                    }
                    None => return,
                },
            }
        }
    }

    /// One full collection pass: callbacks, checkpoint walk, export.
    async fn collect_once(&self, binding: &ReaderBinding) {
        let Some(exporter) = self.exporter.clone() else {
            return;
        };

        run_callbacks(
            &binding.callbacks,
            self.id,
            &binding.view_aggregations,
            &binding.metrics,
        );

        // Sampled after callbacks so callback-created datapoints carry start
        // timestamps strictly before the collection time.
        let collection_start = unix_nanos_now();

        let mut records = Vec::new();
        for view in binding.view_aggregations.for_reader(self.id) {
            if view.aggregation.is_drop() {
                continue;
            }
            view.aggregation
                .checkpoint(&binding.metrics, &view, collection_start);
            let data = view
                .aggregation
                .collect(&binding.metrics, &view, collection_start);
            records.push(MetricRecord {
                scope: view.instrument.scope.clone(),
                name: view.instrument.name.clone(),
                description: view.instrument.description.clone(),
                unit: view.instrument.unit.clone(),
                data,
            });
        }

        match exporter.export_metrics_boxed(records, &binding.resource).await {
            Ok(()) => {
                tracing::debug!(reader = %self.id, "metric collection exported");
            }
            Err(e) => {
                tracing::error!(
                    reader = %self.id,
                    exporter = exporter.name(),
                    error = %e,
                    "metric export failed; collection dropped"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::RecordingExporter;
    use crate::metrics::aggregation::{MetricData, Temporality};
    use crate::resource::Resource;
    use crate::span::{AttributeSet, AttributeValue, InstrumentationScope};
    use std::sync::Arc;

    fn delta_config(interval: Option<Duration>) -> ReaderConfig {
        ReaderConfig {
            export_interval: interval,
            default_temporalities: TemporalityMapping::uniform(Temporality::Delta),
            ..Default::default()
        }
    }

    /// The named metric's single values across passes, skipping empty passes.
    fn values_of(exporter: &RecordingExporter, name: &str) -> Vec<f64> {
        exporter
            .metric_passes()
            .iter()
            .flat_map(|pass| {
                pass.iter()
                    .filter(|r| r.name == name)
                    .filter_map(|r| r.data.single_value())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_manual_collect_delta_counter() {
        let registry = MeterRegistry::new(Some(Resource::empty()));
        let exporter = Arc::new(RecordingExporter::new());
        let mut reader = MetricReader::new(
            &registry,
            delta_config(None),
            Some(exporter.clone() as ExporterHandle),
        )
        .await;
        // Let the reader finish registering with the meter server.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let meter = registry.meter(InstrumentationScope::new("app"));
        let counter = meter.counter("requests");

        counter.add(5.0, AttributeSet::empty());
        reader.collect().await;
        counter.add(3.0, AttributeSet::empty());
        reader.collect().await;

        assert_eq!(values_of(&exporter, "requests"), vec![5.0, 3.0]);
        reader.shutdown().await;
    }

    #[tokio::test]
    async fn test_periodic_collection() {
        let registry = MeterRegistry::new(Some(Resource::empty()));
        let exporter = Arc::new(RecordingExporter::new());
        let mut reader = MetricReader::new(
            &registry,
            delta_config(Some(Duration::from_millis(50))),
            Some(exporter.clone() as ExporterHandle),
        )
        .await;
        // Let the reader finish registering with the meter server.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let meter = registry.meter(InstrumentationScope::new("app"));
        let counter = meter.counter("requests");
        counter.add(7.0, AttributeSet::empty());

        tokio::time::sleep(Duration::from_millis(140)).await;
        reader.shutdown().await;

        let values = values_of(&exporter, "requests");
        assert!(values.len() >= 2, "expected multiple periodic passes, got {:?}", values);
        assert_eq!(values[0], 7.0);
        assert!(values[1..].iter().all(|v| *v == 0.0), "delta resets between passes");
    }

    #[tokio::test]
    async fn test_observable_gauge_collects_callback_observation() {
        let registry = MeterRegistry::new(Some(Resource::empty()));
        let exporter = Arc::new(RecordingExporter::new());
        let mut reader = MetricReader::new(
            &registry,
            ReaderConfig::default(),
            Some(exporter.clone() as ExporterHandle),
        )
        .await;
        // Let the reader finish registering with the meter server.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let meter = registry.meter(InstrumentationScope::new("app"));
        meter.observable_gauge("temperature", |observer| {
            observer.observe(42.0, [("host", "h1")].into_iter().collect());
        });

        reader.collect().await;
        reader.shutdown().await;

        let passes = exporter.metric_passes();
        let record = passes
            .iter()
            .flatten()
            .find(|r| r.name == "temperature")
            .expect("gauge collected in the same cycle its callback ran");
        let MetricData::Gauge { points } = &record.data else {
            panic!("expected gauge data");
        };
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].value, 42.0);
        assert_eq!(
            points[0].attributes.get("host"),
            Some(&AttributeValue::String("h1".into()))
        );
        assert!(
            points[0].start_time < points[0].time,
            "callback-initialised start precedes collection time"
        );
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_stops_collection() {
        let registry = MeterRegistry::new(Some(Resource::empty()));
        let exporter = Arc::new(RecordingExporter::new());
        let mut reader = MetricReader::new(
            &registry,
            delta_config(None),
            Some(exporter.clone() as ExporterHandle),
        )
        .await;
        // Let the reader finish registering with the meter server.
        tokio::time::sleep(Duration::from_millis(20)).await;

        reader.collect().await;
        let passes_before = exporter.metric_passes().len();

        reader.shutdown().await;
        reader.shutdown().await;

        reader.collect().await;
        assert_eq!(exporter.metric_passes().len(), passes_before);
    }

    #[tokio::test]
    async fn test_no_exporter_collection_is_noop() {
        let registry = MeterRegistry::new(Some(Resource::empty()));
        let mut reader = MetricReader::new(&registry, delta_config(None), None).await;
        // Let the reader finish registering with the meter server.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let meter = registry.meter(InstrumentationScope::new("app"));
        let counter = meter.counter("requests");
        counter.add(1.0, AttributeSet::empty());

        // Must not panic and must not disturb aggregation state.
        reader.collect().await;
        reader.shutdown().await;
    }

    #[tokio::test]
    async fn test_manual_collect_rearms_periodic_timer() {
        let registry = MeterRegistry::new(Some(Resource::empty()));
        let exporter = Arc::new(RecordingExporter::new());
        let mut reader = MetricReader::new(
            &registry,
            delta_config(Some(Duration::from_millis(200))),
            Some(exporter.clone() as ExporterHandle),
        )
        .await;
        // Let the reader finish registering with the meter server.
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Manual pass at ~100ms pushes the next periodic pass to ~300ms.
        tokio::time::sleep(Duration::from_millis(100)).await;
        reader.collect().await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(
            exporter.metric_passes().len(),
            1,
            "periodic pass postponed by the manual one"
        );
        reader.shutdown().await;
    }
}
