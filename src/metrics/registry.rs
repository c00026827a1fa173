//! The meter server: shared tables and reader registration.
//!
//! A [`MeterRegistry`] owns the callbacks table, the view-aggregations table,
//! the metrics table, and the process resource. Readers register with it and
//! receive shared handles to all four; instruments register with it and are
//! matched against every known reader, producing one view aggregation per
//! (instrument, reader) pair in either registration order.

use crate::metrics::aggregation::{
    Aggregation, AggregationMapping, MetricsTable, TemporalityMapping, ViewAggregation,
    ViewAggregationId, ViewAggregations,
};
use crate::metrics::instrument::{
    Instrument, InstrumentDescriptor, InstrumentId, InstrumentKind, Meter,
};
use crate::metrics::reader::ReaderId;
use crate::resource::Resource;
use crate::span::{AttributeSet, InstrumentationScope};
use std::sync::{Arc, RwLock};

/// A metric-observing callback registered for an observable instrument.
pub struct RegisteredCallback {
    instrument: Arc<Instrument>,
    run: Box<dyn Fn(&Observer) + Send + Sync>,
}

/// The callbacks table: one entry per observable instrument.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: RwLock<Vec<Arc<RegisteredCallback>>>,
}

impl CallbackRegistry {
    fn register(&self, callback: Arc<RegisteredCallback>) {
        self.callbacks.write().unwrap().push(callback);
    }

    fn snapshot(&self) -> Vec<Arc<RegisteredCallback>> {
        self.callbacks.read().unwrap().clone()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.callbacks.read().unwrap().len()
    }
}

/// Observation sink handed to a callback for one collection pass.
///
/// Observations land only in the view aggregations owned by the collecting
/// reader, so each reader sees its own aggregation state.
pub struct Observer<'a> {
    reader: ReaderId,
    instrument: &'a Arc<Instrument>,
    view_aggregations: &'a ViewAggregations,
    metrics: &'a MetricsTable,
}

impl Observer<'_> {
    /// Records one observation for the callback's instrument.
    pub fn observe(&self, value: f64, attributes: AttributeSet) {
        for view in self.view_aggregations.for_instrument(self.instrument.id) {
            if view.reader == self.reader {
                self.metrics.record(&view, attributes.clone(), value);
            }
        }
    }
}

/// Runs every registered callback for one reader's collection pass.
///
/// Callbacks run inline on the caller (the reader's control task) and may
/// block collection for their duration.
pub fn run_callbacks(
    callbacks: &CallbackRegistry,
    reader: ReaderId,
    view_aggregations: &ViewAggregations,
    metrics: &MetricsTable,
) {
    for callback in callbacks.snapshot() {
        let observer = Observer {
            reader,
            instrument: &callback.instrument,
            view_aggregations,
            metrics,
        };
        (callback.run)(&observer);
    }
}

/// What a reader receives from registration: shared handles to the tables it
/// collects from, plus the process resource.
pub struct ReaderBinding {
    pub reader: ReaderId,
    pub callbacks: Arc<CallbackRegistry>,
    pub view_aggregations: Arc<ViewAggregations>,
    pub metrics: Arc<MetricsTable>,
    pub resource: Resource,
}

struct ReaderRegistration {
    reader: ReaderId,
    aggregations: AggregationMapping,
    temporalities: TemporalityMapping,
}

/// Instruments and reader registrations, guarded together so concurrent
/// instrument and reader registration cannot create a (instrument, reader)
/// view twice or miss one.
#[derive(Default)]
struct RegistryState {
    instruments: Vec<Arc<Instrument>>,
    readers: Vec<ReaderRegistration>,
}

struct RegistryInner {
    resource: Resource,
    state: RwLock<RegistryState>,
    callbacks: Arc<CallbackRegistry>,
    view_aggregations: Arc<ViewAggregations>,
    metrics: Arc<MetricsTable>,
}

/// The meter server. Cheap to clone; all clones share the same tables.
#[derive(Clone)]
pub struct MeterRegistry {
    inner: Arc<RegistryInner>,
}

impl MeterRegistry {
    /// Creates a registry. The resource is detected when absent.
    pub fn new(resource: Option<Resource>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                resource: resource.unwrap_or_else(Resource::detect),
                state: RwLock::new(RegistryState::default()),
                callbacks: Arc::new(CallbackRegistry::default()),
                view_aggregations: Arc::new(ViewAggregations::new()),
                metrics: Arc::new(MetricsTable::new()),
            }),
        }
    }

    /// Returns a meter bound to the given instrumentation scope.
    pub fn meter(&self, scope: InstrumentationScope) -> Meter {
        Meter::new(self.clone(), scope)
    }

    pub fn resource(&self) -> &Resource {
        &self.inner.resource
    }

    pub(crate) fn view_aggregations(&self) -> Arc<ViewAggregations> {
        Arc::clone(&self.inner.view_aggregations)
    }

    pub(crate) fn metrics_table(&self) -> Arc<MetricsTable> {
        Arc::clone(&self.inner.metrics)
    }

    /// Registers an instrument and matches it against every known reader,
    /// creating one view aggregation per (instrument, reader) pair.
    pub(crate) fn register_instrument(
        &self,
        kind: InstrumentKind,
        descriptor: InstrumentDescriptor,
        scope: InstrumentationScope,
    ) -> Arc<Instrument> {
        let instrument = Arc::new(Instrument {
            id: InstrumentId::fresh(),
            kind,
            name: descriptor.name,
            unit: descriptor.unit,
            description: descriptor.description,
            scope,
        });

        let mut state = self.inner.state.write().unwrap();
        for registration in state.readers.iter() {
            self.create_view(&instrument, registration);
        }
        state.instruments.push(Arc::clone(&instrument));
        instrument
    }

    pub(crate) fn register_callback(
        &self,
        instrument: Arc<Instrument>,
        run: Box<dyn Fn(&Observer) + Send + Sync>,
    ) {
        self.inner
            .callbacks
            .register(Arc::new(RegisteredCallback { instrument, run }));
    }

    /// Registers a metric reader, creating view aggregations for every
    /// instrument already known, and hands back the shared tables.
    pub async fn add_metric_reader(
        &self,
        reader: ReaderId,
        aggregations: AggregationMapping,
        temporalities: TemporalityMapping,
    ) -> ReaderBinding {
        // Registration is asynchronous relative to reader construction.
        tokio::task::yield_now().await;

        let registration = ReaderRegistration {
            reader,
            aggregations,
            temporalities,
        };

        let mut state = self.inner.state.write().unwrap();
        for instrument in state.instruments.iter() {
            self.create_view(instrument, &registration);
        }
        state.readers.push(registration);
        drop(state);

        ReaderBinding {
            reader,
            callbacks: Arc::clone(&self.inner.callbacks),
            view_aggregations: Arc::clone(&self.inner.view_aggregations),
            metrics: Arc::clone(&self.inner.metrics),
            resource: self.inner.resource.clone(),
        }
    }

    fn create_view(&self, instrument: &Arc<Instrument>, registration: &ReaderRegistration) {
        let aggregation: Aggregation = registration
            .aggregations
            .for_kind(instrument.kind)
            .clone();
        let temporality = registration.temporalities.for_kind(instrument.kind);
        self.inner.view_aggregations.insert(Arc::new(ViewAggregation {
            id: ViewAggregationId::fresh(),
            reader: registration.reader,
            instrument: Arc::clone(instrument),
            aggregation,
            temporality,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::aggregation::Temporality;

    #[tokio::test]
    async fn test_views_created_instrument_first() {
        let registry = MeterRegistry::new(Some(Resource::empty()));
        let meter = registry.meter(InstrumentationScope::new("app"));
        let counter = meter.counter("requests");

        let reader = ReaderId::fresh();
        let binding = registry
            .add_metric_reader(reader, AggregationMapping::default(), TemporalityMapping::default())
            .await;

        let views = binding.view_aggregations.for_reader(reader);
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].instrument.name, "requests");
        assert_eq!(views[0].temporality, Temporality::Cumulative);

        // The pre-existing handle records into the new reader's view.
        counter.add(1.0, AttributeSet::empty());
        views[0].aggregation.checkpoint(&binding.metrics, &views[0], 100);
        let data = views[0].aggregation.collect(&binding.metrics, &views[0], 100);
        assert_eq!(data.single_value(), Some(1.0));
    }

    #[tokio::test]
    async fn test_views_created_reader_first() {
        let registry = MeterRegistry::new(Some(Resource::empty()));
        let reader = ReaderId::fresh();
        let binding = registry
            .add_metric_reader(reader, AggregationMapping::default(), TemporalityMapping::default())
            .await;

        let meter = registry.meter(InstrumentationScope::new("app"));
        let _counter = meter.counter("requests");

        let views = binding.view_aggregations.for_reader(reader);
        assert_eq!(views.len(), 1);
    }

    #[tokio::test]
    async fn test_each_reader_gets_its_own_view() {
        let registry = MeterRegistry::new(Some(Resource::empty()));
        let delta_reader = ReaderId::fresh();
        let cumulative_reader = ReaderId::fresh();

        let delta_binding = registry
            .add_metric_reader(
                delta_reader,
                AggregationMapping::default(),
                TemporalityMapping::uniform(Temporality::Delta),
            )
            .await;
        let cumulative_binding = registry
            .add_metric_reader(
                cumulative_reader,
                AggregationMapping::default(),
                TemporalityMapping::default(),
            )
            .await;

        let meter = registry.meter(InstrumentationScope::new("app"));
        let counter = meter.counter("requests");
        counter.add(5.0, AttributeSet::empty());

        // Delta reader drains its view; the cumulative reader's is untouched.
        let delta_views = delta_binding.view_aggregations.for_reader(delta_reader);
        delta_views[0]
            .aggregation
            .checkpoint(&delta_binding.metrics, &delta_views[0], 100);
        assert_eq!(
            delta_views[0]
                .aggregation
                .collect(&delta_binding.metrics, &delta_views[0], 100)
                .single_value(),
            Some(5.0)
        );

        counter.add(3.0, AttributeSet::empty());
        delta_views[0]
            .aggregation
            .checkpoint(&delta_binding.metrics, &delta_views[0], 200);
        assert_eq!(
            delta_views[0]
                .aggregation
                .collect(&delta_binding.metrics, &delta_views[0], 200)
                .single_value(),
            Some(3.0)
        );

        let cumulative_views = cumulative_binding
            .view_aggregations
            .for_reader(cumulative_reader);
        cumulative_views[0].aggregation.checkpoint(
            &cumulative_binding.metrics,
            &cumulative_views[0],
            200,
        );
        assert_eq!(
            cumulative_views[0]
                .aggregation
                .collect(&cumulative_binding.metrics, &cumulative_views[0], 200)
                .single_value(),
            Some(8.0)
        );
    }

    #[tokio::test]
    async fn test_callbacks_observe_into_owning_reader_only() {
        let registry = MeterRegistry::new(Some(Resource::empty()));
        let reader_a = ReaderId::fresh();
        let reader_b = ReaderId::fresh();
        let binding_a = registry
            .add_metric_reader(reader_a, AggregationMapping::default(), TemporalityMapping::default())
            .await;
        let _binding_b = registry
            .add_metric_reader(reader_b, AggregationMapping::default(), TemporalityMapping::default())
            .await;

        let meter = registry.meter(InstrumentationScope::new("app"));
        meter.observable_gauge("temperature", |observer| {
            observer.observe(42.0, [("host", "h1")].into_iter().collect());
        });
        assert_eq!(binding_a.callbacks.len(), 1);

        run_callbacks(
            &binding_a.callbacks,
            reader_a,
            &binding_a.view_aggregations,
            &binding_a.metrics,
        );

        let views_a = binding_a.view_aggregations.for_reader(reader_a);
        views_a[0]
            .aggregation
            .checkpoint(&binding_a.metrics, &views_a[0], 100);
        assert_eq!(
            views_a[0]
                .aggregation
                .collect(&binding_a.metrics, &views_a[0], 100)
                .single_value(),
            Some(42.0),
            "observation lands in the collecting reader's view"
        );

        // Reader B has not collected; its view holds no reported data.
        let views_b = binding_a.view_aggregations.for_reader(reader_b);
        let data = views_b[0]
            .aggregation
            .collect(&binding_a.metrics, &views_b[0], 100);
        assert!(data.single_value().is_none());
    }
}
