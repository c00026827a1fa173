//! Instruments and the meter surface producers record through.

use crate::metrics::aggregation::{MetricsTable, ViewAggregations};
use crate::metrics::registry::{MeterRegistry, Observer};
use crate::span::{AttributeSet, InstrumentationScope};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// The kind of an instrument, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstrumentKind {
    Counter,
    UpDownCounter,
    Histogram,
    ObservableCounter,
    ObservableUpDownCounter,
    ObservableGauge,
}

impl InstrumentKind {
    /// Observable kinds record through callbacks at collection time.
    pub fn is_observable(&self) -> bool {
        matches!(
            self,
            Self::ObservableCounter | Self::ObservableUpDownCounter | Self::ObservableGauge
        )
    }
}

/// Stable identifier of a registered instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstrumentId(u64);

static INSTRUMENT_SEQ: AtomicU64 = AtomicU64::new(0);

impl InstrumentId {
    pub(crate) fn fresh() -> Self {
        Self(INSTRUMENT_SEQ.fetch_add(1, Ordering::Relaxed))
    }
}

/// A registered instrument. Referenced by every view aggregation created
/// when it is matched against a reader.
#[derive(Debug)]
pub struct Instrument {
    pub id: InstrumentId,
    pub kind: InstrumentKind,
    pub name: String,
    pub unit: String,
    pub description: String,
    pub scope: InstrumentationScope,
}

/// Name, unit, and description of an instrument under construction.
///
/// `&str` converts directly for the common name-only case:
/// `meter.counter("requests")`.
#[derive(Debug, Clone, Default)]
pub struct InstrumentDescriptor {
    pub name: String,
    pub unit: String,
    pub description: String,
}

impl InstrumentDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl From<&str> for InstrumentDescriptor {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Creates instruments under one instrumentation scope.
///
/// Obtained from [`MeterRegistry::meter`]; cheap to clone.
#[derive(Clone)]
pub struct Meter {
    registry: MeterRegistry,
    scope: InstrumentationScope,
}

impl Meter {
    pub(crate) fn new(registry: MeterRegistry, scope: InstrumentationScope) -> Self {
        Self { registry, scope }
    }

    pub fn scope(&self) -> &InstrumentationScope {
        &self.scope
    }

    /// A monotonic sum instrument.
    pub fn counter(&self, descriptor: impl Into<InstrumentDescriptor>) -> Counter {
        Counter(self.sync_instrument(InstrumentKind::Counter, descriptor.into()))
    }

    /// A sum instrument accepting negative increments.
    pub fn up_down_counter(&self, descriptor: impl Into<InstrumentDescriptor>) -> UpDownCounter {
        UpDownCounter(self.sync_instrument(InstrumentKind::UpDownCounter, descriptor.into()))
    }

    /// A distribution instrument.
    pub fn histogram(&self, descriptor: impl Into<InstrumentDescriptor>) -> Histogram {
        Histogram(self.sync_instrument(InstrumentKind::Histogram, descriptor.into()))
    }

    /// A monotonic sum observed through a callback at collection time.
    pub fn observable_counter<F>(&self, descriptor: impl Into<InstrumentDescriptor>, callback: F)
    where
        F: Fn(&Observer) + Send + Sync + 'static,
    {
        self.observable_instrument(InstrumentKind::ObservableCounter, descriptor.into(), callback);
    }

    /// A non-monotonic sum observed through a callback at collection time.
    pub fn observable_up_down_counter<F>(
        &self,
        descriptor: impl Into<InstrumentDescriptor>,
        callback: F,
    ) where
        F: Fn(&Observer) + Send + Sync + 'static,
    {
        self.observable_instrument(
            InstrumentKind::ObservableUpDownCounter,
            descriptor.into(),
            callback,
        );
    }

    /// A point-in-time value observed through a callback at collection time.
    pub fn observable_gauge<F>(&self, descriptor: impl Into<InstrumentDescriptor>, callback: F)
    where
        F: Fn(&Observer) + Send + Sync + 'static,
    {
        self.observable_instrument(InstrumentKind::ObservableGauge, descriptor.into(), callback);
    }

    fn sync_instrument(
        &self,
        kind: InstrumentKind,
        descriptor: InstrumentDescriptor,
    ) -> InstrumentHandle {
        let instrument = self
            .registry
            .register_instrument(kind, descriptor, self.scope.clone());
        InstrumentHandle {
            instrument,
            view_aggregations: self.registry.view_aggregations(),
            metrics: self.registry.metrics_table(),
        }
    }

    fn observable_instrument<F>(
        &self,
        kind: InstrumentKind,
        descriptor: InstrumentDescriptor,
        callback: F,
    ) where
        F: Fn(&Observer) + Send + Sync + 'static,
    {
        let instrument = self
            .registry
            .register_instrument(kind, descriptor, self.scope.clone());
        self.registry.register_callback(instrument, Box::new(callback));
    }
}

/// Shared plumbing behind every sync instrument handle.
#[derive(Clone)]
struct InstrumentHandle {
    instrument: Arc<Instrument>,
    view_aggregations: Arc<ViewAggregations>,
    metrics: Arc<MetricsTable>,
}

impl InstrumentHandle {
    /// Applies one measurement under every reader's view of this instrument.
    fn record(&self, value: f64, attributes: AttributeSet) {
        for view in self.view_aggregations.for_instrument(self.instrument.id) {
            self.metrics.record(&view, attributes.clone(), value);
        }
    }
}

/// Synchronous monotonic sum instrument.
#[derive(Clone)]
pub struct Counter(InstrumentHandle);

impl Counter {
    /// Adds a non-negative increment. Negative values are discarded.
    pub fn add(&self, value: f64, attributes: AttributeSet) {
        if value < 0.0 {
            tracing::warn!(
                instrument = %self.0.instrument.name,
                value,
                "negative increment discarded by monotonic counter"
            );
            return;
        }
        self.0.record(value, attributes);
    }
}

/// Synchronous sum instrument accepting negative increments.
#[derive(Clone)]
pub struct UpDownCounter(InstrumentHandle);

impl UpDownCounter {
    pub fn add(&self, value: f64, attributes: AttributeSet) {
        self.0.record(value, attributes);
    }
}

/// Synchronous distribution instrument.
#[derive(Clone)]
pub struct Histogram(InstrumentHandle);

impl Histogram {
    pub fn record(&self, value: f64, attributes: AttributeSet) {
        self.0.record(value, attributes);
    }
}
