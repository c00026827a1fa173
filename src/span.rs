use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::SystemTime;

/// Returns the current wall-clock time as Unix nanoseconds.
pub(crate) fn unix_nanos_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// A finished (or in-flight) trace span as seen by the pipeline.
///
/// The pipeline preserves these fields end to end; it attaches no meaning to
/// them beyond grouping by [`InstrumentationScope`] and filtering on the
/// `sampled` flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanRecord {
    /// Unique trace identifier (128-bit)
    pub trace_id: u128,
    /// Unique span identifier (64-bit)
    pub span_id: u64,
    /// Parent span identifier (0 if root span)
    pub parent_span_id: u64,
    /// Operation name
    pub name: String,
    /// Span start time (Unix nanoseconds)
    pub start_time: u64,
    /// Span end time (Unix nanoseconds)
    pub end_time: u64,
    /// Span status
    pub status: SpanStatus,
    /// Span kind
    pub kind: SpanKind,
    /// Span attributes (boxed to keep SpanRecord size manageable)
    pub attributes: Box<HashMap<String, AttributeValue>>,
    /// Timestamped events recorded on the span
    pub events: Vec<SpanEvent>,
    /// Links to related spans in other traces
    pub links: Vec<SpanLink>,
    /// Library/module that emitted this span; the export grouping key
    pub scope: InstrumentationScope,
    /// Sampling decision attached at span start
    pub sampled: bool,
}

/// A timestamped event attached to a span.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    /// Event time (Unix nanoseconds)
    pub timestamp: u64,
    pub attributes: HashMap<String, AttributeValue>,
}

/// A link from one span to a span in another trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanLink {
    pub trace_id: u128,
    pub span_id: u64,
    pub attributes: HashMap<String, AttributeValue>,
}

/// Attribute value types for span and metric metadata.
///
/// Equality and hashing are total: floats compare by bit pattern so values
/// can key metric datapoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<String>),
}

impl PartialEq for AttributeValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Int(a), Self::Int(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a.to_bits() == b.to_bits(),
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for AttributeValue {}

impl Hash for AttributeValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        core::mem::discriminant(self).hash(state);
        match self {
            Self::String(s) => s.hash(state),
            Self::Int(i) => i.hash(state),
            Self::Float(f) => f.to_bits().hash(state),
            Self::Bool(b) => b.hash(state),
            Self::Array(a) => a.hash(state),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<i64> for AttributeValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for AttributeValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for AttributeValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

/// Span execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanStatus {
    /// Span completed successfully
    Ok,
    /// Span completed with error
    Error,
    /// Span status unknown
    Unset,
}

/// Span kind according to OpenTelemetry conventions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    /// Internal operation span
    Internal,
    /// Server-side RPC span
    Server,
    /// Client-side RPC span
    Client,
    /// Producer span (messaging)
    Producer,
    /// Consumer span (messaging)
    Consumer,
}

/// The library/module that emitted a piece of telemetry.
///
/// Used as the span buffer key, so exports arrive grouped by scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentationScope {
    pub name: String,
    pub version: Option<String>,
    pub schema_url: Option<String>,
}

impl InstrumentationScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
            schema_url: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_schema_url(mut self, url: impl Into<String>) -> Self {
        self.schema_url = Some(url.into());
        self
    }
}

/// A normalized set of attributes usable as a metric datapoint key.
///
/// Pairs are sorted by key and deduplicated (last write wins), so two sets
/// built from the same pairs in any order compare and hash equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttributeSet(Vec<(String, AttributeValue)>);

impl AttributeSet {
    /// The empty attribute set.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn new(pairs: impl IntoIterator<Item = (String, AttributeValue)>) -> Self {
        let mut pairs: Vec<_> = pairs.into_iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        // Last write wins on duplicate keys
        pairs.reverse();
        pairs.dedup_by(|a, b| a.0 == b.0);
        pairs.reverse();
        Self(pairs)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.0
            .binary_search_by(|(k, _)| k.as_str().cmp(key))
            .ok()
            .map(|i| &self.0[i].1)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<AttributeValue>> FromIterator<(K, V)> for AttributeSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::new(iter.into_iter().map(|(k, v)| (k.into(), v.into())))
    }
}

impl SpanRecord {
    /// Creates a new sampled span with start and end set to now.
    pub fn new(
        trace_id: u128,
        span_id: u64,
        parent_span_id: u64,
        name: impl Into<String>,
        scope: InstrumentationScope,
    ) -> Self {
        let now = unix_nanos_now();
        Self {
            trace_id,
            span_id,
            parent_span_id,
            name: name.into(),
            start_time: now,
            end_time: now,
            status: SpanStatus::Unset,
            kind: SpanKind::Internal,
            attributes: Box::new(HashMap::new()),
            events: Vec::new(),
            links: Vec::new(),
            scope,
            sampled: true,
        }
    }

    /// Sets the sampling decision.
    pub fn with_sampled(mut self, sampled: bool) -> Self {
        self.sampled = sampled;
        self
    }

    /// Sets the span kind.
    pub fn with_kind(mut self, kind: SpanKind) -> Self {
        self.kind = kind;
        self
    }

    /// Marks the span as completed with the given status.
    pub fn finish(&mut self, status: SpanStatus) {
        self.end_time = unix_nanos_now();
        self.status = status;
    }

    /// Adds an attribute to the span.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Records a timestamped event on the span.
    pub fn add_event(&mut self, name: impl Into<String>) {
        self.events.push(SpanEvent {
            name: name.into(),
            timestamp: unix_nanos_now(),
            attributes: HashMap::new(),
        });
    }

    /// Links this span to a span in another trace.
    pub fn add_link(&mut self, trace_id: u128, span_id: u64) {
        self.links.push(SpanLink {
            trace_id,
            span_id,
            attributes: HashMap::new(),
        });
    }

    /// Duration of the span in nanoseconds.
    pub fn duration_nanos(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }
}
