//! Concurrent span buffers keyed by instrumentation scope.
//!
//! The batch processor keeps exactly one buffer *active* at a time. Producers
//! append into the active buffer from arbitrary threads; on export the
//! processor installs a fresh buffer and hands the old one to a runner, which
//! drains it once no producer still holds a reference to it.

use crate::span::{InstrumentationScope, SpanRecord};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

/// A multi-writer append-only collection of finished spans.
///
/// Spans are grouped by [`InstrumentationScope`]; within a group, insertion
/// order is preserved. The entry count is cached in an atomic so that the
/// queue-limit check on the ingest hot path is allocation-free.
#[derive(Debug, Default)]
pub struct SpanBuffer {
    groups: DashMap<InstrumentationScope, Vec<SpanRecord>>,
    len: AtomicUsize,
}

impl SpanBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a finished span under its instrumentation scope.
    pub fn append(&self, span: SpanRecord) {
        self.groups
            .entry(span.scope.clone())
            .or_default()
            .push(span);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the cached entry count.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drains every span into a batch, grouped by scope.
    ///
    /// Intra-group insertion order is preserved; group order is unspecified.
    /// Callers must hold the only reference to the buffer (the runner waits
    /// for quiescence first), so no append races with the drain.
    pub fn drain(&self) -> SpanBatch {
        let keys: Vec<InstrumentationScope> =
            self.groups.iter().map(|entry| entry.key().clone()).collect();

        let mut batch = SpanBatch::new();
        for key in keys {
            if let Some((scope, spans)) = self.groups.remove(&key) {
                self.len.fetch_sub(spans.len(), Ordering::Relaxed);
                batch.groups.push(ScopeSpans { scope, spans });
            }
        }
        batch
    }
}

/// The spans of one instrumentation scope within a batch.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ScopeSpans {
    pub scope: InstrumentationScope,
    pub spans: Vec<SpanRecord>,
}

/// A drained buffer's contents, ready for export.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SpanBatch {
    pub groups: Vec<ScopeSpans>,
    /// Batch creation timestamp
    #[serde(skip)]
    pub timestamp: SystemTime,
}

impl SpanBatch {
    pub fn new() -> Self {
        Self {
            groups: Vec::new(),
            timestamp: SystemTime::now(),
        }
    }

    /// Total number of spans across all scope groups.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.spans.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(|g| g.spans.is_empty())
    }

    /// Iterates all spans in the batch, group by group.
    pub fn iter(&self) -> impl Iterator<Item = &SpanRecord> {
        self.groups.iter().flat_map(|g| g.spans.iter())
    }
}

impl Default for SpanBatch {
    fn default() -> Self {
        Self::new()
    }
}
