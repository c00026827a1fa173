use crate::buffer::SpanBatch;
use crate::metrics::MetricRecord;
use crate::resource::Resource;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Error types for telemetry export operations
#[derive(Debug, Error, Clone)]
pub enum ExportError {
    /// Transport-layer error (network, gRPC, HTTP)
    #[error("transport error: {0}")]
    Transport(String),
    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Export operation timed out
    #[error("export operation timed out")]
    Timeout,
    /// Backend rejected the payload; retrying cannot succeed
    #[error("payload rejected: {0}")]
    Rejected(String),
}

impl ExportError {
    /// Returns `true` if retrying this export could succeed.
    ///
    /// The batch processor treats non-retryable failures as completion and
    /// discards the batch.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout)
    }
}

/// Trait for exporting telemetry to various backends.
///
/// Uses native async fn in traits (Rust 2024 edition) instead of
/// `#[async_trait]`.
///
/// # Note on Object Safety
///
/// This trait uses `impl Future` return types which are not object-safe.
/// For dynamic dispatch, use [`ExporterHandle`] / `dyn TelemetryExporterBoxed`.
pub trait TelemetryExporter: Send + Sync {
    /// Exports a batch of finished spans.
    fn export_spans(
        &self,
        batch: SpanBatch,
        resource: &Resource,
    ) -> impl Future<Output = Result<(), ExportError>> + Send;

    /// Exports one collection pass worth of metrics.
    fn export_metrics(
        &self,
        metrics: Vec<MetricRecord>,
        resource: &Resource,
    ) -> impl Future<Output = Result<(), ExportError>> + Send;

    /// Releases backend connections. Called on replacement and shutdown.
    fn shutdown(&self) -> impl Future<Output = ()> + Send;

    /// Returns the exporter name for logging and debugging.
    fn name(&self) -> &str;
}

/// Object-safe version of [`TelemetryExporter`] for dynamic dispatch.
///
/// This trait uses `Pin<Box<dyn Future>>` to allow `dyn TelemetryExporterBoxed`.
pub trait TelemetryExporterBoxed: Send + Sync {
    fn export_spans_boxed<'a>(
        &'a self,
        batch: SpanBatch,
        resource: &'a Resource,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + 'a>>;

    fn export_metrics_boxed<'a>(
        &'a self,
        metrics: Vec<MetricRecord>,
        resource: &'a Resource,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + 'a>>;

    fn shutdown_boxed(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    fn name(&self) -> &str;
}

/// Blanket implementation: any TelemetryExporter can be used boxed
impl<T: TelemetryExporter> TelemetryExporterBoxed for T {
    fn export_spans_boxed<'a>(
        &'a self,
        batch: SpanBatch,
        resource: &'a Resource,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + 'a>> {
        Box::pin(self.export_spans(batch, resource))
    }

    fn export_metrics_boxed<'a>(
        &'a self,
        metrics: Vec<MetricRecord>,
        resource: &'a Resource,
    ) -> Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + 'a>> {
        Box::pin(self.export_metrics(metrics, resource))
    }

    fn shutdown_boxed(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.shutdown())
    }

    fn name(&self) -> &str {
        TelemetryExporter::name(self)
    }
}

/// Shared handle to a dynamically dispatched exporter.
pub type ExporterHandle = Arc<dyn TelemetryExporterBoxed>;

/// Stdout exporter for testing and debugging
pub struct StdoutExporter {
    verbose: bool,
}

impl StdoutExporter {
    /// Creates a new stdout exporter
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl TelemetryExporter for StdoutExporter {
    async fn export_spans(&self, batch: SpanBatch, _resource: &Resource) -> Result<(), ExportError> {
        if self.verbose {
            println!("=== Exporting {} spans ===", batch.len());
            for group in &batch.groups {
                println!("Scope: {}", group.scope.name);
                for span in &group.spans {
                    println!(
                        "  Span: trace_id={:032x} span_id={:016x} name={} duration={}ns status={:?}",
                        span.trace_id,
                        span.span_id,
                        span.name,
                        span.duration_nanos(),
                        span.status
                    );
                }
            }
            println!("=== Export complete ===\n");
        }
        Ok(())
    }

    async fn export_metrics(
        &self,
        metrics: Vec<MetricRecord>,
        _resource: &Resource,
    ) -> Result<(), ExportError> {
        if self.verbose {
            println!("=== Exporting {} metrics ===", metrics.len());
            for record in &metrics {
                println!("  Metric: name={} unit={} data={:?}", record.name, record.unit, record.data);
            }
            println!("=== Export complete ===\n");
        }
        Ok(())
    }

    async fn shutdown(&self) {}

    fn name(&self) -> &str {
        "stdout"
    }
}

/// JSON-lines file exporter for local development
pub struct JsonFileExporter {
    file_path: String,
}

impl JsonFileExporter {
    /// Creates a new JSON file exporter appending to the given path
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
        }
    }

    async fn append_line(&self, mut line: String) -> Result<(), ExportError> {
        use tokio::io::AsyncWriteExt;

        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| ExportError::Transport(e.to_string()))
    }
}

impl TelemetryExporter for JsonFileExporter {
    async fn export_spans(&self, batch: SpanBatch, _resource: &Resource) -> Result<(), ExportError> {
        let json = serde_json::to_string(&batch.groups)
            .map_err(|e| ExportError::Serialization(e.to_string()))?;
        self.append_line(json).await
    }

    async fn export_metrics(
        &self,
        metrics: Vec<MetricRecord>,
        _resource: &Resource,
    ) -> Result<(), ExportError> {
        let json = serde_json::to_string(&metrics)
            .map_err(|e| ExportError::Serialization(e.to_string()))?;
        self.append_line(json).await
    }

    async fn shutdown(&self) {}

    fn name(&self) -> &str {
        "json_file"
    }
}

/// Noop exporter that discards all telemetry (for benchmarking)
pub struct NoopExporter;

impl NoopExporter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NoopExporter {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryExporter for NoopExporter {
    async fn export_spans(&self, _batch: SpanBatch, _resource: &Resource) -> Result<(), ExportError> {
        Ok(())
    }

    async fn export_metrics(
        &self,
        _metrics: Vec<MetricRecord>,
        _resource: &Resource,
    ) -> Result<(), ExportError> {
        Ok(())
    }

    async fn shutdown(&self) {}

    fn name(&self) -> &str {
        "noop"
    }
}

/// Test exporter that records all exported telemetry for verification
#[cfg(test)]
pub(crate) struct RecordingExporter {
    batches: std::sync::Mutex<Vec<SpanBatch>>,
    metrics: std::sync::Mutex<Vec<Vec<MetricRecord>>>,
    shutdowns: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
impl RecordingExporter {
    pub(crate) fn new() -> Self {
        Self {
            batches: std::sync::Mutex::new(Vec::new()),
            metrics: std::sync::Mutex::new(Vec::new()),
            shutdowns: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub(crate) fn exported_span_count(&self) -> usize {
        self.batches.lock().unwrap().iter().map(|b| b.len()).sum()
    }

    pub(crate) fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }

    pub(crate) fn all_span_ids(&self) -> Vec<u64> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flat_map(|b| b.iter().map(|s| s.span_id).collect::<Vec<_>>())
            .collect()
    }

    pub(crate) fn metric_passes(&self) -> Vec<Vec<MetricRecord>> {
        self.metrics.lock().unwrap().clone()
    }

    pub(crate) fn shutdown_count(&self) -> u32 {
        self.shutdowns.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
impl TelemetryExporter for RecordingExporter {
    async fn export_spans(&self, batch: SpanBatch, _resource: &Resource) -> Result<(), ExportError> {
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }

    async fn export_metrics(
        &self,
        metrics: Vec<MetricRecord>,
        _resource: &Resource,
    ) -> Result<(), ExportError> {
        self.metrics.lock().unwrap().push(metrics);
        Ok(())
    }

    async fn shutdown(&self) {
        self.shutdowns
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Slow exporter for timeout and backpressure testing
#[cfg(test)]
pub(crate) struct SlowExporter {
    delay: std::time::Duration,
    batches: std::sync::Mutex<Vec<SpanBatch>>,
}

#[cfg(test)]
impl SlowExporter {
    pub(crate) fn new(delay: std::time::Duration) -> Self {
        Self {
            delay,
            batches: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn exported_span_count(&self) -> usize {
        self.batches.lock().unwrap().iter().map(|b| b.len()).sum()
    }
}

#[cfg(test)]
impl TelemetryExporter for SlowExporter {
    async fn export_spans(&self, batch: SpanBatch, _resource: &Resource) -> Result<(), ExportError> {
        tokio::time::sleep(self.delay).await;
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }

    async fn export_metrics(
        &self,
        _metrics: Vec<MetricRecord>,
        _resource: &Resource,
    ) -> Result<(), ExportError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    async fn shutdown(&self) {}

    fn name(&self) -> &str {
        "slow"
    }
}

/// Exporter that always fails, for failure-path testing
#[cfg(test)]
pub(crate) struct FailingExporter {
    retryable: bool,
    attempts: std::sync::atomic::AtomicU32,
}

#[cfg(test)]
impl FailingExporter {
    pub(crate) fn new(retryable: bool) -> Self {
        Self {
            retryable,
            attempts: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempts.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn error(&self) -> ExportError {
        if self.retryable {
            ExportError::Transport("simulated failure".into())
        } else {
            ExportError::Rejected("simulated rejection".into())
        }
    }
}

#[cfg(test)]
impl TelemetryExporter for FailingExporter {
    async fn export_spans(&self, _batch: SpanBatch, _resource: &Resource) -> Result<(), ExportError> {
        self.attempts
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Err(self.error())
    }

    async fn export_metrics(
        &self,
        _metrics: Vec<MetricRecord>,
        _resource: &Resource,
    ) -> Result<(), ExportError> {
        self.attempts
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Err(self.error())
    }

    async fn shutdown(&self) {}

    fn name(&self) -> &str {
        "failing"
    }
}
