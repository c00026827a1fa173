//! Batch Span Processor.
//!
//! A bounded in-memory pipeline stage between instrumented code and a span
//! exporter. Producers hand finished spans to [`BatchSpanProcessor::on_end`]
//! from arbitrary threads; a single control task owns the export schedule and
//! alternates between `idle` and `exporting`. On export the control task
//! atomically swaps in a fresh active buffer and hands the full one to a
//! transient runner task, so producers never wait on exporter progress.
//!
//! Swap ordering: the new active-buffer pointer is published *before* ingest
//! is re-enabled, and producers re-read the pointer on every insert, so any
//! producer that observes `enabled` also observes the new buffer.

use crate::buffer::SpanBuffer;
use crate::exporter::ExporterHandle;
use crate::invariants::{
    debug_assert_handoff_quiescent, debug_assert_single_terminal_flush,
    debug_assert_swap_installs_empty,
};
use crate::resource::Resource;
use crate::span::SpanRecord;
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};

/// Configuration for the batch span processor
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Upper bound on active-buffer entries before ingest is disabled
    pub max_queue_size: usize,
    /// Interval between automatic exports
    pub scheduled_delay: Duration,
    /// Hard cap on a single export's duration
    pub exporting_timeout: Duration,
    /// Interval for the size-threshold check
    pub size_check_interval: Duration,
    /// Process resource attached to every export; detected when absent
    pub resource: Option<Resource>,
    /// Identifier for addressing this processor; fresh unique token when absent
    pub name: Option<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 2048,
            scheduled_delay: Duration::from_millis(5000),
            exporting_timeout: Duration::from_millis(300_000),
            size_check_interval: Duration::from_millis(1000),
            resource: None,
            name: None,
        }
    }
}

/// Why a span was dropped rather than buffered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The span's sampling decision was negative
    NotSampled,
    /// Ingest is disabled (queue full or no exporter configured)
    Disabled,
    /// The active buffer is at `max_queue_size`
    QueueFull,
}

/// Error types for span ingest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IngestError {
    /// The active buffer does not exist (shutdown race)
    #[error("no export buffer")]
    NoExportBuffer,
    /// The processor's control task has terminated
    #[error("processor terminated")]
    Terminated,
}

/// Result of handing a finished span to the processor.
///
/// `Dropped` is a policy outcome, not an error; only `Failed` indicates the
/// processor could not serve the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnEnd {
    /// The span was appended to the active buffer
    Accepted,
    /// The span was discarded by policy
    Dropped(DropReason),
    /// The processor could not accept the span
    Failed(IngestError),
}

impl OnEnd {
    #[inline]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted)
    }

    #[inline]
    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped(_))
    }
}

/// Pipeline self-metrics for one processor (thread-safe, statistics only)
//
// All counters use `Ordering::Relaxed`: no control flow depends on them and
// slightly stale reads are acceptable for observability.
#[derive(Debug, Default)]
pub struct ProcessorMetrics {
    /// Spans appended to the active buffer
    pub spans_accepted: AtomicU64,
    /// Spans discarded by policy (unsampled, disabled, queue full)
    pub spans_dropped: AtomicU64,
    /// Spans delivered to an exporter that reported success
    pub spans_exported: AtomicU64,
    /// Export runners spawned
    pub exports_started: AtomicU64,
    /// Export runners that reported completion
    pub exports_completed: AtomicU64,
    /// Exports that returned an error (retryable or not)
    pub export_failures: AtomicU64,
    /// Export runners forcibly terminated at the timeout
    pub exports_timed_out: AtomicU64,
}

impl ProcessorMetrics {
    pub fn spans_accepted(&self) -> u64 {
        self.spans_accepted.load(Ordering::Relaxed)
    }

    pub fn spans_dropped(&self) -> u64 {
        self.spans_dropped.load(Ordering::Relaxed)
    }

    pub fn spans_exported(&self) -> u64 {
        self.spans_exported.load(Ordering::Relaxed)
    }

    pub fn exports_started(&self) -> u64 {
        self.exports_started.load(Ordering::Relaxed)
    }

    pub fn exports_completed(&self) -> u64 {
        self.exports_completed.load(Ordering::Relaxed)
    }

    pub fn export_failures(&self) -> u64 {
        self.export_failures.load(Ordering::Relaxed)
    }

    pub fn exports_timed_out(&self) -> u64 {
        self.exports_timed_out.load(Ordering::Relaxed)
    }
}

/// State shared between producer threads and the control task.
struct Shared {
    /// Whether `on_end` accepts new spans
    enabled: AtomicBool,
    /// The buffer currently accepting writes; `None` after teardown
    active: ArcSwapOption<SpanBuffer>,
    metrics: ProcessorMetrics,
    max_queue_size: usize,
}

/// Control messages from the public handle to the control task.
enum Control {
    ForceFlush,
    SetExporter(Option<ExporterHandle>),
    Shutdown(oneshot::Sender<()>),
}

static PROCESSOR_SEQ: AtomicU64 = AtomicU64::new(0);

fn fresh_processor_name() -> String {
    format!(
        "batch-span-processor-{}",
        PROCESSOR_SEQ.fetch_add(1, Ordering::Relaxed)
    )
}

/// Batch span processor handle.
///
/// Cheap to share behind an `Arc`; `on_end` is safe to call from arbitrary
/// producer threads at high frequency and never blocks on export progress.
pub struct BatchSpanProcessor {
    shared: Arc<Shared>,
    control_tx: mpsc::UnboundedSender<Control>,
    worker: Option<JoinHandle<()>>,
    name: Arc<str>,
}

impl BatchSpanProcessor {
    /// Creates a processor and spawns its control task.
    ///
    /// `exporter` may be absent; the first scheduled export will then tear
    /// down the buffer and disable ingest until [`set_exporter`] supplies one.
    ///
    /// [`set_exporter`]: Self::set_exporter
    pub async fn new(config: BatchConfig, exporter: Option<ExporterHandle>) -> Self {
        let name: Arc<str> = config
            .name
            .clone()
            .unwrap_or_else(fresh_processor_name)
            .into();
        let resource = Arc::new(config.resource.clone().unwrap_or_else(Resource::detect));

        let shared = Arc::new(Shared {
            enabled: AtomicBool::new(true),
            active: ArcSwapOption::from_pointee(SpanBuffer::new()),
            metrics: ProcessorMetrics::default(),
            max_queue_size: config.max_queue_size,
        });

        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            shared: Arc::clone(&shared),
            config,
            resource,
            exporter,
            pending_exporter: None,
            control_rx,
            name: Arc::clone(&name),
            pending_flush: false,
            pending_tick: false,
            terminal_flushed: false,
        };
        let worker = Some(tokio::spawn(worker.run()));

        Self {
            shared,
            control_tx,
            worker,
            name,
        }
    }

    /// Returns this processor's addressing name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Span-start hook. No buffering happens at start; the span passes
    /// through unchanged.
    pub fn on_start(&self, span: SpanRecord) -> SpanRecord {
        span
    }

    /// Hands a finished span to the processor.
    ///
    /// The active-buffer pointer is re-read on every call; a cached pointer
    /// would let a producer write into a buffer already handed to a runner.
    pub fn on_end(&self, span: SpanRecord) -> OnEnd {
        if !span.sampled {
            self.shared.metrics.spans_dropped.fetch_add(1, Ordering::Relaxed);
            return OnEnd::Dropped(DropReason::NotSampled);
        }
        if !self.shared.enabled.load(Ordering::Acquire) {
            self.shared.metrics.spans_dropped.fetch_add(1, Ordering::Relaxed);
            return OnEnd::Dropped(DropReason::Disabled);
        }
        let Some(buffer) = self.shared.active.load_full() else {
            return OnEnd::Failed(IngestError::NoExportBuffer);
        };
        if buffer.len() >= self.shared.max_queue_size {
            self.shared.metrics.spans_dropped.fetch_add(1, Ordering::Relaxed);
            return OnEnd::Dropped(DropReason::QueueFull);
        }
        buffer.append(span);
        self.shared.metrics.spans_accepted.fetch_add(1, Ordering::Relaxed);
        OnEnd::Accepted
    }

    /// Requests an immediate export. Non-blocking beyond the enqueue; if the
    /// processor is already exporting, exactly one additional export follows
    /// the current one.
    pub fn force_flush(&self) -> Result<(), IngestError> {
        self.control_tx
            .send(Control::ForceFlush)
            .map_err(|_| IngestError::Terminated)
    }

    /// Replaces the exporter at runtime.
    ///
    /// The previous exporter is shut down, ingest is re-enabled immediately,
    /// and the new exporter is activated on the next export attempt.
    pub fn set_exporter(&self, exporter: Option<ExporterHandle>) -> Result<(), IngestError> {
        self.control_tx
            .send(Control::SetExporter(exporter))
            .map_err(|_| IngestError::Terminated)
    }

    /// Gracefully shuts down the processor, performing a final blocking
    /// export of the active buffer's contents.
    ///
    /// Dropping the handle without calling this performs the same terminal
    /// flush in the background.
    pub async fn shutdown(mut self) -> Result<(), IngestError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.control_tx
            .send(Control::Shutdown(ack_tx))
            .map_err(|_| IngestError::Terminated)?;
        ack_rx.await.map_err(|_| IngestError::Terminated)?;
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
        Ok(())
    }

    /// Returns the processor's self-metrics.
    pub fn metrics(&self) -> &ProcessorMetrics {
        &self.shared.metrics
    }
}

/// Control-flow outcome of a state handler.
enum Flow {
    Continue,
    Exit,
}

/// What ended the `exporting` state.
enum ExportingOutcome {
    RunnerDone,
    TimedOut,
    Shutdown(Option<oneshot::Sender<()>>),
}

/// The control task: a finite state machine alternating between `idle` and
/// `exporting`, serialising all transitions for one processor.
struct Worker {
    shared: Arc<Shared>,
    config: BatchConfig,
    resource: Arc<Resource>,
    /// Active exporter; `None` until the pending one is promoted
    exporter: Option<ExporterHandle>,
    /// Staged by `set_exporter`; promoted on the next export attempt so that
    /// exporter (re)initialisation is serialised with export attempts
    pending_exporter: Option<Option<ExporterHandle>>,
    control_rx: mpsc::UnboundedReceiver<Control>,
    name: Arc<str>,
    /// A force-flush arrived while exporting; serve one flush on idle entry
    pending_flush: bool,
    /// The export timer fired while exporting; serve on idle entry
    pending_tick: bool,
    terminal_flushed: bool,
}

impl Worker {
    async fn run(mut self) {
        let mut export_timer = interval_at(
            Instant::now() + self.config.scheduled_delay,
            self.config.scheduled_delay,
        );
        export_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut size_timer = interval_at(
            Instant::now() + self.config.size_check_interval,
            self.config.size_check_interval,
        );
        size_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Deferred events are served on idle entry, before blocking.
            if self.pending_flush || self.pending_tick {
                self.pending_flush = false;
                self.pending_tick = false;
                match self.begin_export(&mut export_timer, &mut size_timer).await {
                    Flow::Continue => continue,
                    Flow::Exit => return,
                }
            }

            tokio::select! {
                _ = export_timer.tick() => {
                    if let Flow::Exit = self.begin_export(&mut export_timer, &mut size_timer).await {
                        return;
                    }
                }
                _ = size_timer.tick() => self.size_check(),
                msg = self.control_rx.recv() => match msg {
                    Some(Control::ForceFlush) => {
                        if let Flow::Exit = self.begin_export(&mut export_timer, &mut size_timer).await {
                            return;
                        }
                    }
                    Some(Control::SetExporter(exporter)) => self.replace_exporter(exporter),
                    Some(Control::Shutdown(ack)) => {
                        self.terminal_flush().await;
                        let _ = ack.send(());
                        return;
                    }
                    // Handle dropped: same terminal flush, nobody to ack
                    None => {
                        self.terminal_flush().await;
                        return;
                    }
                },
            }
        }
    }

    /// `exporting` enter action: promote a staged exporter, swap buffers and
    /// spawn the runner, then serve the `exporting` state until the runner
    /// finishes or times out.
    async fn begin_export(
        &mut self,
        export_timer: &mut Interval,
        size_timer: &mut Interval,
    ) -> Flow {
        // Deferred exporter (re)initialisation happens only here, so it is
        // serialised with export attempts.
        if self.exporter.is_none() {
            if let Some(staged) = self.pending_exporter.take() {
                self.exporter = staged;
            }
        }
        let Some(exporter) = self.exporter.clone() else {
            // No exporter: tear down the buffer so spans stop accumulating.
            self.shared.enabled.store(false, Ordering::Release);
            if self.shared.active.swap(None).is_some() {
                tracing::debug!(
                    processor = %self.name,
                    "no exporter configured; active buffer cleared and ingest disabled"
                );
            }
            return Flow::Continue;
        };

        let old = match self.shared.active.load_full() {
            Some(buffer) if !buffer.is_empty() => buffer,
            Some(_) => return Flow::Continue,
            None => {
                // Buffer was torn down while no exporter was configured;
                // restore it now that one exists. Publish before enabling.
                let fresh = Arc::new(SpanBuffer::new());
                debug_assert_swap_installs_empty!(fresh.len());
                self.shared.active.store(Some(fresh));
                self.shared.enabled.store(true, Ordering::Release);
                return Flow::Continue;
            }
        };

        // Swap: publish the fresh buffer, then re-enable ingest. Producers
        // that observe enabled=true are guaranteed to observe the new pointer.
        let fresh = Arc::new(SpanBuffer::new());
        debug_assert_swap_installs_empty!(fresh.len());
        self.shared.active.store(Some(fresh));
        self.shared.enabled.store(true, Ordering::Release);

        self.shared
            .metrics
            .exports_started
            .fetch_add(1, Ordering::Relaxed);
        export_timer.reset();

        let (done_tx, done_rx) = oneshot::channel();
        let runner = tokio::spawn(run_export(
            old,
            exporter,
            Arc::clone(&self.resource),
            Arc::clone(&self.shared),
            Arc::clone(&self.name),
            done_tx,
        ));
        let deadline = Instant::now() + self.config.exporting_timeout;

        self.exporting(runner, done_rx, deadline, export_timer, size_timer)
            .await
    }

    /// The `exporting` state: waits for runner completion or the export
    /// timeout while deferring flush/timer events and still serving size
    /// checks and exporter replacement.
    async fn exporting(
        &mut self,
        runner: JoinHandle<()>,
        mut done_rx: oneshot::Receiver<()>,
        deadline: Instant,
        export_timer: &mut Interval,
        size_timer: &mut Interval,
    ) -> Flow {
        let outcome = loop {
            tokio::select! {
                // Completion or runner exit (sender dropped) both advance the FSM
                _ = &mut done_rx => break ExportingOutcome::RunnerDone,
                _ = sleep_until(deadline) => break ExportingOutcome::TimedOut,
                _ = export_timer.tick() => self.pending_tick = true,
                _ = size_timer.tick() => self.size_check(),
                msg = self.control_rx.recv() => match msg {
                    Some(Control::ForceFlush) => self.pending_flush = true,
                    Some(Control::SetExporter(exporter)) => self.replace_exporter(exporter),
                    Some(Control::Shutdown(ack)) => break ExportingOutcome::Shutdown(Some(ack)),
                    None => break ExportingOutcome::Shutdown(None),
                },
            }
        };

        match outcome {
            ExportingOutcome::RunnerDone => {
                let _ = runner.await;
                self.shared
                    .metrics
                    .exports_completed
                    .fetch_add(1, Ordering::Relaxed);
                Flow::Continue
            }
            ExportingOutcome::TimedOut => {
                self.abort_runner(runner);
                Flow::Continue
            }
            ExportingOutcome::Shutdown(ack) => {
                // Let the in-flight export finish within its deadline, then
                // flush whatever accumulated in the fresh buffer.
                tokio::select! {
                    _ = &mut done_rx => {
                        let _ = runner.await;
                        self.shared
                            .metrics
                            .exports_completed
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    _ = sleep_until(deadline) => self.abort_runner(runner),
                }
                self.terminal_flush().await;
                if let Some(ack) = ack {
                    let _ = ack.send(());
                }
                Flow::Exit
            }
        }
    }

    fn abort_runner(&self, runner: JoinHandle<()>) {
        runner.abort();
        self.shared
            .metrics
            .exports_timed_out
            .fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            processor = %self.name,
            timeout_ms = self.config.exporting_timeout.as_millis() as u64,
            "export exceeded timeout; runner terminated and batch dropped"
        );
    }

    /// Size-threshold check, run in any state. Never re-enables ingest while
    /// the active buffer is torn down.
    fn size_check(&self) {
        let Some(buffer) = self.shared.active.load_full() else {
            return;
        };
        if buffer.len() >= self.shared.max_queue_size {
            if self.shared.enabled.swap(false, Ordering::AcqRel) {
                tracing::debug!(
                    processor = %self.name,
                    queued = buffer.len(),
                    "span ingest disabled: queue full"
                );
            }
        } else {
            self.shared.enabled.store(true, Ordering::Release);
        }
    }

    /// Shuts down the current exporter, stages the new one, and re-enables
    /// ingest immediately. The staged exporter is promoted at the next
    /// export attempt.
    fn replace_exporter(&mut self, new: Option<ExporterHandle>) {
        if let Some(old) = self.exporter.take() {
            tracing::debug!(
                processor = %self.name,
                exporter = old.name(),
                "exporter replaced; shutting down previous exporter"
            );
            tokio::spawn(async move { old.shutdown_boxed().await });
        }
        self.pending_exporter = Some(new);

        // Restore the buffer if a previous exporter-less flush tore it down.
        // Publish the buffer before re-enabling ingest.
        if self.shared.active.load().is_none() {
            let fresh = Arc::new(SpanBuffer::new());
            debug_assert_swap_installs_empty!(fresh.len());
            self.shared.active.store(Some(fresh));
        }
        self.shared.enabled.store(true, Ordering::Release);
    }

    /// Terminal flush: stop ingest, take the active buffer out of service,
    /// export its contents synchronously, and shut the exporter down.
    async fn terminal_flush(&mut self) {
        debug_assert_single_terminal_flush!(self.terminal_flushed);
        self.terminal_flushed = true;

        self.shared.enabled.store(false, Ordering::Release);
        let buffer = self.shared.active.swap(None);

        if self.exporter.is_none() {
            if let Some(staged) = self.pending_exporter.take() {
                self.exporter = staged;
            }
        }
        let Some(exporter) = self.exporter.take() else {
            return;
        };

        if let Some(buffer) = buffer {
            wait_quiescent(&buffer).await;
            debug_assert_handoff_quiescent!(Arc::strong_count(&buffer));
            let batch = buffer.drain();
            if !batch.is_empty() {
                let span_count = batch.len() as u64;
                let export = exporter.export_spans_boxed(batch, &self.resource);
                match tokio::time::timeout(self.config.exporting_timeout, export).await {
                    Ok(Ok(())) => {
                        self.shared
                            .metrics
                            .spans_exported
                            .fetch_add(span_count, Ordering::Relaxed);
                    }
                    Ok(Err(e)) => {
                        self.shared
                            .metrics
                            .export_failures
                            .fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            processor = %self.name,
                            exporter = exporter.name(),
                            error = %e,
                            dropped_spans = span_count,
                            "terminal span export failed; batch dropped"
                        );
                    }
                    Err(_) => {
                        self.shared
                            .metrics
                            .exports_timed_out
                            .fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            processor = %self.name,
                            "terminal span export exceeded timeout; batch dropped"
                        );
                    }
                }
            }
        }
        exporter.shutdown_boxed().await;
    }
}

/// Waits until no producer holds a transient reference to the handed-off
/// buffer. Producers clone the active pointer only for the duration of one
/// append, so this settles as soon as in-flight appends complete.
async fn wait_quiescent(buffer: &Arc<SpanBuffer>) {
    let mut spins = 0u32;
    while Arc::strong_count(buffer) > 1 {
        spins += 1;
        if spins < 64 {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

/// The export runner: owns the handed-off buffer for the duration of one
/// export, drives the exporter synchronously, reports completion, and exits.
/// Exporter failures are logged here and never propagate; a non-retryable
/// failure is completion as far as the FSM is concerned.
async fn run_export(
    buffer: Arc<SpanBuffer>,
    exporter: ExporterHandle,
    resource: Arc<Resource>,
    shared: Arc<Shared>,
    name: Arc<str>,
    done_tx: oneshot::Sender<()>,
) {
    wait_quiescent(&buffer).await;
    debug_assert_handoff_quiescent!(Arc::strong_count(&buffer));

    let batch = buffer.drain();
    let span_count = batch.len() as u64;

    match exporter.export_spans_boxed(batch, &resource).await {
        Ok(()) => {
            shared
                .metrics
                .spans_exported
                .fetch_add(span_count, Ordering::Relaxed);
            tracing::debug!(
                processor = %name,
                exporter = exporter.name(),
                spans = span_count,
                "span batch exported"
            );
        }
        Err(e) => {
            shared
                .metrics
                .export_failures
                .fetch_add(1, Ordering::Relaxed);
            if e.is_retryable() {
                tracing::error!(
                    processor = %name,
                    exporter = exporter.name(),
                    error = %e,
                    dropped_spans = span_count,
                    "span export failed; batch dropped"
                );
            } else {
                tracing::warn!(
                    processor = %name,
                    exporter = exporter.name(),
                    error = %e,
                    dropped_spans = span_count,
                    "span export rejected by backend; batch discarded"
                );
            }
        }
    }

    let _ = done_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::{FailingExporter, RecordingExporter, SlowExporter};
    use crate::span::{InstrumentationScope, SpanRecord};

    fn span(span_id: u64) -> SpanRecord {
        SpanRecord::new(1, span_id, 0, format!("op-{}", span_id), InstrumentationScope::new("test"))
    }

    fn quick_config() -> BatchConfig {
        BatchConfig {
            scheduled_delay: Duration::from_millis(50),
            size_check_interval: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_unsampled_spans_never_reach_exporter() {
        let exporter = Arc::new(RecordingExporter::new());
        let processor =
            BatchSpanProcessor::new(quick_config(), Some(exporter.clone() as ExporterHandle)).await;

        let result = processor.on_end(span(1).with_sampled(false));
        assert_eq!(result, OnEnd::Dropped(DropReason::NotSampled));

        processor.force_flush().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(exporter.exported_span_count(), 0);
        processor.shutdown().await.unwrap();
        assert_eq!(exporter.exported_span_count(), 0);
    }

    #[tokio::test]
    async fn test_timer_flush_delivers_all_spans() {
        let exporter = Arc::new(RecordingExporter::new());
        let processor =
            BatchSpanProcessor::new(quick_config(), Some(exporter.clone() as ExporterHandle)).await;

        for i in 0..10 {
            assert!(processor.on_end(span(i)).is_accepted());
        }

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(exporter.exported_span_count(), 10);
        assert_eq!(processor.metrics().spans_exported(), 10);
        processor.shutdown().await.unwrap();
        // No duplicates from the terminal flush
        assert_eq!(exporter.exported_span_count(), 10);
    }

    #[tokio::test]
    async fn test_queue_limit_drops_then_recovers() {
        let exporter = Arc::new(RecordingExporter::new());
        let config = BatchConfig {
            max_queue_size: 2,
            scheduled_delay: Duration::from_millis(50),
            ..Default::default()
        };
        let processor =
            BatchSpanProcessor::new(config, Some(exporter.clone() as ExporterHandle)).await;

        assert!(processor.on_end(span(1)).is_accepted());
        assert!(processor.on_end(span(2)).is_accepted());
        assert_eq!(processor.on_end(span(3)), OnEnd::Dropped(DropReason::QueueFull));

        // After the scheduled export drains the buffer, ingest recovers.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(processor.on_end(span(4)).is_accepted());
        assert_eq!(processor.metrics().spans_dropped(), 1);
        processor.shutdown().await.unwrap();
        let ids = exporter.all_span_ids();
        assert!(ids.contains(&1) && ids.contains(&2) && ids.contains(&4));
        assert!(!ids.contains(&3));
    }

    #[tokio::test]
    async fn test_force_flush_exports_immediately() {
        let exporter = Arc::new(RecordingExporter::new());
        let config = BatchConfig {
            scheduled_delay: Duration::from_secs(60),
            ..Default::default()
        };
        let processor =
            BatchSpanProcessor::new(config, Some(exporter.clone() as ExporterHandle)).await;

        processor.on_end(span(1));
        processor.force_flush().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(exporter.exported_span_count(), 1);
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_force_flush_while_exporting_coalesces() {
        let exporter = Arc::new(SlowExporter::new(Duration::from_millis(100)));
        let config = BatchConfig {
            scheduled_delay: Duration::from_secs(60),
            ..Default::default()
        };
        let processor =
            BatchSpanProcessor::new(config, Some(exporter.clone() as ExporterHandle)).await;

        processor.on_end(span(1));
        processor.force_flush().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Several flush requests while the first export is still running
        processor.on_end(span(2));
        processor.force_flush().unwrap();
        processor.force_flush().unwrap();
        processor.force_flush().unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(exporter.exported_span_count(), 2);
        // One export for span 1, exactly one deferred export for span 2
        assert_eq!(processor.metrics().exports_started(), 2);
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_export_timeout_recovers() {
        let exporter = Arc::new(SlowExporter::new(Duration::from_millis(500)));
        let config = BatchConfig {
            scheduled_delay: Duration::from_millis(30),
            exporting_timeout: Duration::from_millis(60),
            ..Default::default()
        };
        let processor =
            BatchSpanProcessor::new(config, Some(exporter.clone() as ExporterHandle)).await;

        processor.on_end(span(1));
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(processor.metrics().exports_timed_out(), 1);
        assert_eq!(exporter.exported_span_count(), 0, "timed-out batch is lost");

        // The processor is back in idle with a fresh buffer.
        assert!(processor.on_end(span(2)).is_accepted());
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_performs_terminal_flush() {
        let exporter = Arc::new(RecordingExporter::new());
        let config = BatchConfig {
            scheduled_delay: Duration::from_secs(60),
            ..Default::default()
        };
        let processor =
            BatchSpanProcessor::new(config, Some(exporter.clone() as ExporterHandle)).await;

        for i in 0..5 {
            processor.on_end(span(i));
        }
        processor.shutdown().await.unwrap();

        assert_eq!(exporter.exported_span_count(), 5);
        assert_eq!(exporter.shutdown_count(), 1);
    }

    #[tokio::test]
    async fn test_drop_triggers_background_terminal_flush() {
        let exporter = Arc::new(RecordingExporter::new());
        let config = BatchConfig {
            scheduled_delay: Duration::from_secs(60),
            ..Default::default()
        };
        let processor =
            BatchSpanProcessor::new(config, Some(exporter.clone() as ExporterHandle)).await;

        processor.on_end(span(1));
        drop(processor);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(exporter.exported_span_count(), 1);
    }

    #[tokio::test]
    async fn test_set_exporter_swaps_and_shuts_down_old() {
        let old = Arc::new(RecordingExporter::new());
        let new = Arc::new(RecordingExporter::new());
        let config = BatchConfig {
            scheduled_delay: Duration::from_millis(50),
            ..Default::default()
        };
        let processor =
            BatchSpanProcessor::new(config, Some(old.clone() as ExporterHandle)).await;

        processor.set_exporter(Some(new.clone() as ExporterHandle)).unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(old.shutdown_count(), 1);

        // Ingest stayed enabled; the next flush lands on the new exporter.
        assert!(processor.on_end(span(1)).is_accepted());
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(old.exported_span_count(), 0);
        assert_eq!(new.exported_span_count(), 1);
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_no_exporter_disables_ingest_until_one_is_set() {
        let config = BatchConfig {
            scheduled_delay: Duration::from_millis(30),
            ..Default::default()
        };
        let processor = BatchSpanProcessor::new(config, None).await;

        assert!(processor.on_end(span(1)).is_accepted());
        // First scheduled export finds no exporter and tears the buffer down.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(processor.on_end(span(2)), OnEnd::Dropped(DropReason::Disabled));

        // Supplying an exporter re-enables ingest immediately.
        let exporter = Arc::new(RecordingExporter::new());
        processor.set_exporter(Some(exporter.clone() as ExporterHandle)).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(processor.on_end(span(3)).is_accepted());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(exporter.exported_span_count(), 1);
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_export_advances_fsm() {
        let exporter = Arc::new(FailingExporter::new(true));
        let config = BatchConfig {
            scheduled_delay: Duration::from_millis(40),
            ..Default::default()
        };
        let processor =
            BatchSpanProcessor::new(config, Some(exporter.clone() as ExporterHandle)).await;

        processor.on_end(span(1));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(exporter.attempts() >= 1);
        assert_eq!(processor.metrics().export_failures(), 1);
        // Failure is completion: the processor keeps accepting and exporting.
        assert!(processor.on_end(span(2)).is_accepted());
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_retryable_failure_is_completion() {
        let exporter = Arc::new(FailingExporter::new(false));
        let config = BatchConfig {
            scheduled_delay: Duration::from_millis(40),
            ..Default::default()
        };
        let processor =
            BatchSpanProcessor::new(config, Some(exporter.clone() as ExporterHandle)).await;

        processor.on_end(span(1));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(processor.metrics().exports_completed(), 1);
        processor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_fresh_names_are_unique() {
        let a = BatchSpanProcessor::new(quick_config(), None).await;
        let b = BatchSpanProcessor::new(quick_config(), None).await;
        assert_ne!(a.name(), b.name());
        let named = BatchSpanProcessor::new(
            BatchConfig {
                name: Some("checkout-traces".into()),
                ..quick_config()
            },
            None,
        )
        .await;
        assert_eq!(named.name(), "checkout-traces");
    }
}
