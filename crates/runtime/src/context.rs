//! The handle a callback uses to report data while it runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use extkit_core::{encode, Event, Metric, MetricError, MetricKind};
use extkit_core::event::log_line;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::buffer::{EventQueue, MetricBuffer};

/// Metadata keys attached to every event sent by the runtime.
pub const META_CONFIG_ID: &str = "dt.extension.config.id";
pub const META_DATASOURCE: &str = "dt.extension.ds";
pub const META_VERSION: &str = "dt.extension.version";
pub const META_NAME: &str = "dt.extension.name";

/// Shared destination for everything callbacks report.
///
/// Metrics are validated and encoded here, on the reporting thread, so the
/// buffer only ever holds lines the ingest endpoint can accept.
#[derive(Debug)]
pub struct ReportSink {
    buffer: Arc<MetricBuffer>,
    events: Arc<EventQueue>,
    metadata: BTreeMap<String, String>,
    invalid: AtomicU64,
}

impl ReportSink {
    pub fn new(
        buffer: Arc<MetricBuffer>,
        events: Arc<EventQueue>,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self {
            buffer,
            events,
            metadata,
            invalid: AtomicU64::new(0),
        }
    }

    /// Validate, encode and buffer one metric. Invalid metrics are counted
    /// and dropped; the error is returned to the caller.
    ///
    /// Absolute counters without a timestamp are stamped with "now" so the
    /// receiver can derive deltas between consecutive reports.
    pub fn report_metric(&self, metric: Metric) -> Result<(), MetricError> {
        let line = self.encode_metric(&metric)?;
        self.buffer.push(line);
        Ok(())
    }

    /// Encode a metric, counting it as invalid if it cannot be encoded.
    pub(crate) fn encode_metric(&self, metric: &Metric) -> Result<String, MetricError> {
        let stamped;
        let metric = if metric.kind == MetricKind::Count && metric.timestamp.is_none() {
            stamped = metric.clone().with_timestamp(Utc::now());
            &stamped
        } else {
            metric
        };
        encode(metric).map_err(|e| {
            self.invalid.fetch_add(1, Ordering::Relaxed);
            warn!(key = %metric.key, error = %e, "dropping invalid metric");
            e
        })
    }

    /// Buffer pre-encoded lines as-is.
    pub fn report_mint_lines(&self, lines: impl IntoIterator<Item = String>) {
        self.buffer.extend(lines.into_iter().filter(|l| !l.trim().is_empty()));
    }

    pub fn report_event(&self, event: &Event) {
        self.events.push(self.event_json(event));
    }

    pub(crate) fn event_json(&self, event: &Event) -> Value {
        event.to_json(&self.metadata)
    }

    pub fn report_log_lines(&self, lines: impl IntoIterator<Item = String>) {
        self.events.extend(lines.into_iter().map(log_line));
    }

    /// Metadata merged into every event.
    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Invalid metrics since the previous call.
    pub fn take_invalid(&self) -> u64 {
        self.invalid.swap(0, Ordering::Relaxed)
    }

    pub fn buffer(&self) -> &Arc<MetricBuffer> {
        &self.buffer
    }

    pub fn events(&self) -> &Arc<EventQueue> {
        &self.events
    }
}

/// Data reported by one execution, held until the execution ends.
#[derive(Debug, Default)]
struct Staged {
    lines: Vec<String>,
    events: Vec<Value>,
    closed: bool,
}

/// Passed to a callback for the duration of one execution.
///
/// Reports are staged on the context and reach the shared buffers only when
/// the execution is committed. A timed out execution is discarded as a
/// whole, including whatever it reported before the timeout.
#[derive(Debug, Clone)]
pub struct CallbackContext {
    task: String,
    execution_id: Uuid,
    started_at: DateTime<Utc>,
    sink: Arc<ReportSink>,
    cancel: CancellationToken,
    expired: Arc<AtomicBool>,
    staged: Arc<Mutex<Staged>>,
}

impl CallbackContext {
    pub fn new(
        task: impl Into<String>,
        started_at: DateTime<Utc>,
        sink: Arc<ReportSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            task: task.into(),
            execution_id: Uuid::new_v4(),
            started_at,
            sink,
            cancel,
            expired: Arc::new(AtomicBool::new(false)),
            staged: Arc::new(Mutex::new(Staged::default())),
        }
    }

    pub fn task_name(&self) -> &str {
        &self.task
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// True once the runtime is shutting down or this execution timed out.
    /// Long-running callbacks should poll this and return early.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled() || self.is_expired()
    }

    /// Token cancelled together with [`is_cancelled`](Self::is_cancelled),
    /// for callbacks that drive their own async work.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    fn lock_staged(&self) -> MutexGuard<'_, Staged> {
        self.staged.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the staging area unless the execution already ended.
    fn stage(&self, what: &str, f: impl FnOnce(&mut Staged)) {
        let mut staged = self.lock_staged();
        if staged.closed {
            debug!(task = %self.task, what, "discarding report from finished or timed out execution");
            return;
        }
        f(&mut staged);
    }

    /// Called by the watchdog on timeout. Drops everything staged so far and
    /// every later report.
    pub(crate) fn expire(&self) {
        let dropped = {
            let mut staged = self.lock_staged();
            staged.closed = true;
            let dropped = staged.lines.len() + staged.events.len();
            staged.lines.clear();
            staged.events.clear();
            dropped
        };
        self.expired.store(true, Ordering::Release);
        self.cancel.cancel();
        if dropped > 0 {
            debug!(task = %self.task, dropped, "discarded reports of timed out execution");
        }
    }

    /// Called by the worker once the callback returned in time. Moves the
    /// staged reports into the shared buffers; later reports are dropped.
    pub(crate) fn commit(&self) {
        let (lines, events) = {
            let mut staged = self.lock_staged();
            if staged.closed {
                return;
            }
            staged.closed = true;
            (std::mem::take(&mut staged.lines), std::mem::take(&mut staged.events))
        };
        self.sink.buffer().extend(lines);
        self.sink.events().extend(events);
    }

    /// Timestamp for metrics reported by this execution: the start time plus
    /// whole minutes elapsed, so a slow callback does not smear one interval's
    /// data across several.
    pub fn metric_timestamp(&self) -> DateTime<Utc> {
        let elapsed = Utc::now().signed_duration_since(self.started_at);
        self.started_at + ChronoDuration::minutes(elapsed.num_minutes().max(0))
    }

    /// Validate and stage one metric. Invalid metrics are counted and the
    /// error returned, as with [`ReportSink::report_metric`].
    pub fn report_metric(&self, mut metric: Metric) -> Result<(), MetricError> {
        if self.is_expired() {
            debug!(task = %self.task, key = %metric.key, "discarding metric from timed out execution");
            return Ok(());
        }
        if metric.timestamp.is_none() {
            metric.timestamp = Some(self.metric_timestamp());
        }
        let line = self.sink.encode_metric(&metric)?;
        self.stage("metric", |s| s.lines.push(line));
        Ok(())
    }

    pub fn gauge(&self, key: &str, value: f64, dimensions: &[(&str, &str)]) -> Result<(), MetricError> {
        self.report_metric(Metric::gauge(key, value).with_dimensions(dimensions.iter().copied()))
    }

    pub fn delta(&self, key: &str, value: f64, dimensions: &[(&str, &str)]) -> Result<(), MetricError> {
        self.report_metric(Metric::delta(key, value).with_dimensions(dimensions.iter().copied()))
    }

    pub fn report_mint_lines(&self, lines: impl IntoIterator<Item = String>) {
        self.stage("lines", |s| {
            s.lines.extend(lines.into_iter().filter(|l| !l.trim().is_empty()))
        });
    }

    pub fn report_event(&self, event: &Event) {
        let json = self.sink.event_json(event);
        self.stage("event", |s| s.events.push(json));
    }

    pub fn report_log_lines(&self, lines: impl IntoIterator<Item = String>) {
        self.stage("log lines", |s| s.events.extend(lines.into_iter().map(log_line)));
    }
}
