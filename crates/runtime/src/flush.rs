//! Periodic delivery of buffered data.
//!
//! One flush drains the metric buffer, appends the self-monitoring metrics for
//! the interval, merges delta lines of the same series and sends the result in
//! chunks of [`MAX_LINES_PER_REQUEST`]. When the endpoint is unreachable the
//! unsent lines are put back at the front of the buffer for the next attempt.
//! A chunk the endpoint refuses outright (4xx) is dropped and counted as
//! invalid, so it cannot block everything reported after it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use extkit_core::line::series_prefix;
use extkit_core::{encode, parse_line, Metric, MetricKind, MetricValue, Status, StatusValue};
use tracing::{debug, info, warn};

use crate::buffer::{EventQueue, MetricBuffer};
use crate::context::ReportSink;
use crate::ingest::{IngestClient, MAX_LINES_PER_REQUEST};
use crate::sfm::{process_thread_count, ProcessSample, SelfMonitoringCollector};
use crate::worker::WorkerPool;

/// Summary of one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub lines_sent: usize,
    pub lines_invalid: usize,
    pub lines_requeued: usize,
    pub events_sent: usize,
    pub events_requeued: usize,
}

impl FlushReport {
    pub fn is_complete(&self) -> bool {
        self.lines_requeued == 0 && self.events_requeued == 0
    }
}

/// Tracks consecutive delivery failures and lines rejected by the receiver.
#[derive(Debug)]
pub struct IngestHealth {
    consecutive_failures: AtomicU32,
    max_failures: u32,
    last_error: Mutex<Option<String>>,
    rejected_lines: AtomicUsize,
}

impl IngestHealth {
    pub fn new(max_failures: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            max_failures: max_failures.max(1),
            last_error: Mutex::new(None),
            rejected_lines: AtomicUsize::new(0),
        }
    }

    /// Lines the receiver refused during the most recent flush.
    pub fn record_rejected(&self, lines: usize) {
        self.rejected_lines.store(lines, Ordering::SeqCst);
    }

    pub fn record_success(&self) {
        if self.consecutive_failures.swap(0, Ordering::SeqCst) > 0 {
            info!("ingest endpoint reachable again");
        }
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn record_failure(&self, error: &str) {
        let n = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(consecutive = n, error, "failed to deliver data to ingest endpoint");
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.to_string());
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// `EEC_CONNECTION_ERROR` once failures reach the limit, `GENERIC_ERROR`
    /// if the last flush had lines rejected, otherwise `None`.
    pub fn status(&self) -> Option<Status> {
        if self.consecutive_failures() < self.max_failures {
            let rejected = self.rejected_lines.load(Ordering::SeqCst);
            return (rejected > 0).then(|| {
                Status::new(
                    StatusValue::GenericError,
                    format!("{rejected} lines rejected by ingest endpoint"),
                )
            });
        }
        let message = self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_default();
        Some(Status::new(
            StatusValue::EecConnectionError,
            format!("ingest endpoint unreachable: {message}"),
        ))
    }
}

pub struct Flusher {
    sink: Arc<ReportSink>,
    collector: Arc<SelfMonitoringCollector>,
    pool: WorkerPool,
    client: Arc<dyn IngestClient>,
    health: Arc<IngestHealth>,
}

impl Flusher {
    pub fn new(
        sink: Arc<ReportSink>,
        collector: Arc<SelfMonitoringCollector>,
        pool: WorkerPool,
        client: Arc<dyn IngestClient>,
        health: Arc<IngestHealth>,
    ) -> Self {
        Self {
            sink,
            collector,
            pool,
            client,
            health,
        }
    }

    fn buffer(&self) -> &MetricBuffer {
        self.sink.buffer()
    }

    fn events(&self) -> &EventQueue {
        self.sink.events()
    }

    /// Self-monitoring lines for the interval that just ended.
    fn self_monitoring_lines(&self) -> Vec<String> {
        let process = ProcessSample {
            threads: process_thread_count(),
            workers_active: self.pool.active(),
            workers_abandoned: self.pool.abandoned(),
            buffer_overflow: self.buffer().take_overflow(),
            event_overflow: self.events().take_overflow(),
            invalid_metrics: self.sink.take_invalid(),
        };
        self.collector
            .materialize(&process)
            .iter()
            .filter_map(|m| match encode(m) {
                Ok(line) => Some(line),
                Err(e) => {
                    warn!(key = %m.key, error = %e, "skipping self-monitoring metric");
                    None
                }
            })
            .collect()
    }

    pub async fn flush(&self) -> FlushReport {
        let mut report = FlushReport::default();

        let mut lines = self.buffer().drain();
        lines.extend(self.self_monitoring_lines());
        let lines = coalesce_deltas(lines);
        let total = lines.len();

        let mut sent = 0;
        let mut failed = false;
        while sent < total {
            let end = (sent + MAX_LINES_PER_REQUEST).min(total);
            match self.client.send_metrics(&lines[sent..end]).await {
                Ok(response) => {
                    report.lines_sent += response.lines_ok;
                    report.lines_invalid += response.lines_invalid;
                    if response.lines_invalid > 0 {
                        warn!(
                            invalid = response.lines_invalid,
                            error = ?response.error,
                            "ingest endpoint rejected some lines"
                        );
                    }
                    sent = end;
                }
                Err(e) if e.is_retryable() => {
                    self.health.record_failure(&e.to_string());
                    failed = true;
                    break;
                }
                Err(e) => {
                    let dropped = end - sent;
                    warn!(lines = dropped, error = %e, "ingest endpoint refused batch, dropping it");
                    self.health.record_failure(&e.to_string());
                    failed = true;
                    report.lines_invalid += dropped;
                    sent = end;
                }
            }
        }
        if sent < total {
            let unsent: Vec<String> = lines.into_iter().skip(sent).collect();
            report.lines_requeued = unsent.len();
            self.buffer().requeue_front(unsent);
        }

        let events = self.events().drain();
        if !events.is_empty() {
            match self.client.send_events(&events).await {
                Ok(()) => report.events_sent = events.len(),
                Err(e) if e.is_retryable() => {
                    self.health.record_failure(&e.to_string());
                    failed = true;
                    report.events_requeued = events.len();
                    self.events().requeue_front(events);
                }
                Err(e) => {
                    warn!(events = events.len(), error = %e, "ingest endpoint refused events, dropping them");
                    self.health.record_failure(&e.to_string());
                    failed = true;
                }
            }
        }

        if !failed {
            self.health.record_success();
        }
        self.health.record_rejected(report.lines_invalid);
        debug!(?report, client = self.client.name(), "flush finished");
        report
    }
}

enum Slot {
    Raw(String),
    Delta(Metric),
}

/// Merge delta lines that share a series (key plus dimensions) into one line
/// carrying the sum, placed where the series first appeared. Other lines,
/// and lines that do not parse, pass through unchanged.
pub fn coalesce_deltas(lines: Vec<String>) -> Vec<String> {
    let mut slots: Vec<Slot> = Vec::with_capacity(lines.len());
    let mut index: HashMap<String, usize> = HashMap::new();

    for line in lines {
        let metric = match parse_line(&line) {
            Ok(m) if m.kind == MetricKind::Delta && encode(&m).is_ok() => m,
            _ => {
                slots.push(Slot::Raw(line));
                continue;
            }
        };
        let series = series_prefix(&metric.key, &metric.dimensions);
        match index.get(&series) {
            Some(&at) => {
                if let Slot::Delta(existing) = &mut slots[at] {
                    let sum = existing.value.as_f64().unwrap_or(0.0)
                        + metric.value.as_f64().unwrap_or(0.0);
                    existing.value = MetricValue::Number(sum);
                }
            }
            None => {
                index.insert(series, slots.len());
                slots.push(Slot::Delta(metric));
            }
        }
    }

    slots
        .into_iter()
        .filter_map(|slot| match slot {
            Slot::Raw(line) => Some(line),
            Slot::Delta(metric) => encode(&metric).ok(),
        })
        .collect()
}
