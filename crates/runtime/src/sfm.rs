//! Self-monitoring: per-callback execution counters and process gauges.
//!
//! Workers call [`SelfMonitoringCollector::record`] once per execution. The
//! flush pipeline calls [`SelfMonitoringCollector::materialize`] once per
//! interval, which swaps the interval counters out and turns them into metrics
//! under the `dsfm:datasource.rust.` namespace.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use extkit_core::{Metric, Status, StatusValue};
use uuid::Uuid;

/// Key prefix of every self-monitoring metric.
pub const SFM_NAMESPACE: &str = "dsfm:datasource.rust.";

/// Dimension carrying the callback name.
pub const DIM_CALLBACK: &str = "callback";

/// Dimension carrying the monitoring configuration id.
pub const DIM_CONFIG_ID: &str = "dt.extension.config.id";

/// How a single execution ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The callback returned an error or panicked.
    Exception(String),
    /// The watchdog expired before the callback returned.
    Timeout,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Exception(_) => "exception",
            Outcome::Timeout => "timeout",
        }
    }
}

/// One completed (or abandoned) execution of a task.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub task: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration: Duration,
    pub outcome: Outcome,
}

/// Counters for one task over the current interval.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskSample {
    pub executions: u64,
    pub successes: u64,
    pub exceptions: u64,
    pub timeouts: u64,
    /// Executions over the task's lifetime; not reset by materialize.
    pub total: u64,
    /// Duration of the most recent execution; carried across intervals.
    pub last_duration: Option<Duration>,
}

/// Process-wide values sampled by the flush pipeline.
#[derive(Debug, Clone, Default)]
pub struct ProcessSample {
    pub threads: Option<usize>,
    pub workers_active: usize,
    pub workers_abandoned: usize,
    pub buffer_overflow: u64,
    /// Events and log records evicted from the event queue.
    pub event_overflow: u64,
    pub invalid_metrics: u64,
}

/// Collects execution outcomes between flushes.
#[derive(Debug)]
pub struct SelfMonitoringCollector {
    config_id: String,
    samples: Mutex<BTreeMap<String, TaskSample>>,
    statuses: Mutex<HashMap<String, Status>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SelfMonitoringCollector {
    pub fn new(config_id: impl Into<String>) -> Self {
        Self {
            config_id: config_id.into(),
            samples: Mutex::new(BTreeMap::new()),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    /// Record one execution. Must be called exactly once per execution.
    pub fn record(&self, record: &ExecutionRecord) {
        {
            let mut samples = lock(&self.samples);
            let sample = samples.entry(record.task.clone()).or_default();
            sample.executions += 1;
            sample.total += 1;
            sample.last_duration = Some(record.duration);
            match record.outcome {
                Outcome::Success => sample.successes += 1,
                Outcome::Exception(_) => sample.exceptions += 1,
                Outcome::Timeout => sample.timeouts += 1,
            }
        }

        let status = match &record.outcome {
            Outcome::Success => Status::ok(),
            Outcome::Exception(message) => {
                Status::new(StatusValue::GenericError, format!("{}: {}", record.task, message))
            }
            Outcome::Timeout => Status::new(
                StatusValue::GenericError,
                format!("{} took longer than its timeout", record.task),
            ),
        };
        lock(&self.statuses).insert(record.task.clone(), status);
    }

    /// Current counters of one task without resetting them.
    pub fn peek(&self, task: &str) -> Option<TaskSample> {
        lock(&self.samples).get(task).cloned()
    }

    /// Last outcome of every task as a status, sorted by task name.
    pub fn callback_statuses(&self) -> Vec<(String, Status)> {
        let mut out: Vec<_> = lock(&self.statuses)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Swap out the interval counters. Lifetime totals and last durations
    /// are kept for the next interval.
    pub fn take_samples(&self) -> Vec<(String, TaskSample)> {
        let mut samples = lock(&self.samples);
        let taken: Vec<_> = samples.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for sample in samples.values_mut() {
            *sample = TaskSample {
                total: sample.total,
                last_duration: sample.last_duration,
                ..TaskSample::default()
            };
        }
        taken
    }

    /// Produce the self-monitoring metric set for the interval that just ended.
    pub fn materialize(&self, process: &ProcessSample) -> Vec<Metric> {
        let now = Utc::now();
        let mut out = Vec::new();

        for (task, sample) in self.take_samples() {
            let tagged = |metric: Metric| {
                metric
                    .with_dimension(DIM_CALLBACK, task.as_str())
                    .with_dimension(DIM_CONFIG_ID, self.config_id.as_str())
                    .with_timestamp(now)
            };
            out.push(tagged(Metric::delta(sfm_key("execution.count"), sample.executions)));
            out.push(tagged(Metric::delta(sfm_key("execution.ok.count"), sample.successes)));
            out.push(tagged(Metric::delta(sfm_key("execution.exception.count"), sample.exceptions)));
            out.push(tagged(Metric::delta(sfm_key("execution.timeout.count"), sample.timeouts)));
            out.push(tagged(Metric::count(sfm_key("execution.total.count"), sample.total)));
            if let Some(duration) = sample.last_duration {
                out.push(tagged(Metric::gauge(sfm_key("execution.time"), duration.as_secs_f64())));
            }
        }

        let tagged = |metric: Metric| {
            metric
                .with_dimension(DIM_CONFIG_ID, self.config_id.as_str())
                .with_timestamp(now)
        };
        if let Some(threads) = process.threads {
            out.push(tagged(Metric::gauge(sfm_key("threads"), threads)));
        }
        out.push(tagged(Metric::gauge(sfm_key("workers.active"), process.workers_active)));
        out.push(tagged(Metric::gauge(sfm_key("workers.abandoned"), process.workers_abandoned)));
        out.push(tagged(Metric::delta(sfm_key("buffer.overflow.count"), process.buffer_overflow)));
        out.push(tagged(Metric::delta(sfm_key("events.overflow.count"), process.event_overflow)));
        out.push(tagged(Metric::delta(sfm_key("invalid.metrics.count"), process.invalid_metrics)));
        out
    }
}

fn sfm_key(name: &str) -> String {
    format!("{SFM_NAMESPACE}{name}")
}

/// Number of OS threads in this process, where the platform exposes it.
pub fn process_thread_count() -> Option<usize> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find_map(|line| line.strip_prefix("Threads:"))
        .and_then(|v| v.trim().parse().ok())
}
