//! End-to-end behaviour of scheduling, execution, buffering and delivery.
//!
//! Most tests assemble the components by hand and drive the scheduler with
//! synthetic instants, so execution counts are exact. The lifecycle tests run
//! a full `ExtensionRuntime` and stop it through its shutdown handle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use extkit_core::{parse_line, Metric, MetricKind, MetricValue, RuntimeConfig, Status, StatusValue};
use extkit_runtime::sfm::SFM_NAMESPACE;
use extkit_runtime::{
    CallbackContext, EventQueue, Extension, ExtensionRuntime, Flusher, IngestClient, IngestError,
    IngestHealth, MetricBuffer, MintResponse, ReportSink, RuntimeError, Scheduler,
    SelfMonitoringCollector, ShutdownState, Task, WorkerPool,
};

const IDLE: Duration = Duration::from_secs(3);

/// Ingest client that records every request. Can be told to fail the next
/// `n` metric requests.
#[derive(Default)]
struct RecordingClient {
    batches: Mutex<Vec<Vec<String>>>,
    events: Mutex<Vec<Value>>,
    statuses: Mutex<Vec<Status>>,
    fail_next: AtomicUsize,
}

impl RecordingClient {
    fn lines(&self) -> Vec<String> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }

    fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }

    /// Lines reported by callbacks, without self-monitoring.
    fn user_lines(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|l| !l.starts_with(SFM_NAMESPACE))
            .collect()
    }

    fn metrics(&self) -> Vec<Metric> {
        self.lines().iter().filter_map(|l| parse_line(l).ok()).collect()
    }

    fn sfm_value(&self, name: &str, callback: Option<&str>) -> Option<f64> {
        let key = format!("{SFM_NAMESPACE}{name}");
        self.metrics()
            .into_iter()
            .find(|m| {
                m.key == key && m.dimensions.get("callback").map(String::as_str) == callback
            })
            .and_then(|m| m.value.as_f64())
    }
}

#[async_trait]
impl IngestClient for RecordingClient {
    async fn send_metrics(&self, lines: &[String]) -> Result<MintResponse, IngestError> {
        let fail = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(IngestError::Unavailable("connection refused".into()));
        }
        self.batches.lock().unwrap().push(lines.to_vec());
        Ok(MintResponse::accepted(lines.len()))
    }

    async fn send_events(&self, events: &[Value]) -> Result<(), IngestError> {
        self.events.lock().unwrap().extend(events.iter().cloned());
        Ok(())
    }

    async fn send_status(&self, status: &Status) -> Result<(), IngestError> {
        self.statuses.lock().unwrap().push(status.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

struct Harness {
    sink: Arc<ReportSink>,
    collector: Arc<SelfMonitoringCollector>,
    pool: WorkerPool,
    scheduler: Scheduler,
    flusher: Flusher,
    health: Arc<IngestHealth>,
    client: Arc<RecordingClient>,
}

fn harness(capacity: usize, workers: usize) -> Harness {
    let mut metadata = BTreeMap::new();
    metadata.insert("dt.extension.name".to_string(), "test".to_string());
    let sink = Arc::new(ReportSink::new(
        Arc::new(MetricBuffer::new(capacity)),
        Arc::new(EventQueue::new(capacity)),
        metadata,
    ));
    let collector = Arc::new(SelfMonitoringCollector::new("cfg-test"));
    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(workers, Arc::clone(&collector), Arc::clone(&sink), shutdown.clone());
    let client = Arc::new(RecordingClient::default());
    let health = Arc::new(IngestHealth::new(3));
    let flusher = Flusher::new(
        Arc::clone(&sink),
        Arc::clone(&collector),
        pool.clone(),
        client.clone(),
        Arc::clone(&health),
    );
    let scheduler = Scheduler::new(pool.clone(), Duration::from_millis(10), shutdown);
    Harness {
        sink,
        collector,
        pool,
        scheduler,
        flusher,
        health,
        client,
    }
}

#[tokio::test]
async fn exception_in_one_run_does_not_stop_later_runs() {
    let mut h = harness(1000, 4);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    h.scheduler
        .register(Task::new(
            "flaky",
            Duration::from_secs(1),
            move |ctx: &CallbackContext| -> anyhow::Result<()> {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 2 {
                    anyhow::bail!("device returned garbage");
                }
                ctx.gauge("device.temperature", 40.0 + n as f64, &[])?;
                Ok(())
            },
        ))
        .unwrap();

    let t0 = Instant::now();
    for k in 0..5u32 {
        assert_eq!(h.scheduler.tick(t0 + Duration::from_secs(1) * k), 1);
        assert!(h.pool.wait_idle(IDLE).await);
    }

    let sample = h.collector.peek("flaky").unwrap();
    assert_eq!(sample.executions, 5);
    assert_eq!(sample.exceptions, 1);
    assert_eq!(sample.successes, 4);

    let report = h.flusher.flush().await;
    assert!(report.is_complete());
    assert_eq!(h.client.user_lines().len(), 4);
    assert_eq!(h.client.sfm_value("execution.count", Some("flaky")), Some(5.0));
    assert_eq!(h.client.sfm_value("execution.exception.count", Some("flaky")), Some(1.0));
    assert_eq!(h.client.sfm_value("execution.ok.count", Some("flaky")), Some(4.0));
}

#[tokio::test]
async fn timed_out_run_is_abandoned_and_its_metrics_discarded() {
    let mut h = harness(1000, 4);
    h.scheduler
        .register(
            Task::new(
                "hang",
                Duration::from_secs(1),
                |ctx: &CallbackContext| -> anyhow::Result<()> {
                    ctx.gauge("early.metric", 1.0, &[])?;
                    std::thread::sleep(Duration::from_millis(500));
                    ctx.gauge("late.metric", 1.0, &[])?;
                    Ok(())
                },
            )
            .with_timeout(Duration::from_millis(100)),
        )
        .unwrap();

    let t0 = Instant::now();
    assert_eq!(h.scheduler.tick(t0), 1);
    assert!(h.pool.wait_idle(IDLE).await);

    let sample = h.collector.peek("hang").unwrap();
    assert_eq!(sample.timeouts, 1);
    assert_eq!(h.pool.abandoned(), 1);

    // Still running in the background, so the next slot is skipped.
    assert_eq!(h.scheduler.tick(t0 + Duration::from_secs(1)), 0);

    assert!(h.sink.buffer().is_empty());
    h.flusher.flush().await;
    assert_eq!(h.client.sfm_value("execution.timeout.count", Some("hang")), Some(1.0));
    assert_eq!(h.client.sfm_value("workers.abandoned", None), Some(1.0));

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(h.pool.abandoned(), 0);
    h.flusher.flush().await;
    assert!(h.client.user_lines().is_empty());
}

#[tokio::test]
async fn deltas_from_two_callbacks_are_summed() {
    let mut h = harness(1000, 4);
    for (name, value) in [("first", 5.0), ("second", 7.0)] {
        h.scheduler
            .register(Task::new(
                name,
                Duration::from_secs(60),
                move |ctx: &CallbackContext| -> anyhow::Result<()> {
                    ctx.delta("requests", value, &[("host", "a")])?;
                    Ok(())
                },
            ))
            .unwrap();
    }

    assert_eq!(h.scheduler.tick(Instant::now()), 2);
    assert!(h.pool.wait_idle(IDLE).await);
    h.flusher.flush().await;

    let requests: Vec<Metric> = h
        .client
        .metrics()
        .into_iter()
        .filter(|m| m.key == "requests")
        .collect();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].kind, MetricKind::Delta);
    assert_eq!(requests[0].value, MetricValue::Number(12.0));
    assert_eq!(requests[0].dimensions.get("host").unwrap(), "a");
}

#[tokio::test]
async fn overflow_keeps_newest_lines_and_is_reported() {
    let h = harness(10, 1);
    for i in 0..15 {
        h.sink
            .report_metric(Metric::gauge("queue.depth", i as f64).with_dimension("slot", i.to_string()))
            .unwrap();
    }
    assert_eq!(h.sink.buffer().len(), 10);
    assert_eq!(h.sink.buffer().overflow_count(), 5);

    h.flusher.flush().await;
    let user = h.client.user_lines();
    assert_eq!(user.len(), 10);
    assert!(user[0].contains("slot=\"5\""));
    assert_eq!(h.client.sfm_value("buffer.overflow.count", None), Some(5.0));
}

#[tokio::test]
async fn invalid_metrics_are_counted_not_sent() {
    let h = harness(100, 1);
    assert!(h.sink.report_metric(Metric::gauge("has space", 1.0)).is_err());
    assert!(h.sink.report_metric(Metric::gauge("ok.metric", 1.0)).is_ok());

    h.flusher.flush().await;
    assert_eq!(h.client.user_lines().len(), 1);
    assert_eq!(h.client.sfm_value("invalid.metrics.count", None), Some(1.0));
}

#[tokio::test]
async fn events_are_sent_with_metadata() {
    let h = harness(100, 1);
    h.sink.report_event(&extkit_core::Event::new("Link down", "eth0 lost carrier"));
    h.sink.report_log_lines(vec!["plain log line".to_string()]);

    let report = h.flusher.flush().await;
    assert_eq!(report.events_sent, 2);
    let events = h.client.events.lock().unwrap();
    assert_eq!(events[0]["title"], "Link down");
    assert_eq!(events[0]["dt.extension.name"], "test");
    assert_eq!(events[1]["content"], "plain log line");
}

#[tokio::test]
async fn failed_send_requeues_in_order() {
    let h = harness(5000, 1);
    for i in 0..3 {
        h.sink.report_metric(Metric::gauge(format!("m{i}"), 1.0)).unwrap();
    }
    h.client.fail_next.store(1, Ordering::SeqCst);

    let report = h.flusher.flush().await;
    assert!(!report.is_complete());
    assert_eq!(h.health.consecutive_failures(), 1);
    assert!(h.client.lines().is_empty());

    h.sink.report_metric(Metric::gauge("m3", 1.0)).unwrap();
    let report = h.flusher.flush().await;
    assert!(report.is_complete());
    assert_eq!(h.health.consecutive_failures(), 0);

    let keys: Vec<String> = h
        .client
        .user_lines()
        .iter()
        .map(|l| l.split(' ').next().unwrap().to_string())
        .collect();
    assert_eq!(keys, vec!["m0", "m1", "m2", "m3"]);
}

#[tokio::test]
async fn repeated_failures_turn_into_connection_error() {
    let h = harness(100, 1);
    h.client.fail_next.store(3, Ordering::SeqCst);
    for _ in 0..3 {
        h.sink.report_metric(Metric::gauge("m", 1.0)).unwrap();
        h.flusher.flush().await;
    }
    let status = h.health.status().unwrap();
    assert_eq!(status.status, StatusValue::EecConnectionError);
}

#[tokio::test]
async fn large_batches_are_split_into_chunks() {
    let h = harness(10_000, 1);
    h.sink
        .report_mint_lines((0..2500).map(|i| format!("bulk,i=\"{i}\" gauge,1")));
    h.flusher.flush().await;

    let sizes = h.client.batch_sizes();
    assert_eq!(sizes.len(), 3);
    assert_eq!(sizes[0], 1000);
    assert_eq!(sizes[1], 1000);
    assert!(sizes[2] >= 500);
    assert_eq!(h.client.user_lines().len(), 2500);
}

#[tokio::test]
async fn at_most_one_execution_per_task_in_flight() {
    let mut h = harness(100, 4);
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
    h.scheduler
        .register(Task::new(
            "slow",
            Duration::from_millis(10),
            move |_: &CallbackContext| -> anyhow::Result<()> {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(120));
                r.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            },
        ))
        .unwrap();

    let t0 = Instant::now();
    for k in 0..30u32 {
        h.scheduler.tick(t0 + Duration::from_millis(10) * k);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(h.pool.wait_idle(IDLE).await);
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(h.collector.peek("slow").unwrap().executions >= 2);
}

// ── Full runtime ────────────────────────────────────────────────────

struct Pinger {
    healthy: bool,
    queries: Arc<AtomicUsize>,
    shutdowns: Arc<AtomicUsize>,
}

impl Extension for Pinger {
    fn name(&self) -> &str {
        "pinger"
    }

    fn fastcheck(&self) -> Status {
        if self.healthy {
            Status::ok()
        } else {
            Status::new(StatusValue::DeviceConnectionError, "device offline")
        }
    }

    fn initialize(&self, schedules: &mut extkit_runtime::Schedules<'_>) -> anyhow::Result<()> {
        schedules.schedule("ping", Duration::from_millis(20), |ctx: &CallbackContext| -> anyhow::Result<()> {
            ctx.delta("pinger.pings", 1.0, &[])?;
            Ok(())
        })?;
        Ok(())
    }

    fn query(&self, ctx: &CallbackContext) -> anyhow::Result<()> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        ctx.gauge("pinger.up", 1.0, &[])?;
        Ok(())
    }

    fn on_shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

fn fast_config() -> RuntimeConfig {
    RuntimeConfig {
        tick_interval_ms: 5,
        flush_interval_secs: 3600,
        heartbeat_interval_secs: 3600,
        shutdown_grace_secs: 2,
        extension_name: "pinger".to_string(),
        ..RuntimeConfig::default()
    }
}

#[tokio::test]
async fn shutdown_signals_are_idempotent_and_flush_once() {
    let client = Arc::new(RecordingClient::default());
    let runtime = ExtensionRuntime::new(fast_config(), client.clone())
        .unwrap()
        .with_signal_handling(false);
    let shutdown = runtime.shutdown_handle();
    let queries = Arc::new(AtomicUsize::new(0));
    let shutdowns = Arc::new(AtomicUsize::new(0));
    let pinger = Pinger {
        healthy: true,
        queries: Arc::clone(&queries),
        shutdowns: Arc::clone(&shutdowns),
    };

    let handle = tokio::spawn(runtime.run(pinger));
    tokio::time::sleep(Duration::from_millis(150)).await;

    let signals: Vec<_> = (0..4)
        .map(|_| {
            let s = Arc::clone(&shutdown);
            std::thread::spawn(move || s.signal())
        })
        .collect();
    let accepted = signals
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|won| *won)
        .count();
    assert_eq!(accepted, 1);

    let report = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(report.is_complete());
    assert_eq!(shutdown.state(), ShutdownState::Stopped);
    assert!(!shutdown.signal());

    assert_eq!(queries.load(Ordering::SeqCst), 1);
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(client.batch_sizes().len(), 1, "expected exactly one flush");

    let metrics = client.metrics();
    assert!(metrics.iter().any(|m| m.key == "pinger.up"));
    let pings: Vec<_> = metrics.iter().filter(|m| m.key == "pinger.pings").collect();
    assert_eq!(pings.len(), 1);
    assert!(pings[0].value.as_f64().unwrap() >= 3.0);

    let statuses = client.statuses.lock().unwrap();
    assert_eq!(statuses[0].status, StatusValue::Ok);
}

#[tokio::test]
async fn failed_fastcheck_stops_startup() {
    let client = Arc::new(RecordingClient::default());
    let runtime = ExtensionRuntime::new(fast_config(), client.clone())
        .unwrap()
        .with_signal_handling(false);
    let queries = Arc::new(AtomicUsize::new(0));
    let pinger = Pinger {
        healthy: false,
        queries: Arc::clone(&queries),
        shutdowns: Arc::new(AtomicUsize::new(0)),
    };

    let err = runtime.run(pinger).await.unwrap_err();
    assert!(matches!(err, RuntimeError::FastCheckFailed(ref s) if s.status == StatusValue::DeviceConnectionError));
    assert_eq!(queries.load(Ordering::SeqCst), 0);
    assert!(client.lines().is_empty());
    let statuses = client.statuses.lock().unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].message, "device offline");
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let config = RuntimeConfig {
        worker_threads: 0,
        ..RuntimeConfig::default()
    };
    let result = ExtensionRuntime::new(config, Arc::new(RecordingClient::default()));
    assert!(matches!(result, Err(RuntimeError::Config(_))));
}

/// Hooks that block on async work and fail during initialization.
struct BlockingHooks;

impl Extension for BlockingHooks {
    fn name(&self) -> &str {
        "blocking-hooks"
    }

    fn fastcheck(&self) -> Status {
        tokio::runtime::Handle::current().block_on(async { Status::ok() })
    }

    fn initialize(&self, _schedules: &mut extkit_runtime::Schedules<'_>) -> anyhow::Result<()> {
        panic!("config file vanished");
    }

    fn query(&self, _ctx: &CallbackContext) -> anyhow::Result<()> {
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lifecycle_hooks_run_off_the_async_workers() {
    let client = Arc::new(RecordingClient::default());
    let runtime = ExtensionRuntime::new(fast_config(), client.clone())
        .unwrap()
        .with_signal_handling(false);

    let err = runtime.run(BlockingHooks).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Initialization(ref m) if m == "initialize panicked"));
    let statuses = client.statuses.lock().unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].status, StatusValue::GenericError);
}
