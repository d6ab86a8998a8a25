//! Wires scheduler, worker pool, flush pipeline and shutdown together.

use std::collections::BTreeMap;
use std::sync::Arc;

use extkit_core::{MultiStatus, RuntimeConfig, Status, StatusValue};
use tokio::time::{interval_at, Instant as TokioInstant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::buffer::{EventQueue, MetricBuffer};
use crate::context::{ReportSink, META_CONFIG_ID, META_DATASOURCE, META_NAME, META_VERSION};
use crate::error::{RegistryError, RuntimeError};
use crate::extension::{Extension, QueryCallback, Schedules, QUERY_TASK};
use crate::flush::{FlushReport, Flusher, IngestHealth};
use crate::ingest::{DebugIngestClient, HttpIngestClient, IngestClient};
use crate::scheduler::{Scheduler, Task, TaskRegistry};
use crate::sfm::SelfMonitoringCollector;
use crate::shutdown::ShutdownCoordinator;
use crate::worker::WorkerPool;

pub struct ExtensionRuntime {
    config: RuntimeConfig,
    client: Arc<dyn IngestClient>,
    shutdown: Arc<ShutdownCoordinator>,
    sink: Arc<ReportSink>,
    collector: Arc<SelfMonitoringCollector>,
    pool: WorkerPool,
    health: Arc<IngestHealth>,
    flusher: Flusher,
    registry: TaskRegistry,
    handle_signals: bool,
}

impl ExtensionRuntime {
    pub fn new(config: RuntimeConfig, client: Arc<dyn IngestClient>) -> Result<Self, RuntimeError> {
        config.validate()?;

        let mut metadata = BTreeMap::new();
        metadata.insert(META_CONFIG_ID.to_string(), config.monitoring_config_id.clone());
        metadata.insert(META_DATASOURCE.to_string(), "rust".to_string());
        metadata.insert(META_VERSION.to_string(), config.extension_version.clone());
        metadata.insert(META_NAME.to_string(), config.extension_name.clone());

        let sink = Arc::new(ReportSink::new(
            Arc::new(MetricBuffer::new(config.max_pending_lines)),
            Arc::new(EventQueue::new(config.max_pending_lines)),
            metadata,
        ));
        let collector = Arc::new(SelfMonitoringCollector::new(config.monitoring_config_id.clone()));
        let shutdown = Arc::new(ShutdownCoordinator::new());
        let pool = WorkerPool::new(
            config.worker_threads,
            Arc::clone(&collector),
            Arc::clone(&sink),
            shutdown.token(),
        );
        let health = Arc::new(IngestHealth::new(config.max_send_failures));
        let flusher = Flusher::new(
            Arc::clone(&sink),
            Arc::clone(&collector),
            pool.clone(),
            Arc::clone(&client),
            Arc::clone(&health),
        );
        Ok(Self {
            config,
            client,
            shutdown,
            sink,
            collector,
            pool,
            health,
            flusher,
            registry: TaskRegistry::new(),
            handle_signals: true,
        })
    }

    /// Build with the HTTP client if `ingest_url` is set, otherwise the
    /// debug client.
    pub fn from_config(config: RuntimeConfig) -> Result<Self, RuntimeError> {
        let client: Arc<dyn IngestClient> = match &config.ingest_url {
            Some(url) => Arc::new(HttpIngestClient::new(url, &config.datasource_id)?),
            None => Arc::new(DebugIngestClient::new(true)),
        };
        Self::new(config, client)
    }

    /// Whether [`run`](Self::run) installs SIGINT/SIGTERM handlers.
    pub fn with_signal_handling(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn shutdown_handle(&self) -> Arc<ShutdownCoordinator> {
        Arc::clone(&self.shutdown)
    }

    pub fn sink(&self) -> Arc<ReportSink> {
        Arc::clone(&self.sink)
    }

    pub fn collector(&self) -> Arc<SelfMonitoringCollector> {
        Arc::clone(&self.collector)
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Register a task before [`run`](Self::run).
    pub fn schedule(&mut self, task: Task) -> Result<(), RegistryError> {
        self.registry.register(task)
    }

    pub async fn flush(&self) -> FlushReport {
        self.flusher.flush().await
    }

    /// Combined status: a connection error while deliveries keep failing,
    /// otherwise the merge of every callback's last outcome.
    pub fn overall_status(&self) -> Status {
        if let Some(status) = self.health.status() {
            return status;
        }
        let mut multi = MultiStatus::new();
        for (_, status) in self.collector.callback_statuses() {
            multi.add(status.status, status.message);
        }
        multi.build()
    }

    pub async fn heartbeat(&self) -> Status {
        let status = self.overall_status();
        self.send_status(&status).await;
        status
    }

    async fn send_status(&self, status: &Status) {
        match self.client.send_status(status).await {
            Ok(()) => info!(status = %status, "status sent"),
            Err(e) => self.health.record_failure(&e.to_string()),
        }
    }

    /// Run `extension` until shutdown is requested, then drain and flush
    /// once. Returns the report of the final flush.
    pub async fn run<E: Extension>(mut self, extension: E) -> Result<FlushReport, RuntimeError> {
        let extension = Arc::new(extension);
        info!(extension = extension.name(), "Starting extension");
        self.config.log_summary();

        let ext = Arc::clone(&extension);
        let status = blocking_hook("fastcheck", move || ext.fastcheck())
            .await
            .unwrap_or_else(|message| Status::new(StatusValue::GenericError, message));
        if status.is_error() {
            error!(status = %status, "Fast check failed");
            self.send_status(&status).await;
            return Err(RuntimeError::FastCheckFailed(status));
        }

        let mut query = Task::new(
            QUERY_TASK,
            self.config.query_interval(),
            QueryCallback(Arc::clone(&extension)),
        );
        if let Some(timeout) = extension.query_timeout() {
            query = query.with_timeout(timeout);
        }
        self.registry.register(query)?;

        let ext = Arc::clone(&extension);
        let mut registry = std::mem::take(&mut self.registry);
        let init = blocking_hook("initialize", move || {
            let result = ext.initialize(&mut Schedules::new(&mut registry));
            (registry, result)
        })
        .await;
        let init_error = match init {
            Ok((registry, Ok(()))) => {
                self.registry = registry;
                None
            }
            Ok((_, Err(e))) => Some(format!("{e:#}")),
            Err(message) => Some(message),
        };
        if let Some(message) = init_error {
            error!(error = %message, "Extension initialization failed");
            self.send_status(&Status::error(message.clone())).await;
            return Err(RuntimeError::Initialization(message));
        }

        self.heartbeat().await;

        let scheduler = Scheduler::with_registry(
            std::mem::take(&mut self.registry),
            self.pool.clone(),
            self.config.tick_interval(),
            self.shutdown.token(),
        );
        let scheduler_task = tokio::spawn(scheduler.run());

        if self.handle_signals {
            let coordinator = Arc::clone(&self.shutdown);
            tokio::spawn(async move { coordinator.listen_for_signals().await });
        }

        let start = TokioInstant::now();
        let flush_every = self.config.flush_interval();
        let heartbeat_every = self.config.heartbeat_interval();
        let mut flush_ticker = interval_at(start + flush_every, flush_every);
        flush_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeat_ticker = interval_at(start + heartbeat_every, heartbeat_every);
        heartbeat_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.requested() => break,
                _ = flush_ticker.tick() => {
                    self.flusher.flush().await;
                }
                _ = heartbeat_ticker.tick() => {
                    self.heartbeat().await;
                }
            }
        }

        self.drain(extension, scheduler_task).await
    }

    async fn drain<E: Extension>(
        &self,
        extension: Arc<E>,
        scheduler_task: tokio::task::JoinHandle<TaskRegistry>,
    ) -> Result<FlushReport, RuntimeError> {
        if let Err(e) = scheduler_task.await {
            warn!(error = %e, "scheduler task ended abnormally");
        }

        if let Err(message) = blocking_hook("on_shutdown", move || extension.on_shutdown()).await {
            warn!(error = %message, "on_shutdown failed");
        }

        let grace = self.config.shutdown_grace();
        if !self.pool.wait_idle(grace).await {
            warn!(
                active = self.pool.active(),
                "in-flight callbacks did not finish within {:?}, flushing anyway", grace
            );
        }

        let report = self.flusher.flush().await;
        info!(
            lines = report.lines_sent,
            events = report.events_sent,
            requeued = report.lines_requeued,
            "Final flush complete"
        );
        self.shutdown.mark_stopped();
        Ok(report)
    }
}

/// Run a synchronous extension hook on the blocking pool. A panic comes back
/// as an error message naming the hook.
async fn blocking_hook<T, F>(hook: &'static str, f: F) -> Result<T, String>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        if e.is_panic() {
            format!("{hook} panicked")
        } else {
            format!("{hook} was cancelled")
        }
    })
}
