use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::registry::TaskRegistry;
use super::task::Task;
use crate::error::RegistryError;
use crate::worker::WorkerPool;

/// Drives the task registry and submits due tasks to the worker pool.
pub struct Scheduler {
    registry: TaskRegistry,
    pool: WorkerPool,
    tick_interval: Duration,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(pool: WorkerPool, tick_interval: Duration, shutdown: CancellationToken) -> Self {
        Self::with_registry(TaskRegistry::new(), pool, tick_interval, shutdown)
    }

    /// Take over tasks registered before the scheduler was built.
    pub fn with_registry(
        registry: TaskRegistry,
        pool: WorkerPool,
        tick_interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            pool,
            tick_interval,
            shutdown,
        }
    }

    pub fn register(&mut self, task: Task) -> Result<(), RegistryError> {
        self.registry.register(task)
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut TaskRegistry {
        &mut self.registry
    }

    /// Submit every task due at `now`. Returns how many were submitted.
    pub fn tick(&mut self, now: Instant) -> usize {
        let pool = &self.pool;
        let due = self.registry.tick(now, |name| pool.is_in_flight(name));
        let mut submitted = 0;
        for task in due {
            if pool.submit(task) {
                submitted += 1;
            }
        }
        submitted
    }

    /// Run until the shutdown token is cancelled. No task is submitted after
    /// cancellation is observed.
    pub async fn run(mut self) -> TaskRegistry {
        info!(
            "Scheduler starting with {} workers, {} registered tasks",
            self.pool.size(),
            self.registry.len()
        );

        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let submitted = self.tick(Instant::now());
                    if submitted > 0 {
                        debug!(submitted, "scheduler tick");
                    }
                }
            }
        }

        info!("Scheduler stopped");
        self.registry
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::buffer::{EventQueue, MetricBuffer};
    use crate::context::{CallbackContext, ReportSink};
    use crate::sfm::SelfMonitoringCollector;

    fn pool(shutdown: &CancellationToken) -> WorkerPool {
        let sink = Arc::new(ReportSink::new(
            Arc::new(MetricBuffer::new(100)),
            Arc::new(EventQueue::new(100)),
            BTreeMap::new(),
        ));
        WorkerPool::new(4, Arc::new(SelfMonitoringCollector::new("cfg")), sink, shutdown.clone())
    }

    #[tokio::test]
    async fn runs_tasks_until_cancelled() {
        let shutdown = CancellationToken::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let mut scheduler = Scheduler::new(pool(&shutdown), Duration::from_millis(10), shutdown.clone());
        scheduler
            .register(Task::new("fast", Duration::from_millis(50), move |_: &CallbackContext| -> anyhow::Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();

        let handle = tokio::spawn(scheduler.run());
        tokio::time::sleep(Duration::from_millis(230)).await;
        shutdown.cancel();
        let registry = handle.await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let n = runs.load(Ordering::SeqCst);
        assert!((3..=6).contains(&n), "unexpected run count {n}");
        assert!(registry.get("fast").unwrap().last_run().is_some());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(runs.load(Ordering::SeqCst), n);
    }

    #[tokio::test]
    async fn in_flight_task_is_not_resubmitted() {
        let shutdown = CancellationToken::new();
        let pool = pool(&shutdown);
        let mut scheduler = Scheduler::new(pool.clone(), Duration::from_millis(10), shutdown);
        scheduler
            .register(Task::new("slow", Duration::from_millis(10), |_: &CallbackContext| -> anyhow::Result<()> {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            }))
            .unwrap();

        let t0 = Instant::now();
        assert_eq!(scheduler.tick(t0), 1);
        assert_eq!(scheduler.tick(t0 + Duration::from_millis(50)), 0);
        assert!(pool.wait_idle(Duration::from_secs(2)).await);
        assert_eq!(scheduler.tick(t0 + Duration::from_millis(300)), 1);
        assert!(pool.wait_idle(Duration::from_secs(2)).await);
    }
}
