//! Bounded worker pool with a per-execution timeout watchdog.
//!
//! Each execution runs its callback on a dedicated OS thread while an async
//! watchdog waits for the result. If a timeout elapses first the execution is
//! recorded as a timeout, its worker slot is released and the thread is left
//! to finish on its own ("abandoned"). A thread cannot be killed safely, so
//! the task stays marked in flight until that thread actually returns and
//! the scheduler will not start a second copy of it meanwhile.
//!
//! Reports staged by an execution are committed to the shared buffers only
//! when it ends with success or an exception.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{oneshot, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::context::{CallbackContext, ReportSink};
use crate::scheduler::DueTask;
use crate::sfm::{ExecutionRecord, Outcome, SelfMonitoringCollector};

const RUNNING: u8 = 0;
const FINISHED: u8 = 1;
const ABANDONED: u8 = 2;

type CallbackResult = std::thread::Result<anyhow::Result<()>>;

/// Runs due tasks with at most `size` executions in progress.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    size: usize,
    permits: Arc<Semaphore>,
    in_flight: Mutex<HashSet<String>>,
    /// Executions submitted and not yet recorded.
    active: AtomicUsize,
    /// Timed-out callback threads that have not returned yet.
    abandoned: AtomicUsize,
    collector: Arc<SelfMonitoringCollector>,
    sink: Arc<ReportSink>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn new(
        size: usize,
        collector: Arc<SelfMonitoringCollector>,
        sink: Arc<ReportSink>,
        shutdown: CancellationToken,
    ) -> Self {
        let size = size.max(1);
        Self {
            inner: Arc::new(PoolInner {
                size,
                permits: Arc::new(Semaphore::new(size)),
                in_flight: Mutex::new(HashSet::new()),
                active: AtomicUsize::new(0),
                abandoned: AtomicUsize::new(0),
                collector,
                sink,
                shutdown,
            }),
        }
    }

    /// Start one execution of `task` in the background.
    ///
    /// Returns `false` without doing anything if the task is already in
    /// flight. Executions beyond the pool size queue for a free slot.
    /// Must be called from within a tokio runtime.
    pub fn submit(&self, task: DueTask) -> bool {
        if !self.inner.lock_in_flight().insert(task.name.clone()) {
            debug!(task = %task.name, "already in flight, not submitting");
            return false;
        }
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.execute(task).await });
        true
    }

    pub fn is_in_flight(&self, name: &str) -> bool {
        self.inner.lock_in_flight().contains(name)
    }

    /// Executions submitted and not yet finished or timed out.
    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Timed-out executions whose threads are still running.
    pub fn abandoned(&self) -> usize {
        self.inner.abandoned.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// Wait until every submitted execution has been recorded, or `limit`
    /// passes. Returns whether the pool went idle in time.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if self.active() == 0 {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(active = self.active(), "worker pool still busy after {:?}", limit);
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl PoolInner {
    fn lock_in_flight(&self) -> MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, name: &str) {
        self.lock_in_flight().remove(name);
    }

    async fn execute(self: Arc<Self>, task: DueTask) {
        let _permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                self.release(&task.name);
                self.active.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        };
        if self.shutdown.is_cancelled() {
            debug!(task = %task.name, "shutdown in progress, dropping queued execution");
            self.release(&task.name);
            self.active.fetch_sub(1, Ordering::SeqCst);
            return;
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        let ctx = CallbackContext::new(
            task.name.clone(),
            started_at,
            Arc::clone(&self.sink),
            self.shutdown.child_token(),
        );
        let id = ctx.execution_id();
        debug!(task = %task.name, %id, "execution started");

        let outcome = match self.spawn_callback(&task, ctx.clone()) {
            Ok((rx, state)) => self.watch(&task, &ctx, rx, state).await,
            Err(e) => {
                self.release(&task.name);
                Outcome::Exception(format!("failed to spawn callback thread: {e}"))
            }
        };

        match &outcome {
            Outcome::Success => {
                ctx.commit();
                debug!(task = %task.name, %id, "execution finished");
            }
            Outcome::Exception(message) => {
                ctx.commit();
                error!(task = %task.name, %id, error = %message, "callback failed");
            }
            Outcome::Timeout => {}
        }

        self.collector.record(&ExecutionRecord {
            id,
            task: task.name,
            started_at,
            ended_at: Utc::now(),
            duration: clock.elapsed(),
            outcome,
        });
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn spawn_callback(
        self: &Arc<Self>,
        task: &DueTask,
        ctx: CallbackContext,
    ) -> std::io::Result<(oneshot::Receiver<CallbackResult>, Arc<AtomicU8>)> {
        let (tx, rx) = oneshot::channel();
        let state = Arc::new(AtomicU8::new(RUNNING));
        let callback = Arc::clone(&task.callback);
        let pool = Arc::clone(self);
        let thread_state = Arc::clone(&state);
        let name = task.name.clone();

        std::thread::Builder::new()
            .name(format!("callback-{}", task.name))
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| callback.run(&ctx)));
                pool.release(&name);
                if thread_state
                    .compare_exchange(RUNNING, FINISHED, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    pool.abandoned.fetch_sub(1, Ordering::SeqCst);
                    debug!(task = %name, "abandoned callback thread returned");
                }
                let _ = tx.send(result);
            })?;
        Ok((rx, state))
    }

    async fn watch(
        &self,
        task: &DueTask,
        ctx: &CallbackContext,
        mut rx: oneshot::Receiver<CallbackResult>,
        state: Arc<AtomicU8>,
    ) -> Outcome {
        let Some(limit) = task.timeout else {
            return into_outcome(rx.await);
        };

        match tokio::time::timeout(limit, &mut rx).await {
            Ok(result) => into_outcome(result),
            Err(_) => {
                self.abandoned.fetch_add(1, Ordering::SeqCst);
                if state
                    .compare_exchange(RUNNING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    ctx.expire();
                    warn!(
                        task = %task.name,
                        timeout = ?limit,
                        "callback exceeded its timeout, abandoning its thread"
                    );
                    Outcome::Timeout
                } else {
                    // Finished between the timer firing and the state swap.
                    self.abandoned.fetch_sub(1, Ordering::SeqCst);
                    into_outcome(rx.await)
                }
            }
        }
    }
}

fn into_outcome(received: Result<CallbackResult, oneshot::error::RecvError>) -> Outcome {
    match received {
        Ok(Ok(Ok(()))) => Outcome::Success,
        Ok(Ok(Err(e))) => Outcome::Exception(format!("{e:#}")),
        Ok(Err(payload)) => Outcome::Exception(format!("panicked: {}", panic_message(&*payload))),
        Err(_) => Outcome::Exception("callback thread exited without a result".into()),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
