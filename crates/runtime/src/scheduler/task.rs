use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::context::CallbackContext;

/// A unit of periodic work executed by the worker pool.
///
/// Callbacks are synchronous and run on their own OS thread, so they may
/// block on I/O freely. Returning an error (or panicking) counts as an
/// exception in self-monitoring and never stops the runtime.
pub trait Callback: Send + Sync + 'static {
    fn run(&self, ctx: &CallbackContext) -> anyhow::Result<()>;
}

impl<F> Callback for F
where
    F: Fn(&CallbackContext) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn run(&self, ctx: &CallbackContext) -> anyhow::Result<()> {
        self(ctx)
    }
}

/// A registered periodic task and its scheduling state.
pub struct Task {
    name: String,
    callback: Arc<dyn Callback>,
    interval: Duration,
    timeout: Option<Duration>,
    enabled: bool,
    pub(crate) last_run: Option<Instant>,
    pub(crate) next_due: Instant,
}

impl Task {
    pub fn new(name: impl Into<String>, interval: Duration, callback: impl Callback) -> Self {
        Self::from_arc(name, interval, Arc::new(callback))
    }

    pub fn from_arc(name: impl Into<String>, interval: Duration, callback: Arc<dyn Callback>) -> Self {
        Self {
            name: name.into(),
            callback,
            interval,
            timeout: None,
            enabled: true,
            last_run: None,
            next_due: Instant::now(),
        }
    }

    /// Abandon executions that run longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn last_run(&self) -> Option<Instant> {
        self.last_run
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    /// Advance `next_due` past `now` on the task's fixed grid. Missed slots
    /// are skipped rather than replayed.
    pub(crate) fn advance(&mut self, now: Instant) {
        self.last_run = Some(now);
        let mut next = self.next_due.checked_add(self.interval).unwrap_or(now);
        if next <= now {
            let behind = now.duration_since(next).as_nanos();
            let step = self.interval.as_nanos().max(1);
            let skip = (behind / step + 1).min(u32::MAX as u128) as u32;
            next = self
                .interval
                .checked_mul(skip)
                .and_then(|gap| next.checked_add(gap))
                .unwrap_or(now);
        }
        self.next_due = next;
    }

    pub(crate) fn dispatch(&self) -> DueTask {
        DueTask {
            name: self.name.clone(),
            callback: Arc::clone(&self.callback),
            timeout: self.timeout,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .field("enabled", &self.enabled)
            .field("last_run", &self.last_run)
            .field("next_due", &self.next_due)
            .finish()
    }
}

/// What the worker pool needs to run one execution of a task.
#[derive(Clone)]
pub struct DueTask {
    pub name: String,
    pub callback: Arc<dyn Callback>,
    pub timeout: Option<Duration>,
}

impl fmt::Debug for DueTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DueTask")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &CallbackContext) -> anyhow::Result<()> {
        Ok(())
    }

    #[test]
    fn advance_stays_on_grid() {
        let t0 = Instant::now();
        let mut task = Task::new("t", Duration::from_secs(10), noop);
        task.next_due = t0;
        task.advance(t0 + Duration::from_secs(1));
        assert_eq!(task.next_due, t0 + Duration::from_secs(10));
    }

    #[test]
    fn advance_skips_missed_slots() {
        let t0 = Instant::now();
        let mut task = Task::new("t", Duration::from_secs(10), noop);
        task.next_due = t0;
        task.advance(t0 + Duration::from_secs(35));
        assert_eq!(task.next_due, t0 + Duration::from_secs(40));
    }

    #[test]
    fn advance_does_not_overflow_on_huge_interval() {
        let t0 = Instant::now();
        let mut task = Task::new("t", Duration::MAX, noop);
        task.next_due = t0;
        task.advance(t0);
        assert!(task.next_due >= t0);
        assert_eq!(task.last_run, Some(t0));
    }

    #[test]
    fn advance_on_exact_slot_moves_one_interval() {
        let t0 = Instant::now();
        let mut task = Task::new("t", Duration::from_secs(10), noop);
        task.next_due = t0;
        task.advance(t0 + Duration::from_secs(10));
        assert_eq!(task.next_due, t0 + Duration::from_secs(20));
    }
}
