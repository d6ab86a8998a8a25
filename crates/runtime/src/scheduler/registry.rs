use std::collections::HashSet;
use std::time::{Duration, Instant};

use extkit_core::config::MAX_INTERVAL_SECS;

use tracing::{debug, info};

use super::task::{DueTask, Task};
use crate::error::RegistryError;

/// Longest interval a task may be registered with.
pub const MAX_TASK_INTERVAL: Duration = Duration::from_secs(MAX_INTERVAL_SECS);

/// All registered tasks. Owned and mutated only by the scheduler loop.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Vec<Task>,
    names: HashSet<String>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task whose first run is due immediately.
    pub fn register(&mut self, task: Task) -> Result<(), RegistryError> {
        self.register_at(task, Instant::now())
    }

    /// Register a task whose first run is due at `first_due`.
    pub fn register_at(&mut self, mut task: Task, first_due: Instant) -> Result<(), RegistryError> {
        if task.interval().is_zero() {
            return Err(RegistryError::ZeroInterval(task.name().to_string()));
        }
        if task.interval() > MAX_TASK_INTERVAL {
            return Err(RegistryError::IntervalTooLong {
                name: task.name().to_string(),
                interval: task.interval(),
                max: MAX_TASK_INTERVAL,
            });
        }
        if !self.names.insert(task.name().to_string()) {
            return Err(RegistryError::DuplicateTask(task.name().to_string()));
        }
        task.next_due = first_due;
        info!(
            "Registered task: {} (interval: {:?}, timeout: {:?})",
            task.name(),
            task.interval(),
            task.timeout()
        );
        self.tasks.push(task);
        Ok(())
    }

    /// Collect every enabled task that is due at `now` and not already
    /// running, advancing each one's next due time. Tasks still in flight
    /// are skipped and keep their due time, so they run on the first tick
    /// after the previous execution returns.
    pub fn tick(&mut self, now: Instant, in_flight: impl Fn(&str) -> bool) -> Vec<DueTask> {
        let mut due = Vec::new();
        for task in self.tasks.iter_mut().filter(|t| t.is_enabled()) {
            if task.next_due > now {
                continue;
            }
            if in_flight(task.name()) {
                debug!(task = task.name(), "previous execution still running, skipping");
                continue;
            }
            task.advance(now);
            due.push(task.dispatch());
        }
        due
    }

    pub fn get(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name() == name)
    }

    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.tasks.iter_mut().find(|t| t.name() == name) {
            Some(task) => {
                task.set_enabled(enabled);
                true
            }
            None => false,
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.tasks.iter().map(Task::name).collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
