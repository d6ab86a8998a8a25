//! The trait an extension implements to plug into the runtime.

use std::sync::Arc;
use std::time::Duration;

use extkit_core::Status;

use crate::context::CallbackContext;
use crate::error::RegistryError;
use crate::scheduler::{Callback, Task, TaskRegistry};

/// Name of the task that runs [`Extension::query`].
pub const QUERY_TASK: &str = "query";

/// An extension: a fast check, optional extra schedules and a periodic query.
///
/// Every method runs synchronously. `query` and scheduled callbacks run on
/// worker threads. `fastcheck`, `initialize` and `on_shutdown` run on the
/// tokio blocking pool, so they may block or drive async work through
/// `tokio::runtime::Handle::block_on`.
pub trait Extension: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Validate configuration and connectivity before anything is scheduled.
    /// An error status stops the runtime.
    fn fastcheck(&self) -> Status {
        Status::ok()
    }

    /// Register additional periodic callbacks.
    fn initialize(&self, _schedules: &mut Schedules<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    /// The primary periodic collection.
    fn query(&self, ctx: &CallbackContext) -> anyhow::Result<()>;

    fn query_timeout(&self) -> Option<Duration> {
        None
    }

    /// Runs once when shutdown begins, before in-flight work is drained.
    fn on_shutdown(&self) {}
}

/// Registration handle given to [`Extension::initialize`].
pub struct Schedules<'a> {
    registry: &'a mut TaskRegistry,
}

impl<'a> Schedules<'a> {
    pub(crate) fn new(registry: &'a mut TaskRegistry) -> Self {
        Self { registry }
    }

    /// Run `callback` every `interval`, starting immediately.
    pub fn schedule(
        &mut self,
        name: &str,
        interval: Duration,
        callback: impl Callback,
    ) -> Result<(), RegistryError> {
        self.registry.register(Task::new(name, interval, callback))
    }

    /// Register a fully configured task.
    pub fn add(&mut self, task: Task) -> Result<(), RegistryError> {
        self.registry.register(task)
    }
}

/// Adapts [`Extension::query`] to a [`Callback`].
pub(crate) struct QueryCallback<E>(pub(crate) Arc<E>);

impl<E: Extension> Callback for QueryCallback<E> {
    fn run(&self, ctx: &CallbackContext) -> anyhow::Result<()> {
        self.0.query(ctx)
    }
}
