//! Fixed-interval task scheduling.
//!
//! The [`TaskRegistry`] holds every registered [`Task`] and decides which are
//! due on each tick. The [`Scheduler`] owns the registry and drives it from a
//! tokio interval, handing due tasks to the [`WorkerPool`](crate::worker::WorkerPool).

pub mod registry;
pub mod runner;
pub mod task;

pub use registry::TaskRegistry;
pub use runner::Scheduler;
pub use task::{Callback, DueTask, Task};
