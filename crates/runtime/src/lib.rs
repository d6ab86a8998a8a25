//! Runtime for periodic monitoring extensions.
//!
//! An [`Extension`] registers callbacks that the [`Scheduler`] runs at fixed
//! intervals on a bounded [`WorkerPool`]. Callbacks report metrics and events
//! through a [`CallbackContext`]; the [`Flusher`] periodically delivers the
//! buffered data together with self-monitoring metrics to an [`IngestClient`].

pub mod buffer;
pub mod context;
pub mod error;
pub mod extension;
pub mod flush;
pub mod ingest;
pub mod runtime;
pub mod scheduler;
pub mod sfm;
pub mod shutdown;
pub mod worker;

pub use buffer::{EventQueue, MetricBuffer};
pub use context::{CallbackContext, ReportSink};
pub use error::{IngestError, RegistryError, RuntimeError};
pub use extension::{Extension, Schedules};
pub use flush::{coalesce_deltas, FlushReport, Flusher, IngestHealth};
pub use ingest::{DebugIngestClient, HttpIngestClient, IngestClient, MintResponse};
pub use runtime::ExtensionRuntime;
pub use scheduler::{Callback, Scheduler, Task, TaskRegistry};
pub use sfm::{ExecutionRecord, Outcome, SelfMonitoringCollector};
pub use shutdown::{ShutdownCoordinator, ShutdownState};
pub use worker::WorkerPool;
