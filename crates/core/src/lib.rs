pub mod config;
pub mod error;
pub mod event;
pub mod line;
pub mod metric;
pub mod status;

pub use config::RuntimeConfig;
pub use error::*;
pub use event::{Event, Severity};
pub use line::{encode, parse_line};
pub use metric::{Metric, MetricKind, MetricValue, SummaryStat};
pub use status::{MultiStatus, Status, StatusValue};
