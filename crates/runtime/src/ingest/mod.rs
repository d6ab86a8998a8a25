//! Transports that deliver metrics, events and status to the ingest endpoint.

pub mod debug;
pub mod http;

use serde::Deserialize;
use serde_json::Value;

use extkit_core::Status;

use crate::error::IngestError;

pub use debug::DebugIngestClient;
pub use http::HttpIngestClient;

/// Maximum number of metric lines sent in one request.
pub const MAX_LINES_PER_REQUEST: usize = 1000;

/// Result of one metric ingest request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MintResponse {
    #[serde(default)]
    pub lines_ok: usize,
    #[serde(default)]
    pub lines_invalid: usize,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub warnings: Option<Value>,
}

impl MintResponse {
    /// A response in which every line was accepted.
    pub fn accepted(lines: usize) -> Self {
        Self {
            lines_ok: lines,
            ..Self::default()
        }
    }
}

/// Delivery channel to the ingest endpoint.
#[async_trait::async_trait]
pub trait IngestClient: Send + Sync {
    /// Send up to [`MAX_LINES_PER_REQUEST`] encoded metric lines.
    async fn send_metrics(&self, lines: &[String]) -> Result<MintResponse, IngestError>;

    /// Send log-ingest records (events and log lines).
    async fn send_events(&self, events: &[Value]) -> Result<(), IngestError>;

    /// Report the extension's overall health.
    async fn send_status(&self, status: &Status) -> Result<(), IngestError>;

    /// Name used in logs.
    fn name(&self) -> &str;
}
