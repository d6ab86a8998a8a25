//! Transport that logs instead of sending, used when no ingest URL is set.

use serde_json::Value;
use tracing::info;

use extkit_core::Status;

use super::{IngestClient, MintResponse};
use crate::error::IngestError;

#[derive(Debug, Clone, Default)]
pub struct DebugIngestClient {
    print_lines: bool,
}

impl DebugIngestClient {
    pub fn new(print_lines: bool) -> Self {
        Self { print_lines }
    }
}

#[async_trait::async_trait]
impl IngestClient for DebugIngestClient {
    async fn send_metrics(&self, lines: &[String]) -> Result<MintResponse, IngestError> {
        info!(count = lines.len(), "would send metric lines");
        if self.print_lines {
            for line in lines {
                info!("  {line}");
            }
        }
        Ok(MintResponse::accepted(lines.len()))
    }

    async fn send_events(&self, events: &[Value]) -> Result<(), IngestError> {
        info!(count = events.len(), "would send events");
        if self.print_lines {
            for event in events {
                info!("  {event}");
            }
        }
        Ok(())
    }

    async fn send_status(&self, status: &Status) -> Result<(), IngestError> {
        info!(status = %status, "would send status");
        Ok(())
    }

    fn name(&self) -> &str {
        "debug"
    }
}
