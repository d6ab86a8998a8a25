//! HTTP transport for a local ingest endpoint.
//!
//! Metrics are POSTed as newline-joined text to `{base}/mint/{datasource}`,
//! log records as a JSON array to `{base}/logs/{datasource}` and status as a
//! JSON object to `{base}/alive/{datasource}`.

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use extkit_core::Status;

use super::{IngestClient, MintResponse};
use crate::error::IngestError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct HttpIngestClient {
    metrics_url: String,
    events_url: String,
    status_url: String,
    client: reqwest::Client,
}

impl HttpIngestClient {
    pub fn new(base_url: &str, datasource_id: &str) -> Result<Self, IngestError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let base = base_url.trim_end_matches('/');
        Ok(Self {
            metrics_url: format!("{base}/mint/{datasource_id}"),
            events_url: format!("{base}/logs/{datasource_id}"),
            status_url: format!("{base}/alive/{datasource_id}"),
            client,
        })
    }

    pub fn metrics_url(&self) -> &str {
        &self.metrics_url
    }

    pub fn events_url(&self) -> &str {
        &self.events_url
    }

    pub fn status_url(&self) -> &str {
        &self.status_url
    }

    async fn check(url: &str, response: reqwest::Response) -> Result<String, IngestError> {
        let status = response.status();
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<unreadable body>".to_string());
        if !status.is_success() {
            warn!(url, %status, body = %body, "ingest endpoint returned non-2xx status");
            return Err(IngestError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(body)
    }
}

/// Decode a metric ingest response. An empty body means every line was
/// accepted.
pub fn parse_mint_response(body: &str, sent: usize) -> Result<MintResponse, IngestError> {
    if body.trim().is_empty() {
        return Ok(MintResponse::accepted(sent));
    }
    serde_json::from_str(body).map_err(|e| IngestError::Decode(e.to_string()))
}

#[async_trait::async_trait]
impl IngestClient for HttpIngestClient {
    async fn send_metrics(&self, lines: &[String]) -> Result<MintResponse, IngestError> {
        let response = self
            .client
            .post(&self.metrics_url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(lines.join("\n"))
            .send()
            .await?;
        let body = Self::check(&self.metrics_url, response).await?;
        let parsed = parse_mint_response(&body, lines.len())?;
        debug!(
            lines_ok = parsed.lines_ok,
            lines_invalid = parsed.lines_invalid,
            "metric lines delivered"
        );
        Ok(parsed)
    }

    async fn send_events(&self, events: &[Value]) -> Result<(), IngestError> {
        let response = self.client.post(&self.events_url).json(events).send().await?;
        Self::check(&self.events_url, response).await?;
        debug!(count = events.len(), "events delivered");
        Ok(())
    }

    async fn send_status(&self, status: &Status) -> Result<(), IngestError> {
        let response = self.client.post(&self.status_url).json(status).send().await?;
        Self::check(&self.status_url, response).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "http"
    }
}
