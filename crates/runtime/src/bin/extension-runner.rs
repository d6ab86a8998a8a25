//! extension-runner: runs the bundled host-stats extension.
//!
//! Reports load averages and runtime uptime every query interval. Data goes
//! to the ingest endpoint given by `--ingest-url` (or `EXTKIT_INGEST_URL`);
//! without one, everything is logged instead.

use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{info, warn};

use extkit_core::config::load_dotenv;
use extkit_core::{Event, RuntimeConfig, Severity, Status, StatusValue};
use extkit_runtime::{CallbackContext, Extension, ExtensionRuntime, Schedules};

// ── CLI ─────────────────────────────────────────────────────────────

/// Run the host-stats extension.
#[derive(Parser, Debug)]
#[command(name = "extension-runner", version, about)]
struct Cli {
    /// Optional TOML config file; environment variables apply when absent.
    #[arg(long, env = "EXTKIT_CONFIG")]
    config: Option<String>,

    /// Ingest endpoint base URL, e.g. http://localhost:14499.
    #[arg(long)]
    ingest_url: Option<String>,

    /// Query interval in seconds.
    #[arg(long)]
    query_interval: Option<u64>,

    /// Timeout for a single query run in seconds.
    #[arg(long, default_value_t = 30)]
    query_timeout: u64,
}

// ── HostStats ───────────────────────────────────────────────────────

struct HostStats {
    started: Instant,
    timeout: Duration,
}

impl HostStats {
    fn load_average() -> anyhow::Result<[f64; 3]> {
        let raw = std::fs::read_to_string("/proc/loadavg")?;
        let mut fields = raw.split_whitespace().map(str::parse::<f64>);
        let mut out = [0.0; 3];
        for slot in &mut out {
            *slot = fields
                .next()
                .ok_or_else(|| anyhow::anyhow!("short /proc/loadavg"))??;
        }
        Ok(out)
    }
}

impl Extension for HostStats {
    fn name(&self) -> &str {
        "host-stats"
    }

    fn fastcheck(&self) -> Status {
        match Self::load_average() {
            Ok(_) => Status::ok(),
            Err(e) => Status::new(StatusValue::InvalidConfigError, format!("cannot read load average: {e}")),
        }
    }

    fn initialize(&self, schedules: &mut Schedules<'_>) -> anyhow::Result<()> {
        let started = self.started;
        schedules.schedule("uptime", Duration::from_secs(10), move |ctx: &CallbackContext| -> anyhow::Result<()> {
            ctx.gauge("extension.uptime", started.elapsed().as_secs_f64(), &[])?;
            Ok(())
        })?;
        Ok(())
    }

    fn query(&self, ctx: &CallbackContext) -> anyhow::Result<()> {
        let [one, five, fifteen] = Self::load_average()?;
        ctx.gauge("host.load", one, &[("window", "1m")])?;
        ctx.gauge("host.load", five, &[("window", "5m")])?;
        ctx.gauge("host.load", fifteen, &[("window", "15m")])?;
        ctx.delta("host.query.runs", 1.0, &[])?;

        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1) as f64;
        if one > cores {
            ctx.report_event(
                &Event::new("High load", format!("1m load {one:.2} exceeds {cores} cores"))
                    .severity(Severity::Warn),
            );
        }
        Ok(())
    }

    fn query_timeout(&self) -> Option<Duration> {
        Some(self.timeout)
    }

    fn on_shutdown(&self) {
        info!(uptime = ?self.started.elapsed(), "host-stats shutting down");
    }
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match RuntimeConfig::from_file(path) {
            Ok(cfg) => {
                info!(path = %path, "loaded runtime config");
                cfg
            }
            Err(e) => {
                warn!(error = %e, path = %path, "failed to load config, using environment");
                RuntimeConfig::from_env()
            }
        },
        None => RuntimeConfig::from_env(),
    };
    if let Some(url) = cli.ingest_url {
        config.ingest_url = Some(url);
    }
    if let Some(secs) = cli.query_interval {
        config.query_interval_secs = secs;
    }
    if config.extension_name.is_empty() {
        config.extension_name = "host-stats".to_string();
    }

    let runtime = ExtensionRuntime::from_config(config)?;
    let extension = HostStats {
        started: Instant::now(),
        timeout: Duration::from_secs(cli.query_timeout),
    };
    let report = runtime.run(extension).await?;
    info!(lines = report.lines_sent, "extension-runner stopped");
    Ok(())
}
