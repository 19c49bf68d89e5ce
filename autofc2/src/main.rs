mod config;
mod metrics;
mod notifications;
mod server;
mod supervisor;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use fc2_core::logging::{init_logging, LogLevel};
use fc2_core::Transport;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use metrics::MetricsCollector;

/// Multi-channel FC2 Live recording supervisor.
#[derive(Debug, Parser)]
#[command(name = "autofc2", version)]
struct Args {
    /// Path to the declarative channel configuration file.
    #[arg(long, default_value = "autofc2.json")]
    config: PathBuf,

    /// Initial log verbosity; `autofc2.log_level` in the config file can
    /// override this on any subsequent reload tick.
    #[arg(long, default_value = "info", value_parser = ["silent", "error", "warn", "info", "debug", "trace"])]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = run(args).await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let log_level = LogLevel::from_str(&args.log_level).map_err(anyhow::Error::msg)?;
    let filter_handle = init_logging(log_level);

    let transport = Transport::new()?;
    let collector = Arc::new(MetricsCollector::new());

    let root_cancel = CancellationToken::new();
    let ctrlc_cancel = root_cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, shutting down all channels");
            ctrlc_cancel.cancel();
        }
    });

    // The metrics config is only known after the first config load, which
    // `supervisor::run` owns; re-reading it once up front here is cheap and
    // lets the metrics server bind before the supervisor loop starts.
    let initial_config = config::load(&args.config)
        .map_err(|e| anyhow::anyhow!("fatal: could not load initial config: {e}"))?;

    let metrics_cancel = root_cancel.clone();
    let metrics_collector = collector.clone();
    let metrics_config = initial_config.autofc2.metrics.clone();
    let metrics_task = tokio::spawn(async move {
        tokio::select! {
            _ = metrics_cancel.cancelled() => Ok(()),
            res = server::run(metrics_config, metrics_collector) => res,
        }
    });

    let supervisor_result = supervisor::run(
        args.config,
        initial_config,
        transport,
        collector,
        filter_handle,
        root_cancel,
    )
    .await;

    metrics_task.abort();

    if let Err(e) = &supervisor_result {
        error!(error = %e, "supervisor terminated with error");
    }
    supervisor_result
}
