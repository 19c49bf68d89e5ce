mod cli;

use std::str::FromStr;
use std::sync::Arc;

use clap::Parser;
use fc2_core::logging::{init_logging, LogLevel};
use fc2_core::{ChannelId, CallbackEvent, SessionParams, Transport};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cli::Args;

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
    init_logging(log_level);

    let channel_id = extract_channel_id(&args.url)?;

    let jar = Arc::new(reqwest::cookie::Jar::default());
    if let Some(path) = &args.cookies {
        let loaded = fc2_core::cookies_file::load_into_jar(path, &jar)?;
        info!(cookies_file = %path.display(), loaded, "loaded cookies");
    }
    let transport = Transport::with_jar(jar)?;

    let params = SessionParams {
        quality: args.quality,
        latency: args.latency,
        threads: args.threads,
        output_template: args.output,
        remux: !args.no_remux,
        keep_intermediates: args.keep_intermediates,
        extract_audio: args.extract_audio,
        write_chat: args.write_chat,
        write_info_json: args.write_info_json,
        write_thumbnail: args.write_thumbnail,
        wait_for_live: args.wait,
        poll_interval: std::time::Duration::from_secs(args.poll_interval),
        dump_websocket: args.dump_websocket,
        ..SessionParams::default()
    };

    let cancel = CancellationToken::new();
    let ctrlc_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, shutting down");
            ctrlc_cancel.cancel();
        }
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            log_event(&event);
        }
    });

    info!(channel = %channel_id, "starting recording session");
    match fc2_core::run_session(channel_id.clone(), transport, params, events_tx, cancel).await {
        Ok(()) => {
            info!(channel = %channel_id, "recording session finished");
            Ok(())
        }
        Err(err) => {
            error!(channel = %channel_id, error = %err, "recording session failed");
            Err(anyhow::anyhow!(err))
        }
    }
}

/// Extract the channel id: the path segment immediately after the host of
/// `https://live.fc2.com/<channelId>/...`.
fn extract_channel_id(url: &str) -> anyhow::Result<ChannelId> {
    let parsed = url::Url::parse(url)?;
    let id = parsed
        .path_segments()
        .and_then(|mut segments| segments.next())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow::anyhow!("could not find a channel id in {url}"))?;
    Ok(ChannelId::from(id))
}

fn log_event(event: &CallbackEvent) {
    match event {
        CallbackEvent::WaitingForOnline => info!("waiting for channel to go live"),
        CallbackEvent::StreamOnline => info!("channel is online"),
        CallbackEvent::WaitingForTargetQuality => info!("waiting for target quality to appear"),
        CallbackEvent::GotHlsUrl { url } => info!(%url, "resolved HLS media playlist"),
        CallbackEvent::FragmentProgress { downloaded_bytes, fragment_count } => {
            info!(downloaded_bytes, fragment_count, "downloading")
        }
        CallbackEvent::Muxing => info!("remuxing to final container"),
    }
}
