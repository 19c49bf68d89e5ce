use clap::Parser;
use std::path::PathBuf;

/// Record a single FC2 Live broadcast to a local file.
#[derive(Debug, Parser)]
#[command(name = "fc2-dl", version)]
pub struct Args {
    /// Channel URL, e.g. https://live.fc2.com/<channelId>/
    pub url: String,

    /// Target quality.
    #[arg(long, default_value = "3Mbps", value_parser = ["150Kbps", "400Kbps", "1.2Mbps", "2Mbps", "3Mbps", "sound"])]
    pub quality: String,

    /// Target latency.
    #[arg(long, default_value = "mid", value_parser = ["low", "mid", "high"])]
    pub latency: String,

    /// Number of parallel fragment-download workers.
    #[arg(long, default_value_t = 1)]
    pub threads: usize,

    /// Output filename template.
    #[arg(short, long, default_value = "%(date)s %(title)s (%(channel_name)s).%(ext)s")]
    pub output: String,

    /// Skip remuxing the recorded transport stream to MP4/M4A.
    #[arg(long)]
    pub no_remux: bool,

    /// Keep the intermediate .ts file after remuxing.
    #[arg(short = 'k', long)]
    pub keep_intermediates: bool,

    /// Additionally extract an audio-only .m4a.
    #[arg(short = 'x', long)]
    pub extract_audio: bool,

    /// Path to a Netscape-format cookies file.
    #[arg(long)]
    pub cookies: Option<PathBuf>,

    /// Persist chat comments to a .fc2chat.json file.
    #[arg(long)]
    pub write_chat: bool,

    /// Write channel metadata to an info.json file.
    #[arg(long)]
    pub write_info_json: bool,

    /// Download the channel thumbnail.
    #[arg(long)]
    pub write_thumbnail: bool,

    /// Wait for the channel to go live instead of failing immediately.
    #[arg(long)]
    pub wait: bool,

    /// Seconds between online-status probes while waiting.
    #[arg(long, default_value_t = 5)]
    pub poll_interval: u64,

    /// Log verbosity.
    #[arg(long, default_value = "info", value_parser = ["silent", "error", "warn", "info", "debug", "trace"])]
    pub log_level: String,

    /// Record raw websocket control frames to a .websocket.jsonl file.
    #[arg(long)]
    pub dump_websocket: bool,
}
