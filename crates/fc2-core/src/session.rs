//! Recording session orchestrator (component E): composes metadata, the
//! control channel, the HLS downloader, chat persistence, and the post-run
//! remux into one per-channel recording run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::control::ControlSession;
use crate::error::{ControlError, SessionError};
use crate::ffmpeg::Remuxer;
use crate::filename::{expand_template, resolve_unique_path, sanitize_filename, TemplateTokens};
use crate::metadata::{ChannelId, LiveStreamClient, StreamMeta};
use crate::playlist::{compose_mode, select_variant};
use crate::transport::Transport;
use crate::downloader::HlsDownloader;

/// Events emitted during a recording run, consumed by the CLI for inline
/// progress display and by the supervisor for metrics/notifications.
#[derive(Debug, Clone)]
pub enum CallbackEvent {
    WaitingForOnline,
    StreamOnline,
    WaitingForTargetQuality,
    GotHlsUrl { url: String },
    FragmentProgress { downloaded_bytes: u64, fragment_count: u64 },
    Muxing,
}

/// Per-session parameters. The CLI builds one directly from flags; the
/// supervisor builds one per channel by deep-copying `default_params` and
/// shallow-merging the channel override (see `autofc2::config`).
#[derive(Debug, Clone)]
pub struct SessionParams {
    pub quality: String,
    pub latency: String,
    pub threads: usize,
    pub output_template: String,
    pub remux: bool,
    pub keep_intermediates: bool,
    pub extract_audio: bool,
    pub write_chat: bool,
    pub write_info_json: bool,
    pub write_thumbnail: bool,
    pub wait_for_live: bool,
    pub poll_interval: Duration,
    pub wait_for_quality_timeout: Duration,
    pub dump_websocket: bool,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            quality: "3Mbps".to_string(),
            latency: "mid".to_string(),
            threads: 1,
            output_template: "%(date)s %(title)s (%(channel_name)s).%(ext)s".to_string(),
            remux: true,
            keep_intermediates: false,
            extract_audio: false,
            write_chat: false,
            write_info_json: false,
            write_thumbnail: false,
            wait_for_live: false,
            poll_interval: Duration::from_secs(5),
            wait_for_quality_timeout: Duration::from_secs(15),
            dump_websocket: false,
        }
    }
}

struct ResolvedPaths {
    stream: PathBuf,
    chat: Option<PathBuf>,
    info: Option<PathBuf>,
    thumbnail: Option<PathBuf>,
    muxed: PathBuf,
    audio: Option<PathBuf>,
    ws_dump: Option<PathBuf>,
}

fn resolve_paths(
    template: &str,
    channel_id: &str,
    meta: &StreamMeta,
    params: &SessionParams,
    sound_only: bool,
) -> std::io::Result<ResolvedPaths> {
    // Sanitize each token's *value* before it is substituted into the
    // template, so a `/` or other illegal character inside e.g. the title
    // becomes `_` instead of being interpreted as a literal path separator
    // once merged into the expanded string.
    let channel_id = sanitize_filename(channel_id);
    let channel_name = sanitize_filename(meta.channel_name());
    let title = sanitize_filename(meta.title());

    let make = |ext: &str| -> std::io::Result<PathBuf> {
        let tokens = TemplateTokens {
            channel_id: &channel_id,
            channel_name: &channel_name,
            title: &title,
            ext,
        };
        let expanded = expand_template(template, &tokens);
        let sanitized = sanitize_component(&expanded);
        resolve_unique_path(&PathBuf::from(sanitized))
    };

    let muxed_ext = if sound_only { "m4a" } else { "mp4" };

    Ok(ResolvedPaths {
        stream: make("ts")?,
        chat: if params.write_chat { Some(make("fc2chat.json")?) } else { None },
        info: if params.write_info_json { Some(make("info.json")?) } else { None },
        thumbnail: if params.write_thumbnail { Some(make("png")?) } else { None },
        muxed: make(muxed_ext)?,
        audio: if params.extract_audio { Some(make("m4a")?) } else { None },
        ws_dump: if params.dump_websocket { Some(make("websocket.jsonl")?) } else { None },
    })
}

/// Sanitize each path component independently so separators supplied by the
/// template's surrounding text are preserved while each filename-shaped
/// piece is sanitized on its own.
fn sanitize_component(path: &str) -> String {
    path.split(std::path::MAIN_SEPARATOR)
        .map(sanitize_filename)
        .collect::<Vec<_>>()
        .join(std::path::MAIN_SEPARATOR_STR)
}

/// Run one channel's full recording session to completion.
pub async fn run(
    channel_id: ChannelId,
    transport: Transport,
    params: SessionParams,
    events: mpsc::UnboundedSender<CallbackEvent>,
    cancel: CancellationToken,
) -> Result<(), SessionError> {
    let meta_client = LiveStreamClient::new(transport.clone(), channel_id.clone());

    if !meta_client.is_online(true).await? {
        if !params.wait_for_live {
            return Err(SessionError::Meta(crate::error::MetaError::NotOnline));
        }
        let _ = events.send(CallbackEvent::WaitingForOnline);
        meta_client.wait_for_online(params.poll_interval).await?;
    }
    let _ = events.send(CallbackEvent::StreamOnline);

    let meta = meta_client.get_meta(false).await?;
    let sound_only = params.quality == "sound";
    let paths = resolve_paths(&params.output_template, &channel_id.0, &meta, &params, sound_only)?;

    if let Some(info_path) = &paths.info {
        let doc = serde_json::json!({
            "channel_id": meta.channel_data.channelid,
            "title": meta.title(),
            "channel_name": meta.channel_name(),
            "thumbnail": meta.thumbnail_url(),
        });
        tokio::fs::write(info_path, serde_json::to_vec(&doc)?).await?;
    }

    if let Some(thumb_path) = &paths.thumbnail {
        if !meta.thumbnail_url().is_empty() {
            if let Err(e) = download_thumbnail(&transport, meta.thumbnail_url(), thumb_path).await {
                warn!(error = %e, "failed to download thumbnail");
            }
        }
    }

    let ws_url = meta_client.get_websocket_url().await?;
    let cookie_header = transport.cookie_header();
    let control = Arc::new(ControlSession::connect(&ws_url, cookie_header).await?);

    let target_mode = compose_mode(&params.quality, &params.latency)
        .unwrap_or_else(|| compose_mode("3Mbps", "mid").unwrap());

    let _ = events.send(CallbackEvent::WaitingForTargetQuality);
    let deadline = Instant::now() + params.wait_for_quality_timeout;
    let mut variants = Vec::new();
    loop {
        let resp = control.get_hls_information().await?;
        variants = resp.merged_sorted();
        if variants.iter().any(|v| v.mode == target_mode) || Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    let chosen = select_variant(&variants, target_mode)
        .ok_or(ControlError::EmptyPlaylist)?
        .clone();
    let _ = events.send(CallbackEvent::GotHlsUrl { url: chosen.url.clone() });

    let downloader = Arc::new(HlsDownloader::start(
        transport.client().clone(),
        chosen.url.clone(),
        params.threads.max(1),
    ));

    let disconnect_control = control.clone();
    let disconnect_task = tokio::spawn(async move { disconnect_control.wait_disconnection().await });

    let download_downloader = downloader.clone();
    let download_events = events.clone();
    let stream_path = paths.stream.clone();
    let mut download_task: tokio::task::JoinHandle<Result<(), SessionError>> = tokio::spawn(async move {
        download_to_file(download_downloader, stream_path, download_events).await
    });

    let mut chat_task: tokio::task::JoinHandle<Result<(), SessionError>> = if params.write_chat {
        let chat_path = paths.chat.clone().expect("write_chat implies chat path resolved");
        let chat_control = control.clone();
        tokio::spawn(async move { persist_chat(chat_control, chat_path).await })
    } else {
        // Never completes: keeps the race below a uniform three-way select
        // without chat persistence ever being able to "win" when disabled.
        tokio::spawn(async { std::future::pending::<Result<(), SessionError>>().await })
    };

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(()),
        res = disconnect_task => map_disconnect_result(res),
        res = &mut download_task => map_join_result(res),
        res = &mut chat_task => map_join_result(res),
    };

    download_task.abort();
    chat_task.abort();
    downloader.shutdown().await;
    control.shutdown().await;

    let result = match outcome {
        Ok(()) => Ok(()),
        Err(e) if e.is_clean_end() => {
            info!(channel = %channel_id, "stream ended");
            Ok(())
        }
        Err(e) => Err(e),
    };

    if params.remux && paths.stream.exists() {
        let _ = events.send(CallbackEvent::Muxing);
        match remux(&paths.stream, &paths.muxed).await {
            Ok(()) => {
                if params.extract_audio {
                    if let Some(audio_path) = &paths.audio {
                        if let Err(e) = remux_audio_only(&paths.stream, audio_path).await {
                            error!(error = %e, "audio extraction failed");
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SessionError::ToolUnavailable("ffmpeg".to_string()));
            }
            Err(e) => error!(error = %e, "remux failed"),
        }
        if !params.keep_intermediates && paths.muxed.exists() {
            let _ = tokio::fs::remove_file(&paths.stream).await;
        }
    }

    result
}

fn map_disconnect_result(res: Result<ControlError, tokio::task::JoinError>) -> Result<(), SessionError> {
    match res {
        Ok(err) => Err(SessionError::Control(err)),
        Err(_) => Err(SessionError::Control(ControlError::Closed)),
    }
}

fn map_join_result(
    res: Result<Result<(), SessionError>, tokio::task::JoinError>,
) -> Result<(), SessionError> {
    match res {
        Ok(inner) => inner,
        Err(_) => Ok(()),
    }
}

async fn download_to_file(
    downloader: Arc<HlsDownloader>,
    path: PathBuf,
    events: mpsc::UnboundedSender<CallbackEvent>,
) -> Result<(), SessionError> {
    let file = File::create(&path).await?;
    let mut writer = BufWriter::new(file);
    let mut downloaded_bytes: u64 = 0;
    let mut fragment_count: u64 = 0;

    while let Some(bytes) = downloader.read_next().await {
        writer.write_all(&bytes).await?;
        downloaded_bytes += bytes.len() as u64;
        fragment_count += 1;
        let _ = events.send(CallbackEvent::FragmentProgress { downloaded_bytes, fragment_count });
    }
    writer.flush().await?;
    Ok(())
}

async fn persist_chat(control: Arc<ControlSession>, path: PathBuf) -> Result<(), SessionError> {
    let mut rx = control
        .take_comments()
        .expect("chat persister is the sole consumer of the comments channel");
    let file = File::create(&path).await?;
    let mut writer = BufWriter::new(file);
    while let Some(comment) = rx.recv().await {
        let mut line = serde_json::to_vec(&comment)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}

async fn download_thumbnail(transport: &Transport, url: &str, path: &PathBuf) -> std::io::Result<()> {
    use futures::StreamExt;

    let resp = transport
        .client()
        .get(url)
        .send()
        .await
        .map_err(std::io::Error::other)?;
    let mut stream = resp.bytes_stream();
    let file = File::create(path).await?;
    let mut writer = BufWriter::new(file);
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(std::io::Error::other)?;
        // The spec calls for 1 KiB chunking; reqwest's stream already yields
        // network-sized chunks, so re-chunk to the mandated size.
        for piece in chunk.chunks(1024) {
            writer.write_all(piece).await?;
        }
    }
    writer.flush().await?;
    Ok(())
}

async fn remux(input: &PathBuf, output: &PathBuf) -> std::io::Result<()> {
    let remuxer = Remuxer::spawn(input, output, &[])?;
    remuxer.run_to_completion(|_status| {}).await?;
    Ok(())
}

async fn remux_audio_only(input: &PathBuf, output: &PathBuf) -> std::io::Result<()> {
    let remuxer = Remuxer::spawn(input, output, &["-vn"])?;
    remuxer.run_to_completion(|_status| {}).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_component_preserves_separators() {
        let out = sanitize_component("dir/name: bad.ts");
        assert!(out.contains('/'));
        assert!(!out.contains(':'));
    }

    #[test]
    fn title_is_sanitized_before_template_substitution() {
        // A `/` inside the title must not be mistaken for a literal path
        // separator once merged into the expanded template.
        let title = sanitize_filename("hello/world: <test>");
        let tokens = TemplateTokens {
            channel_id: "1",
            channel_name: "chan",
            title: &title,
            ext: "ts",
        };
        let expanded = expand_template("%(title)s.%(ext)s", &tokens);
        assert_eq!(expanded, "hello_world_ _test_.ts");
        assert_eq!(sanitize_component(&expanded), "hello_world_ _test_.ts");
    }
}
