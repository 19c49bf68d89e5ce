//! Multi-channel supervisor: reconciles the in-memory `channelId -> task` map
//! against the configured channel set, applies debounced restarts, forwards
//! recording-session events into metrics and notification dispatch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fc2_core::logging::{FilterHandle, LogLevel};
use fc2_core::{CallbackEvent, ChannelId, SessionError, Transport};
use futures::future::{AssertUnwindSafe, FutureExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{self, NotificationConfig, SupervisorConfig};
use crate::metrics::MetricsCollector;
use crate::notifications;

const RELOAD_INTERVAL: Duration = Duration::from_secs(1);

struct ChannelEntry {
    task: JoinHandle<()>,
    cancel: CancellationToken,
    last_start: Instant,
}

/// Shared supervisor state, cheaply cloned into every spawned channel task.
#[derive(Clone)]
struct Shared {
    transport: Transport,
    collector: Arc<MetricsCollector>,
    http_client: reqwest::Client,
}

/// Run the supervisor to completion (only returns on `root_cancel`).
///
/// `initial_config` is the already-loaded first parse of `config_path`
/// (fatal on failure, handled by the caller before this function is
/// invoked); every subsequent reload tick re-reads `config_path` itself.
pub async fn run(
    config_path: std::path::PathBuf,
    initial_config: SupervisorConfig,
    transport: Transport,
    collector: Arc<MetricsCollector>,
    filter_handle: FilterHandle,
    root_cancel: CancellationToken,
) -> anyhow::Result<()> {
    let mut config = initial_config;
    let mut applied_log_level: Option<String> = None;

    let shared = Shared {
        http_client: transport.client().clone(),
        transport,
        collector: collector.clone(),
    };
    let mut entries: HashMap<String, ChannelEntry> = HashMap::new();

    let mut ticker = tokio::time::interval(RELOAD_INTERVAL);
    loop {
        tokio::select! {
            _ = root_cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match config::load(&config_path) {
            Ok(reloaded) => config = reloaded,
            Err(e) => warn!(error = %e, "config reload failed, keeping last known-good document"),
        }

        if let Some(requested) = &config.autofc2.log_level {
            if applied_log_level.as_deref() != Some(requested.as_str()) {
                if let Ok(level) = requested.parse::<LogLevel>() {
                    fc2_core::logging::set_level(&filter_handle, level);
                    applied_log_level = Some(requested.clone());
                    info!(level = %requested, "applied log level from config reload");
                }
            }
        }

        reconcile(&config, &shared, &mut entries, &root_cancel);
    }

    for (_, entry) in entries.drain() {
        entry.cancel.cancel();
        entry.task.abort();
    }
    Ok(())
}

fn reconcile(
    config: &SupervisorConfig,
    shared: &Shared,
    entries: &mut HashMap<String, ChannelEntry>,
    root_cancel: &CancellationToken,
) {
    let configured: HashSet<&String> = config.channels.keys().collect();

    let to_remove: Vec<String> = entries
        .keys()
        .filter(|id| !configured.contains(id))
        .cloned()
        .collect();
    for channel_id in to_remove {
        if let Some(entry) = entries.remove(&channel_id) {
            debug!(channel = %channel_id, "channel removed from config, cancelling");
            entry.cancel.cancel();
            entry.task.abort();
        }
        shared.collector.remove_channel(&channel_id);
    }

    let debounce = config.autofc2.debounce();

    for channel_id in config.channels.keys() {
        let override_params = &config.channels[channel_id];
        let params = config::resolve_channel_params(&config.default_params, override_params);

        match entries.get(channel_id) {
            None => {
                info!(channel = %channel_id, "starting new channel recording");
                let entry = start_channel(
                    channel_id.clone(),
                    params,
                    config.notifications.clone(),
                    shared.clone(),
                    root_cancel,
                );
                entries.insert(channel_id.clone(), entry);
            }
            Some(entry) if entry.task.is_finished() => {
                let elapsed = entry.last_start.elapsed();
                if elapsed < debounce {
                    let remaining = debounce - elapsed;
                    debug!(channel = %channel_id, remaining_ms = remaining.as_millis(), "debouncing restart");
                    // Replace with a short-lived placeholder so this channel
                    // isn't re-evaluated as "finished and restartable" again
                    // before the debounce has elapsed.
                    let placeholder_cancel = CancellationToken::new();
                    let placeholder = tokio::spawn(async move {
                        tokio::time::sleep(remaining).await;
                    });
                    entries.insert(
                        channel_id.clone(),
                        ChannelEntry { task: placeholder, cancel: placeholder_cancel, last_start: entry.last_start },
                    );
                } else {
                    info!(channel = %channel_id, "restarting channel recording");
                    let entry = start_channel(
                        channel_id.clone(),
                        params,
                        config.notifications.clone(),
                        shared.clone(),
                        root_cancel,
                    );
                    entries.insert(channel_id.clone(), entry);
                }
            }
            Some(_) => {}
        }
    }
}

fn start_channel(
    channel_id_str: String,
    params: fc2_core::SessionParams,
    notification_configs: Vec<NotificationConfig>,
    shared: Shared,
    root_cancel: &CancellationToken,
) -> ChannelEntry {
    let cancel = root_cancel.child_token();
    let channel_id = ChannelId::from(channel_id_str.as_str());
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let event_channel_id = channel_id_str.clone();
    let event_collector = shared.collector.clone();
    let event_http_client = shared.http_client.clone();
    let event_transport = shared.transport.clone();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            event_collector.record_event(&event_channel_id, &event);
            if matches!(event, CallbackEvent::GotHlsUrl { .. }) && !notification_configs.is_empty() {
                let meta_client = fc2_core::metadata::LiveStreamClient::new(
                    event_transport.clone(),
                    ChannelId::from(event_channel_id.as_str()),
                );
                match meta_client.get_meta(false).await {
                    Ok(meta) => {
                        // A misbehaving notification target must not tear down
                        // the recording session that reported the event.
                        let dispatched = AssertUnwindSafe(notifications::dispatch(
                            &event_http_client,
                            &notification_configs,
                            &event_channel_id,
                            &meta,
                        ))
                        .catch_unwind()
                        .await;
                        if dispatched.is_err() {
                            error!(channel = %event_channel_id, "notification dispatch panicked");
                        }
                    }
                    Err(e) => warn!(channel = %event_channel_id, error = %e, "could not fetch metadata for notification"),
                }
            }
        }
    });

    let run_channel_id = channel_id_str.clone();
    let run_transport = shared.transport.clone();
    let run_collector = shared.collector.clone();
    let run_cancel = cancel.clone();
    let task = tokio::spawn(async move {
        let result = fc2_core::run_session(channel_id, run_transport, params, events_tx, run_cancel).await;
        log_session_outcome(&run_channel_id, result, &run_collector);
    });

    ChannelEntry { task, cancel, last_start: Instant::now() }
}

fn log_session_outcome(channel_id: &str, result: Result<(), SessionError>, collector: &MetricsCollector) {
    match result {
        Ok(()) => info!(channel = %channel_id, "recording session ended cleanly"),
        Err(e) => {
            error!(channel = %channel_id, error = %e, "recording session terminated with error");
            collector.record_error(channel_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debounce_defaults_to_thirty_seconds() {
        let settings = crate::config::AutoFc2Settings::default();
        assert_eq!(settings.debounce().as_secs(), 30);
    }
}
