//! Per-channel scrape metrics: a one-hot gauge over the event enum plus
//! running fragment/byte counters, exported in Prometheus text format.
//!
//! Grounded on the teacher's `rust_srec::metrics::{collector, prometheus}`
//! split (a plain collector struct behind one mutex, a stateless exporter
//! that snapshots and formats) but reduced to the handful of series this
//! supervisor actually emits.

use std::collections::HashMap;
use std::sync::Mutex;

use fc2_core::CallbackEvent;

/// The closed set of recording-session events, plus the supervisor's own
/// `error` pseudo-event for a terminated session (see §7 of the design).
pub const EVENT_KINDS: &[&str] = &[
    "WAITING_FOR_ONLINE",
    "STREAM_ONLINE",
    "WAITING_FOR_TARGET_QUALITY",
    "GOT_HLS_URL",
    "FRAGMENT_PROGRESS",
    "MUXING",
    "ERROR",
];

fn event_kind(event: &CallbackEvent) -> &'static str {
    match event {
        CallbackEvent::WaitingForOnline => "WAITING_FOR_ONLINE",
        CallbackEvent::StreamOnline => "STREAM_ONLINE",
        CallbackEvent::WaitingForTargetQuality => "WAITING_FOR_TARGET_QUALITY",
        CallbackEvent::GotHlsUrl { .. } => "GOT_HLS_URL",
        CallbackEvent::FragmentProgress { .. } => "FRAGMENT_PROGRESS",
        CallbackEvent::Muxing => "MUXING",
    }
}

#[derive(Default)]
struct ChannelCounters {
    /// One-hot: the currently active event kind for this channel.
    active_event: Option<&'static str>,
    fragments_downloaded: u64,
    bytes_downloaded: u64,
}

/// A snapshot safe to format or compare without holding the collector's lock.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub channels: Vec<ChannelSnapshot>,
}

#[derive(Debug, Clone)]
pub struct ChannelSnapshot {
    pub channel_id: String,
    pub active_event: Option<&'static str>,
    pub fragments_downloaded: u64,
    pub bytes_downloaded: u64,
}

/// Shared counters, one mutex held only for the duration of an update or
/// a snapshot copy (never across an `.await`).
#[derive(Default)]
pub struct MetricsCollector {
    channels: Mutex<HashMap<String, ChannelCounters>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a recording-session event for `channel_id`.
    pub fn record_event(&self, channel_id: &str, event: &CallbackEvent) {
        let mut guard = self.channels.lock().unwrap();
        let entry = guard.entry(channel_id.to_string()).or_default();
        entry.active_event = Some(event_kind(event));
        if let CallbackEvent::FragmentProgress { downloaded_bytes, fragment_count } = event {
            entry.fragments_downloaded = *fragment_count;
            entry.bytes_downloaded = *downloaded_bytes;
        }
    }

    /// Record that a channel's recording session ended in error.
    pub fn record_error(&self, channel_id: &str) {
        let mut guard = self.channels.lock().unwrap();
        guard.entry(channel_id.to_string()).or_default().active_event = Some("ERROR");
    }

    /// Drop a channel's series entirely (channel removed from config).
    pub fn remove_channel(&self, channel_id: &str) {
        self.channels.lock().unwrap().remove(channel_id);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.channels.lock().unwrap();
        let mut channels: Vec<ChannelSnapshot> = guard
            .iter()
            .map(|(channel_id, counters)| ChannelSnapshot {
                channel_id: channel_id.clone(),
                active_event: counters.active_event,
                fragments_downloaded: counters.fragments_downloaded,
                bytes_downloaded: counters.bytes_downloaded,
            })
            .collect();
        channels.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        MetricsSnapshot { channels }
    }
}

/// Renders a [`MetricsSnapshot`] as Prometheus text exposition, every series
/// prefixed `autofc2_`.
pub struct PrometheusExporter;

impl PrometheusExporter {
    pub fn export(snapshot: &MetricsSnapshot) -> String {
        let mut out = String::new();

        out.push_str("# HELP autofc2_event one-hot gauge over the recording session event enum\n");
        out.push_str("# TYPE autofc2_event gauge\n");
        for channel in &snapshot.channels {
            for kind in EVENT_KINDS {
                let value = if channel.active_event == Some(*kind) { 1 } else { 0 };
                out.push_str(&format!(
                    "autofc2_event{{channel_id=\"{}\",type=\"{}\"}} {value}\n",
                    channel.channel_id, kind
                ));
            }
        }

        out.push_str("# HELP autofc2_fragments_downloaded fragments written to the current recording\n");
        out.push_str("# TYPE autofc2_fragments_downloaded gauge\n");
        for channel in &snapshot.channels {
            out.push_str(&format!(
                "autofc2_fragments_downloaded{{channel_id=\"{}\"}} {}\n",
                channel.channel_id, channel.fragments_downloaded
            ));
        }

        out.push_str("# HELP autofc2_bytes_downloaded bytes written to the current recording\n");
        out.push_str("# TYPE autofc2_bytes_downloaded gauge\n");
        for channel in &snapshot.channels {
            out.push_str(&format!(
                "autofc2_bytes_downloaded{{channel_id=\"{}\"}} {}\n",
                channel.channel_id, channel.bytes_downloaded
            ));
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_hot_event_tracks_latest() {
        let collector = MetricsCollector::new();
        collector.record_event("123", &CallbackEvent::WaitingForOnline);
        collector.record_event("123", &CallbackEvent::StreamOnline);
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.channels[0].active_event, Some("STREAM_ONLINE"));
    }

    #[test]
    fn fragment_progress_updates_counters() {
        let collector = MetricsCollector::new();
        collector.record_event(
            "123",
            &CallbackEvent::FragmentProgress { downloaded_bytes: 2048, fragment_count: 4 },
        );
        let snapshot = collector.snapshot();
        assert_eq!(snapshot.channels[0].fragments_downloaded, 4);
        assert_eq!(snapshot.channels[0].bytes_downloaded, 2048);
    }

    #[test]
    fn export_contains_one_series_per_event_kind() {
        let collector = MetricsCollector::new();
        collector.record_event("123", &CallbackEvent::Muxing);
        let text = PrometheusExporter::export(&collector.snapshot());
        assert_eq!(text.matches("autofc2_event{").count(), EVENT_KINDS.len());
        assert!(text.contains("type=\"MUXING\"} 1"));
    }
}
