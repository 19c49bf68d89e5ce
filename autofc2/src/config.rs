//! Declarative supervisor configuration: `autofc2.json`'s shape, per-channel
//! parameter resolution (deep-copy `default_params` + shallow-merge the
//! channel override), and the reload-tolerant loader.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use fc2_core::SessionParams;
use serde::Deserialize;
use serde_json::Value;

/// Top-level shape of `autofc2.json`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SupervisorConfig {
    pub autofc2: AutoFc2Settings,
    pub default_params: Value,
    pub channels: HashMap<String, Value>,
    pub notifications: Vec<NotificationConfig>,
}

/// `autofc2.{log_level,debounce_time,metrics}`.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AutoFc2Settings {
    pub log_level: Option<String>,
    pub debounce_time: Option<f64>,
    pub metrics: Option<MetricsConfig>,
}

impl AutoFc2Settings {
    /// Debounce interval, defaulting to 30s absent an explicit value.
    pub fn debounce(&self) -> Duration {
        Duration::from_secs_f64(self.debounce_time.unwrap_or(30.0).max(0.0))
    }
}

/// `autofc2.metrics` — absent entirely means the metrics server task stalls
/// indefinitely (see [`crate::server`]).
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
}

/// One entry of the `notifications` array.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationConfig {
    pub url: String,
    pub message: String,
}

/// Per-channel parameter overlay. Every field is optional so a shallow merge
/// over `default_params` only overwrites what a channel explicitly sets;
/// missing fields fall back to [`fc2_core::SessionParams::default`].
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct ChannelParams {
    quality: Option<String>,
    latency: Option<String>,
    threads: Option<usize>,
    output: Option<String>,
    remux: Option<bool>,
    keep_intermediates: Option<bool>,
    extract_audio: Option<bool>,
    write_chat: Option<bool>,
    write_info_json: Option<bool>,
    write_thumbnail: Option<bool>,
    wait: Option<bool>,
    poll_interval: Option<u64>,
    wait_for_quality_timeout: Option<u64>,
    dump_websocket: Option<bool>,
}

/// Deep-copy `default_params`, shallow-merge `override_params` on top (only
/// top-level keys are replaced), and resolve the result into a
/// [`SessionParams`].
pub fn resolve_channel_params(default_params: &Value, override_params: &Value) -> SessionParams {
    let mut merged = default_params.clone();
    shallow_merge(&mut merged, override_params);

    let parsed: ChannelParams = serde_json::from_value(merged).unwrap_or_default();
    let defaults = SessionParams::default();

    let params = SessionParams {
        quality: parsed.quality.unwrap_or(defaults.quality),
        latency: parsed.latency.unwrap_or(defaults.latency),
        threads: parsed.threads.unwrap_or(defaults.threads),
        output_template: parsed.output.unwrap_or(defaults.output_template),
        remux: parsed.remux.unwrap_or(defaults.remux),
        keep_intermediates: parsed.keep_intermediates.unwrap_or(defaults.keep_intermediates),
        extract_audio: parsed.extract_audio.unwrap_or(defaults.extract_audio),
        write_chat: parsed.write_chat.unwrap_or(defaults.write_chat),
        write_info_json: parsed.write_info_json.unwrap_or(defaults.write_info_json),
        write_thumbnail: parsed.write_thumbnail.unwrap_or(defaults.write_thumbnail),
        wait_for_live: parsed.wait.unwrap_or(defaults.wait_for_live),
        poll_interval: parsed
            .poll_interval
            .map(Duration::from_secs)
            .unwrap_or(defaults.poll_interval),
        wait_for_quality_timeout: parsed
            .wait_for_quality_timeout
            .map(Duration::from_secs)
            .unwrap_or(defaults.wait_for_quality_timeout),
        dump_websocket: parsed.dump_websocket.unwrap_or(defaults.dump_websocket),
    };

    params
}

/// Overwrite `base`'s top-level object keys with `overlay`'s. Non-object
/// inputs are left untouched (an empty/absent override is a no-op).
fn shallow_merge(base: &mut Value, overlay: &Value) {
    let (Some(base_obj), Some(overlay_obj)) = (base.as_object_mut(), overlay.as_object()) else {
        return;
    };
    for (key, value) in overlay_obj {
        base_obj.insert(key.clone(), value.clone());
    }
}

/// Parse `path` as a [`SupervisorConfig`]. Errors are caller-handled: the
/// first load is fatal on failure, subsequent reload ticks keep the last
/// successfully parsed document instead.
pub fn load(path: &Path) -> anyhow::Result<SupervisorConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
    let config: SupervisorConfig = serde_json::from_str(&contents)
        .map_err(|e| anyhow::anyhow!("failed to parse config file {}: {e}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shallow_merge_overwrites_top_level_keys_only() {
        let mut base = serde_json::json!({ "quality": "3Mbps", "threads": 1 });
        let overlay = serde_json::json!({ "threads": 4 });
        shallow_merge(&mut base, &overlay);
        assert_eq!(base["quality"], "3Mbps");
        assert_eq!(base["threads"], 4);
    }

    #[test]
    fn resolve_channel_params_falls_back_to_defaults() {
        let defaults = serde_json::json!({ "quality": "3Mbps" });
        let params = resolve_channel_params(&defaults, &Value::Null);
        assert_eq!(params.quality, "3Mbps");
        assert_eq!(params.threads, SessionParams::default().threads);
    }

    #[test]
    fn resolve_channel_params_applies_channel_override() {
        let defaults = serde_json::json!({ "quality": "3Mbps", "threads": 1 });
        let overlay = serde_json::json!({ "quality": "sound", "write_chat": true });
        let params = resolve_channel_params(&defaults, &overlay);
        assert_eq!(params.quality, "sound");
        assert_eq!(params.threads, 1);
        assert!(params.write_chat);
    }

    #[test]
    fn parses_full_document() {
        let doc = serde_json::json!({
            "autofc2": { "debounce_time": 5.0, "metrics": { "host": "127.0.0.1", "port": 9000, "path": "/metrics" } },
            "default_params": { "quality": "3Mbps" },
            "channels": { "123": {} },
            "notifications": [{ "url": "https://example.com/hook", "message": "live: %(title)s" }],
        });
        let config: SupervisorConfig = serde_json::from_value(doc).unwrap();
        assert_eq!(config.channels.len(), 1);
        assert_eq!(config.autofc2.debounce().as_secs_f64(), 5.0);
        assert_eq!(config.notifications[0].url, "https://example.com/hook");
    }
}
