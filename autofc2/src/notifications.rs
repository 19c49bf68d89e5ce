//! Notification dispatch on `GOT_HLS_URL`: template substitution (unsanitized,
//! unlike the file-naming templates in [`fc2_core::filename`]) followed by a
//! best-effort POST per configured hook.

use fc2_core::metadata::StreamMeta;
use fc2_core::filename::{expand_template, TemplateTokens};

use crate::config::NotificationConfig;

/// Substitute `%(channel_id)s`, `%(channel_name)s`, `%(date)s`, `%(time)s`,
/// `%(title)s`, `%(ext)s` into `template` without sanitizing the result
/// (notification text is not a filesystem path).
pub fn expand_notification_template(template: &str, channel_id: &str, meta: &StreamMeta) -> String {
    let tokens = TemplateTokens {
        channel_id,
        channel_name: meta.channel_name(),
        title: meta.title(),
        ext: "",
    };
    expand_template(template, &tokens)
}

/// Fire every configured notification for a channel that just resolved its
/// HLS media URL. Failures are logged, never propagated — a misbehaving or
/// unreachable notification endpoint must not disturb recording.
pub async fn dispatch(
    client: &reqwest::Client,
    notifications: &[NotificationConfig],
    channel_id: &str,
    meta: &StreamMeta,
) {
    for notification in notifications {
        let message = expand_notification_template(&notification.message, channel_id, meta);
        let url = expand_notification_template(&notification.url, channel_id, meta);
        match client.post(&url).json(&serde_json::json!({ "message": message })).send().await {
            Ok(resp) if !resp.status().is_success() => {
                tracing::warn!(channel_id, %url, status = %resp.status(), "notification endpoint rejected payload");
            }
            Err(e) => {
                tracing::warn!(channel_id, %url, error = %e, "failed to dispatch notification");
            }
            Ok(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_meta() -> StreamMeta {
        serde_json::from_value(json!({
            "channel_data": { "channelid": "123", "title": "My Title", "version": "v1", "is_publish": 1, "image": "" },
            "profile_data": { "name": "streamer" }
        }))
        .unwrap()
    }

    #[test]
    fn expands_without_sanitizing() {
        let meta = sample_meta();
        let out = expand_notification_template("%(channel_name)s went live: %(title)s", "123", &meta);
        assert_eq!(out, "streamer went live: My Title");
    }
}
