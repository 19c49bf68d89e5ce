//! Playlist variant decomposition, merging, and quality/latency selection.

use serde::Deserialize;
use std::collections::HashMap;

/// Quality codes, tens digit of `mode`.
pub const QUALITY_CODES: &[(&str, u32)] = &[
    ("150Kbps", 10),
    ("400Kbps", 20),
    ("1.2Mbps", 30),
    ("2Mbps", 40),
    ("3Mbps", 50),
    ("sound", 90),
];

/// Latency codes, ones digit of `mode`.
pub const LATENCY_CODES: &[(&str, u32)] = &[("low", 0), ("high", 1), ("mid", 2)];

/// One entry in a playlist response: a `mode` integer and its media URL.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PlaylistVariant {
    pub mode: u32,
    pub url: String,
}

/// The raw shape of `get_hls_information`'s response payload: three sibling
/// arrays of variants that must be merged before sorting or selection.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct PlaylistsResponse {
    #[serde(default)]
    pub playlists: Vec<PlaylistVariant>,
    #[serde(default)]
    pub playlists_high_latency: Vec<PlaylistVariant>,
    #[serde(default)]
    pub playlists_middle_latency: Vec<PlaylistVariant>,
}

impl PlaylistsResponse {
    /// `true` once at least one sibling array carries a variant.
    pub fn has_playlists(&self) -> bool {
        !self.playlists.is_empty()
            || !self.playlists_high_latency.is_empty()
            || !self.playlists_middle_latency.is_empty()
    }

    /// Merge the three sibling arrays and sort by [`sort_key`], descending.
    pub fn merged_sorted(&self) -> Vec<PlaylistVariant> {
        let mut all = Vec::with_capacity(
            self.playlists.len()
                + self.playlists_high_latency.len()
                + self.playlists_middle_latency.len(),
        );
        all.extend(self.playlists.iter().cloned());
        all.extend(self.playlists_high_latency.iter().cloned());
        all.extend(self.playlists_middle_latency.iter().cloned());
        all.sort_by_key(|v| std::cmp::Reverse(sort_key(v.mode)));
        all
    }
}

/// Sort key for a `mode`: `mode - 90` when `mode >= 90` (sound sorts lowest
/// among video-capable modes while remaining the sole audio option),
/// otherwise `mode` itself. Descending over this key is the canonical
/// playlist ranking.
pub fn sort_key(mode: u32) -> i64 {
    if mode >= 90 {
        mode as i64 - 90
    } else {
        mode as i64
    }
}

/// Decompose `mode` into its quality and latency labels. Returns `None` if
/// either component is not a recognised code.
pub fn decompose_mode(mode: u32) -> Option<(&'static str, &'static str)> {
    let quality_code = (mode / 10) * 10;
    let latency_code = mode % 10;
    let quality = QUALITY_CODES
        .iter()
        .find(|(_, code)| *code == quality_code)
        .map(|(name, _)| *name)?;
    let latency = LATENCY_CODES
        .iter()
        .find(|(_, code)| *code == latency_code)
        .map(|(name, _)| *name)?;
    Some((quality, latency))
}

/// Recompose a `(quality, latency)` label pair into a `mode` integer.
pub fn compose_mode(quality: &str, latency: &str) -> Option<u32> {
    let quality_map: HashMap<&str, u32> = QUALITY_CODES.iter().copied().collect();
    let latency_map: HashMap<&str, u32> = LATENCY_CODES.iter().copied().collect();
    Some(quality_map.get(quality)? + latency_map.get(latency)?)
}

/// Select the best variant from `merged_sorted()` output given a requested
/// `mode`, following the canonical precedence: exact mode match, then best
/// match on the latency component alone, then the first element of the
/// sorted list.
pub fn select_variant(variants: &[PlaylistVariant], requested_mode: u32) -> Option<&PlaylistVariant> {
    if variants.is_empty() {
        return None;
    }
    if let Some(exact) = variants.iter().find(|v| v.mode == requested_mode) {
        return Some(exact);
    }
    let requested_latency = requested_mode % 10;
    if let Some(by_latency) = variants.iter().find(|v| v.mode % 10 == requested_latency) {
        return Some(by_latency);
    }
    variants.first()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_decomposition() {
        assert_eq!(decompose_mode(52), Some(("3Mbps", "mid")));
        assert_eq!(decompose_mode(90), Some(("sound", "low")));
    }

    #[test]
    fn mode_roundtrip() {
        assert_eq!(compose_mode("3Mbps", "mid"), Some(52));
        assert_eq!(compose_mode("sound", "low"), Some(90));
    }

    #[test]
    fn playlist_ranking() {
        let variants = vec![
            PlaylistVariant { mode: 10, url: "a".into() },
            PlaylistVariant { mode: 52, url: "b".into() },
            PlaylistVariant { mode: 90, url: "c".into() },
            PlaylistVariant { mode: 30, url: "d".into() },
        ];
        let resp = PlaylistsResponse {
            playlists: variants,
            ..Default::default()
        };
        let sorted: Vec<u32> = resp.merged_sorted().into_iter().map(|v| v.mode).collect();
        assert_eq!(sorted, vec![52, 30, 10, 90]);
    }

    #[test]
    fn selection_exact_match() {
        let variants = vec![
            PlaylistVariant { mode: 52, url: "a".into() },
            PlaylistVariant { mode: 30, url: "b".into() },
        ];
        let chosen = select_variant(&variants, 52).unwrap();
        assert_eq!(chosen.mode, 52);
    }

    #[test]
    fn selection_latency_fallback() {
        let variants = vec![
            PlaylistVariant { mode: 31, url: "a".into() },
            PlaylistVariant { mode: 90, url: "b".into() },
        ];
        // requested 51 (3Mbps/high) absent, but latency 1 (high) present at mode 31
        let chosen = select_variant(&variants, 51).unwrap();
        assert_eq!(chosen.mode, 31);
    }

    #[test]
    fn selection_first_of_sorted_fallback() {
        let variants = vec![
            PlaylistVariant { mode: 30, url: "a".into() },
            PlaylistVariant { mode: 90, url: "b".into() },
        ];
        // requested mode 22 matches neither exactly nor by latency (2==mid)
        let chosen = select_variant(&variants, 22).unwrap();
        assert_eq!(chosen.mode, 30);
    }
}
