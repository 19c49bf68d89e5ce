//! Output filename templating, sanitization, and collision avoidance.

use std::path::{Path, PathBuf};

use chrono::Local;
use regex::Regex;
use std::sync::LazyLock;

const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

static ILLEGAL_CHARS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#"[\\/:*?"<>|]"#).unwrap());

/// Tokens available for `-o/--output` template expansion.
pub struct TemplateTokens<'a> {
    pub channel_id: &'a str,
    pub channel_name: &'a str,
    pub title: &'a str,
    pub ext: &'a str,
}

/// Expand a template string like `"%(date)s %(title)s (%(channel_name)s).%(ext)s"`
/// using the current local date/time and the supplied tokens, then sanitize
/// the result as a filename (not a full path — separators in the template
/// are preserved, only the filename component is sanitized below).
pub fn expand_template(template: &str, tokens: &TemplateTokens<'_>) -> String {
    let now = Local::now();
    template
        .replace("%(channel_id)s", tokens.channel_id)
        .replace("%(channel_name)s", tokens.channel_name)
        .replace("%(date)s", &now.format("%Y-%m-%d").to_string())
        .replace("%(time)s", &now.format("%H%M%S").to_string())
        .replace("%(title)s", tokens.title)
        .replace("%(ext)s", tokens.ext)
}

/// Sanitize a filename stem: replace `\ / : * ? " < > |` with `_`, strip
/// ASCII control characters, trim leading/trailing whitespace and dots,
/// prefix `_` to reserved Windows device names and to names beginning with
/// `-`.
pub fn sanitize_filename(name: &str) -> String {
    let replaced = ILLEGAL_CHARS.replace_all(name, "_");
    let stripped: String = replaced.chars().filter(|c| !c.is_ascii_control()).collect();
    let trimmed = stripped.trim().trim_matches('.');

    let mut result = trimmed.to_string();
    if result.starts_with('-') {
        result = format!("_{result}");
    }

    let stem = result.split('.').next().unwrap_or(&result).to_uppercase();
    if RESERVED_NAMES.contains(&stem.as_str()) {
        result = format!("_{result}");
    }

    result
}

/// Resolve `desired` to a non-existing path by appending `.1`, `.2`, … before
/// the extension on collision. Creates parent directories if needed.
pub fn resolve_unique_path(desired: &Path) -> std::io::Result<PathBuf> {
    if let Some(parent) = desired.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    if !desired.exists() {
        return Ok(desired.to_path_buf());
    }

    let stem = desired
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = desired.extension().map(|e| e.to_string_lossy().to_string());
    let parent = desired.parent().map(PathBuf::from).unwrap_or_default();

    let mut n = 1u32;
    loop {
        let candidate_name = match &ext {
            Some(ext) => format!("{stem}.{n}.{ext}"),
            None => format!("{stem}.{n}"),
        };
        let candidate = parent.join(candidate_name);
        if !candidate.exists() {
            return Ok(candidate);
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_illegal_characters() {
        let out = sanitize_filename("hello/world: <test>");
        assert!(!out.contains('/'));
        assert!(!out.contains(':'));
        assert!(!out.contains('<'));
        assert!(!out.contains('>'));
    }

    #[test]
    fn strips_control_chars_and_trims() {
        let out = sanitize_filename("  foo\u{0007}bar.  ");
        assert_eq!(out, "foobar");
    }

    #[test]
    fn prefixes_reserved_device_names() {
        assert_eq!(sanitize_filename("CON"), "_CON");
        assert_eq!(sanitize_filename("con.ts"), "_con.ts");
        assert_eq!(sanitize_filename("CONSOLE"), "CONSOLE");
    }

    #[test]
    fn prefixes_leading_dash() {
        assert_eq!(sanitize_filename("-rf"), "_-rf");
    }

    #[test]
    fn collision_appends_counter() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foo.ts");
        std::fs::write(&path, b"x").unwrap();
        let resolved = resolve_unique_path(&path).unwrap();
        assert_eq!(resolved, dir.path().join("foo.1.ts"));
    }

    #[test]
    fn no_collision_returns_same_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("foo.ts");
        let resolved = resolve_unique_path(&path).unwrap();
        assert_eq!(resolved, path);
    }

    #[test]
    fn template_expansion() {
        let tokens = TemplateTokens {
            channel_id: "123",
            channel_name: "chan",
            title: "My Title",
            ext: "ts",
        };
        let out = expand_template("%(title)s (%(channel_name)s).%(ext)s", &tokens);
        assert_eq!(out, "My Title (chan).ts");
    }
}
