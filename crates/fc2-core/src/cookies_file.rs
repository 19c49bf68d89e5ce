//! Netscape-format cookies file loading into a [`reqwest::cookie::Jar`].

use std::path::Path;
use std::sync::Arc;

use reqwest::cookie::Jar;
use reqwest::Url;

/// Parse a Netscape-format cookies file and load every entry into `jar`.
///
/// Format: tab-separated `domain flag path secure expiration name value`.
/// A domain beginning with `#HttpOnly_` has that prefix stripped and the
/// cookie is marked `HttpOnly`. Blank lines and other `#`-prefixed comment
/// lines are skipped.
pub fn load_into_jar(path: &Path, jar: &Arc<Jar>) -> std::io::Result<usize> {
    let contents = std::fs::read_to_string(path)?;
    let mut loaded = 0;
    for line in contents.lines() {
        if let Some(cookie) = parse_line(line) {
            let url: Url = format!("https://{}", cookie.domain.trim_start_matches('.'))
                .parse()
                .unwrap_or_else(|_| "https://live.fc2.com".parse().unwrap());
            jar.add_cookie_str(&cookie.to_set_cookie_header(), &url);
            loaded += 1;
        }
    }
    Ok(loaded)
}

struct ParsedCookie {
    domain: String,
    path: String,
    secure: bool,
    http_only: bool,
    name: String,
    value: String,
}

impl ParsedCookie {
    fn to_set_cookie_header(&self) -> String {
        let mut header = format!("{}={}; Domain={}; Path={}", self.name, self.value, self.domain, self.path);
        if self.secure {
            header.push_str("; Secure");
        }
        if self.http_only {
            header.push_str("; HttpOnly");
        }
        header
    }
}

fn parse_line(line: &str) -> Option<ParsedCookie> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.starts_with('#') && !trimmed.starts_with("#HttpOnly_") {
        return None;
    }

    let fields: Vec<&str> = trimmed.split('\t').collect();
    if fields.len() != 7 {
        return None;
    }

    let (domain, http_only) = match fields[0].strip_prefix("#HttpOnly_") {
        Some(rest) => (rest.to_string(), true),
        None => (fields[0].to_string(), false),
    };
    let path = fields[2].to_string();
    let secure = fields[3].eq_ignore_ascii_case("TRUE");
    let name = fields[5].to_string();
    let value = fields[6].to_string();

    Some(ParsedCookie {
        domain,
        path,
        secure,
        http_only,
        name,
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_line() {
        let line = "live.fc2.com\tFALSE\t/\tTRUE\t1999999999\tl_ortkn\tabc123";
        let cookie = parse_line(line).unwrap();
        assert_eq!(cookie.domain, "live.fc2.com");
        assert_eq!(cookie.name, "l_ortkn");
        assert_eq!(cookie.value, "abc123");
        assert!(cookie.secure);
        assert!(!cookie.http_only);
    }

    #[test]
    fn strips_httponly_prefix() {
        let line = "#HttpOnly_.fc2.com\tTRUE\t/\tFALSE\t0\tsession\txyz";
        let cookie = parse_line(line).unwrap();
        assert_eq!(cookie.domain, ".fc2.com");
        assert!(cookie.http_only);
    }

    #[test]
    fn skips_comments_and_blanks() {
        assert!(parse_line("# this is a comment").is_none());
        assert!(parse_line("").is_none());
        assert!(parse_line("   ").is_none());
    }

    #[test]
    fn loads_file_into_jar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.txt");
        std::fs::write(
            &path,
            "live.fc2.com\tFALSE\t/\tTRUE\t1999999999\tl_ortkn\tabc123\n",
        )
        .unwrap();
        let jar = Arc::new(Jar::default());
        let loaded = load_into_jar(&path, &jar).unwrap();
        assert_eq!(loaded, 1);
    }
}
