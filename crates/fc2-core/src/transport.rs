//! Shared HTTP client construction: TLS setup, cookie jar, proxy forwarding.

use std::sync::Arc;

use reqwest::cookie::Jar;
use reqwest::{Client, Url};
use rustls::crypto::aws_lc_rs;
use rustls::ClientConfig;
use rustls_platform_verifier::BuilderVerifierExt;

use crate::error::TransportError;

pub(crate) const DEFAULT_UA: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/126.0.0.0 Safari/537.36";

pub(crate) const FC2_ORIGIN: &str = "https://live.fc2.com";

/// Shared HTTP client plus the cookie jar backing it.
///
/// One instance is built per process (per single-channel run, or once for
/// the whole supervisor) and cloned cheaply into every metadata/control/
/// downloader component, since `reqwest::Client` is an `Arc`-backed handle.
#[derive(Clone)]
pub struct Transport {
    client: Client,
    jar: Arc<Jar>,
}

impl Transport {
    /// Build a transport with a fresh, empty cookie jar.
    pub fn new() -> Result<Self, TransportError> {
        Self::with_jar(Arc::new(Jar::default()))
    }

    /// Build a transport sharing an existing cookie jar (e.g. one pre-loaded
    /// from a Netscape cookies file via [`crate::cookies_file`]).
    pub fn with_jar(jar: Arc<Jar>) -> Result<Self, TransportError> {
        let provider = Arc::new(aws_lc_rs::default_provider());
        let tls_config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .expect("default TLS protocol versions are always valid")
            .with_platform_verifier()
            .expect("platform verifier is always constructible")
            .with_no_client_auth();

        let client = Client::builder()
            .use_preconfigured_tls(tls_config)
            .cookie_provider(jar.clone())
            .user_agent(DEFAULT_UA)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(TransportError::Http)?;

        Ok(Self { client, jar })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn jar(&self) -> &Arc<Jar> {
        &self.jar
    }

    /// Extract the `l_ortkn` cookie value for the FC2 origin, or an empty
    /// string if it has not been set (matching the source tool's `orz`
    /// fallback).
    pub fn l_ortkn(&self) -> String {
        let url: Url = FC2_ORIGIN.parse().expect("static URL is valid");
        let Some(header) = self.jar.cookies(&url) else {
            return String::new();
        };
        let header = header.to_str().unwrap_or_default();
        for pair in header.split(';') {
            let pair = pair.trim();
            if let Some(value) = pair.strip_prefix("l_ortkn=") {
                return value.to_string();
            }
        }
        String::new()
    }

    /// The full `Cookie:` header string currently held for the FC2 origin,
    /// used to carry the HTTP session over into the WebSocket upgrade
    /// request.
    pub fn cookie_header(&self) -> Option<String> {
        let url: Url = FC2_ORIGIN.parse().expect("static URL is valid");
        self.jar
            .cookies(&url)
            .map(|v| v.to_str().unwrap_or_default().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l_ortkn_defaults_to_empty() {
        let transport = Transport::new().unwrap();
        assert_eq!(transport.l_ortkn(), "");
    }

    #[test]
    fn l_ortkn_extracted_from_jar() {
        let jar = Arc::new(Jar::default());
        let url: Url = FC2_ORIGIN.parse().unwrap();
        jar.add_cookie_str("l_ortkn=abc123; Path=/; Domain=live.fc2.com", &url);
        let transport = Transport::with_jar(jar).unwrap();
        assert_eq!(transport.l_ortkn(), "abc123");
    }
}
