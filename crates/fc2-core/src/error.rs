use thiserror::Error;

/// Transport-level failures shared by the metadata client and the downloader.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("non-json response body")]
    NonJsonBody(#[source] serde_json::Error),
}

/// Failures from the live-stream metadata client (component B).
#[derive(Debug, Error)]
pub enum MetaError {
    #[error("channel is not broadcasting")]
    NotOnline,
    #[error("failed to fetch stream metadata: {0}")]
    MetaFetch(#[from] TransportError),
}

/// Failures from the control-channel session (component C).
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("disconnected: paid program required (4101)")]
    PaidProgram,
    #[error("disconnected: login required (4507)")]
    LoginRequired,
    #[error("disconnected: multiple connections (4512)")]
    MultipleConnection,
    #[error("server disconnection (code {code})")]
    ServerDisconnection { code: u32 },
    #[error("stream ended")]
    StreamEnded,
    #[error("playlist remained empty after retrying get_hls_information")]
    EmptyPlaylist,
    #[error("websocket transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("no frame received within the heartbeat interval")]
    ReceiveTimeout,
    #[error("control session closed")]
    Closed,
}

impl ControlError {
    /// Map a `control_disconnection` event's numeric code onto the tagged variants.
    pub fn from_disconnection_code(code: u32) -> Self {
        match code {
            4101 => ControlError::PaidProgram,
            4507 => ControlError::LoginRequired,
            4512 => ControlError::MultipleConnection,
            other => ControlError::ServerDisconnection { code: other },
        }
    }
}

/// Failures from the HLS segmented downloader (component D).
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("stream ended (playlist fetch returned 403)")]
    StreamEnded,
    #[error("http error: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Failures surfaced by a whole recording session (component E).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Meta(#[from] MetaError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("remux tool unavailable: {0}")]
    ToolUnavailable(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    /// Whether this error represents a clean end-of-stream rather than a fault.
    pub fn is_clean_end(&self) -> bool {
        matches!(
            self,
            SessionError::Control(ControlError::StreamEnded)
                | SessionError::Download(DownloadError::StreamEnded)
        )
    }
}
