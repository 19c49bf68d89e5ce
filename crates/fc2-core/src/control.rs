//! Control-channel session (component C): framed request/response plus
//! server-initiated events over a WebSocket, with heartbeating.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::ControlError;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const COMMENTS_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Serialize)]
struct OutboundFrame<'a> {
    name: &'a str,
    arguments: Value,
    id: u64,
}

/// A single comment event delivered from the `comment` frame's `arguments.comments` array.
pub type Comment = Value;

/// Scoped resource wrapping one WebSocket control connection.
///
/// `ControlSession::connect` opens the socket and spawns the reader task;
/// dropping the session without calling [`ControlSession::shutdown`] still
/// guarantees the socket and reader task are released, via the `Drop` impl
/// below.
pub struct ControlSession {
    sink: mpsc::UnboundedSender<Message>,
    next_id: AtomicU64,
    response_map: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    termination: watch::Receiver<Option<Arc<ControlError>>>,
    comments_rx: Mutex<Option<mpsc::Receiver<Comment>>>,
    cancel: CancellationToken,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ControlSession {
    /// Open the WebSocket and start the reader task.
    pub async fn connect(ws_url: &str, cookie_header: Option<String>) -> Result<Self, ControlError> {
        let mut request = ws_url.into_client_request()?;
        if let Some(cookie) = cookie_header {
            use tokio_tungstenite::tungstenite::http::header::COOKIE;
            request
                .headers_mut()
                .insert(COOKIE, cookie.parse().map_err(|_| ControlError::Closed)?);
        }

        let (ws_stream, _) = tokio_tungstenite::connect_async(request).await?;
        let (mut ws_sink, mut ws_stream_rx) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (comments_tx, comments_rx) = mpsc::channel(COMMENTS_QUEUE_CAPACITY);
        let (term_tx, term_rx) = watch::channel(None);
        let response_map: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let cancel = CancellationToken::new();
        let reader_cancel = cancel.clone();
        let reader_response_map = response_map.clone();
        let out_tx_for_heartbeat = out_tx.clone();

        let reader_handle = tokio::spawn(async move {
            let mut last_heartbeat = Instant::now();
            let terminal_error = loop {
                tokio::select! {
                    biased;
                    _ = reader_cancel.cancelled() => {
                        break None;
                    }
                    Some(msg) = out_rx.recv() => {
                        if ws_sink.send(msg).await.is_err() {
                            break Some(ControlError::Closed);
                        }
                        continue;
                    }
                    frame = tokio::time::timeout(HEARTBEAT_INTERVAL, ws_stream_rx.next()) => {
                        match frame {
                            Err(_elapsed) => break Some(ControlError::ReceiveTimeout),
                            Ok(None) => break Some(ControlError::Closed),
                            Ok(Some(Err(e))) => break Some(ControlError::from(e)),
                            Ok(Some(Ok(message))) => {
                                if let Some(err) = handle_frame(
                                    message,
                                    &reader_response_map,
                                    &comments_tx,
                                ) {
                                    break Some(err);
                                }

                                if last_heartbeat.elapsed() >= HEARTBEAT_INTERVAL {
                                    let frame = OutboundFrame {
                                        name: "heartbeat",
                                        arguments: Value::Object(Default::default()),
                                        id: 0,
                                    };
                                    if let Ok(text) = serde_json::to_string(&frame) {
                                        let _ = out_tx_for_heartbeat.send(Message::Text(text.into()));
                                    }
                                    last_heartbeat = Instant::now();
                                }
                            }
                        }
                    }
                }
            };

            if let Some(err) = terminal_error {
                debug!(%err, "control session reader terminated");
                let _ = term_tx.send(Some(Arc::new(err)));
            }
        });

        Ok(Self {
            sink: out_tx,
            next_id: AtomicU64::new(1),
            response_map,
            termination: term_rx,
            comments_rx: Mutex::new(Some(comments_rx)),
            cancel,
            reader_handle: Mutex::new(Some(reader_handle)),
        })
    }

    /// Take the bounded comments receiver; can only be taken once.
    pub fn take_comments(&self) -> Option<mpsc::Receiver<Comment>> {
        self.comments_rx.lock().unwrap().take()
    }

    /// Resolve with the reader's terminal error (or [`ControlError::Closed`]
    /// if the session was shut down without a recorded error). Used by the
    /// session orchestrator as one of its concurrent completion conditions.
    pub async fn wait_disconnection(&self) -> ControlError {
        let mut rx = self.termination.clone();
        loop {
            if let Some(err) = rx.borrow().as_ref() {
                return clone_control_error(err);
            }
            if rx.changed().await.is_err() {
                return ControlError::Closed;
            }
        }
    }

    /// Assign the next id, send a request frame, and wait for whichever of:
    /// a matching response, reader termination, or an optional per-call
    /// timeout fires first.
    pub async fn send_and_wait(
        &self,
        name: &str,
        arguments: Value,
        timeout: Option<Duration>,
    ) -> Result<Option<Value>, ControlError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (resp_tx, resp_rx) = oneshot::channel();
        self.response_map.lock().unwrap().insert(id, resp_tx);

        let frame = OutboundFrame { name, arguments, id };
        let text = serde_json::to_string(&frame).map_err(|_| ControlError::Closed)?;
        self.sink
            .send(Message::Text(text.into()))
            .map_err(|_| ControlError::Closed)?;

        let mut termination = self.termination.clone();
        let sleep = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            resp = resp_rx => {
                self.response_map.lock().unwrap().remove(&id);
                resp.map(Some).map_err(|_| ControlError::Closed)
            }
            _ = termination.changed() => {
                self.response_map.lock().unwrap().remove(&id);
                let err = termination.borrow().as_ref().map(|e| clone_control_error(e));
                Err(err.unwrap_or(ControlError::Closed))
            }
            _ = sleep => {
                self.response_map.lock().unwrap().remove(&id);
                Ok(None)
            }
        }
    }

    /// Query `get_hls_information`, retrying up to 5 times with exponential
    /// backoff `2^attempt` seconds, also retrying when the response lacks a
    /// `playlists`-family key.
    pub async fn get_hls_information(&self) -> Result<crate::playlist::PlaylistsResponse, ControlError> {
        for attempt in 0..5u32 {
            let result = self
                .send_and_wait("get_hls_information", Value::Object(Default::default()), Some(Duration::from_secs(5)))
                .await;

            match result {
                Ok(Some(value)) => {
                    let arguments = value.get("arguments").cloned().unwrap_or(Value::Null);
                    if let Ok(parsed) =
                        serde_json::from_value::<crate::playlist::PlaylistsResponse>(arguments)
                    {
                        if parsed.has_playlists() {
                            return Ok(parsed);
                        }
                    }
                    trace!(?value, attempt, "get_hls_information missing playlists, retrying");
                }
                Ok(None) => {
                    trace!(attempt, "get_hls_information timed out, retrying");
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(Duration::from_secs(2u64.pow(attempt))).await;
        }
        Err(ControlError::EmptyPlaylist)
    }

    /// Cancel the reader and await its exit. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.reader_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for ControlSession {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.reader_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

fn clone_control_error(err: &ControlError) -> ControlError {
    match err {
        ControlError::PaidProgram => ControlError::PaidProgram,
        ControlError::LoginRequired => ControlError::LoginRequired,
        ControlError::MultipleConnection => ControlError::MultipleConnection,
        ControlError::ServerDisconnection { code } => ControlError::ServerDisconnection { code: *code },
        ControlError::StreamEnded => ControlError::StreamEnded,
        ControlError::EmptyPlaylist => ControlError::EmptyPlaylist,
        ControlError::ReceiveTimeout => ControlError::ReceiveTimeout,
        ControlError::Closed => ControlError::Closed,
        ControlError::Transport(_) => ControlError::Closed,
    }
}

/// Dispatch one inbound frame. Returns `Some(err)` if the frame is terminal
/// for the reader (a disconnection or stream-end event); `None` otherwise.
fn handle_frame(
    message: Message,
    response_map: &Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>,
    comments_tx: &mpsc::Sender<Comment>,
) -> Option<ControlError> {
    let text = match message {
        Message::Text(t) => t,
        Message::Close(_) => return Some(ControlError::Closed),
        _ => return None,
    };

    let frame: Value = match serde_json::from_str(&text) {
        Ok(v) => v,
        Err(_) => return None,
    };

    let name = frame.get("name").and_then(Value::as_str).unwrap_or_default();

    match name {
        "connect_complete" => {
            trace!("control session ready");
            None
        }
        "_response_" => {
            if let Some(id) = frame.get("id").and_then(Value::as_u64) {
                if let Some(sender) = response_map.lock().unwrap().remove(&id) {
                    let _ = sender.send(frame);
                }
            }
            None
        }
        "control_disconnection" => {
            let code = frame
                .get("arguments")
                .and_then(|a| a.get("code"))
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32;
            Some(ControlError::from_disconnection_code(code))
        }
        "publish_stop" => Some(ControlError::StreamEnded),
        "comment" => {
            if let Some(comments) = frame
                .get("arguments")
                .and_then(|a| a.get("comments"))
                .and_then(Value::as_array)
            {
                for comment in comments {
                    let _ = comments_tx.try_send(comment.clone());
                }
            }
            None
        }
        _ => {
            warn!(name, "ignoring unknown control frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnection_code_mapping() {
        assert!(matches!(
            ControlError::from_disconnection_code(4101),
            ControlError::PaidProgram
        ));
        assert!(matches!(
            ControlError::from_disconnection_code(4507),
            ControlError::LoginRequired
        ));
        assert!(matches!(
            ControlError::from_disconnection_code(4512),
            ControlError::MultipleConnection
        ));
        assert!(matches!(
            ControlError::from_disconnection_code(9999),
            ControlError::ServerDisconnection { code: 9999 }
        ));
    }

    #[test]
    fn response_frame_delivers_to_waiter() {
        let response_map: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        response_map.lock().unwrap().insert(1, tx);
        let (comments_tx, _comments_rx) = mpsc::channel(4);

        let frame = serde_json::json!({ "name": "_response_", "id": 1, "playlists": [] });
        let msg = Message::Text(serde_json::to_string(&frame).unwrap().into());
        let result = handle_frame(msg, &response_map, &comments_tx);
        assert!(result.is_none());
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn publish_stop_is_terminal() {
        let response_map: Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (comments_tx, _rx) = mpsc::channel(4);
        let frame = serde_json::json!({ "name": "publish_stop" });
        let msg = Message::Text(serde_json::to_string(&frame).unwrap().into());
        let result = handle_frame(msg, &response_map, &comments_tx);
        assert!(matches!(result, Some(ControlError::StreamEnded)));
    }

    /// Real integration test - opens a control session against an actual
    /// live channel's control server and waits for a `get_hls_information`
    /// response.
    /// Run with: cargo test --package fc2-core control::tests::test_real_control_session -- --ignored --nocapture
    #[tokio::test]
    #[ignore] // Requires network access and a live channel's websocket URL
    async fn test_real_control_session() {
        let ws_url = std::env::var("FC2_TEST_WS_URL").expect("set FC2_TEST_WS_URL");
        let session = ControlSession::connect(&ws_url, None).await.unwrap();
        let playlists = session.get_hls_information().await.unwrap();
        println!("has_playlists={}", playlists.has_playlists());
        session.shutdown().await;
    }
}
