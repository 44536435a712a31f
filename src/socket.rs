//! Reconnecting duplex WebSocket.
//!
//! Thin connection layer over `tokio-tungstenite`: a spawned task owns the
//! stream and hands byte-level events to its single consumer. Knows nothing
//! about frames, actions, or topics — close-code policy belongs to the
//! transport.
//!
//! # Architecture
//!
//! ```text
//! ReconnectingSocket (handle)
//!     │ commands (send / reconnect / close)
//!     ▼
//! connection task ── connect → open loop → backoff → reconnect …
//!     │ events (open / message / close / error)
//!     ▼
//! transport dispatch loop
//! ```
//!
//! Guarantees:
//! - **Lazy start**: with `start_closed` no attempt is made until
//!   [`ReconnectingSocket::reconnect`] is called.
//! - **Reconnection**: unexpected closes trigger randomised exponential
//!   backoff (200 ms initial, 2 s cap, factor 2).
//! - **No write buffering**: sends fail immediately while the socket is
//!   not open, so stale writes cannot pile up during outages.

use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

use crate::constants::{
    CONNECT_TIMEOUT, SOCKET_BACKOFF_CAP, SOCKET_BACKOFF_FACTOR, SOCKET_BACKOFF_INITIAL,
    SOCKET_BACKOFF_JITTER_MS,
};
use crate::error::SdkError;

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Connection state of the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    /// No connection, none in progress.
    Closed,
    /// A connection attempt is in flight.
    Connecting,
    /// Connected and writable.
    Open,
    /// A local close is in progress.
    Closing,
}

/// Byte-level event delivered to the socket's consumer.
#[derive(Debug)]
pub enum SocketEvent {
    /// The connection (re)opened.
    Open,
    /// A complete inbound message.
    Message(Vec<u8>),
    /// The connection closed. `code` 1005 means no close frame was
    /// received, 1006 a transport-level failure.
    Close {
        /// WebSocket close code.
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
    /// A connection or I/O error. Always followed by `Close` when a
    /// connection was open.
    Error(String),
}

#[derive(Debug)]
enum SocketCmd {
    Send(Vec<u8>),
    /// Ensure a connection attempt is underway; no-op while connecting or open.
    Kick,
    /// Drop any current connection and redial immediately.
    Reconnect,
    /// Close the current connection and park until the next `Kick`/`Reconnect`.
    Close,
}

/// Socket construction options.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// When true, no connection attempt occurs until `reconnect()`.
    pub start_closed: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self { start_closed: true }
    }
}

/// Handle to the connection task.
#[derive(Debug)]
pub struct ReconnectingSocket {
    cmd_tx: mpsc::UnboundedSender<SocketCmd>,
    state_rx: watch::Receiver<ReadyState>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<SocketEvent>>>,
    url: String,
}

impl ReconnectingSocket {
    /// Create the socket and spawn its connection task.
    ///
    /// With `start_closed` the task parks until [`reconnect`](Self::reconnect).
    #[must_use]
    pub fn new(url: String, options: SocketOptions) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ReadyState::Closed);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_connection_loop(
            url.clone(),
            options.start_closed,
            cmd_rx,
            state_tx,
            event_tx,
        ));

        Self {
            cmd_tx,
            state_rx,
            events_rx: std::sync::Mutex::new(Some(event_rx)),
            url,
        }
    }

    /// Current ready state.
    #[must_use]
    pub fn ready_state(&self) -> ReadyState {
        *self.state_rx.borrow()
    }

    /// Watch channel for ready-state transitions.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ReadyState> {
        self.state_rx.clone()
    }

    /// The URL this socket connects to.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Queue one outbound message.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionLost` when the socket is not open — writes are
    /// never buffered across outages — or `Closed` when the connection
    /// task has exited.
    pub fn send(&self, bytes: Vec<u8>) -> Result<(), SdkError> {
        if self.ready_state() != ReadyState::Open {
            return Err(SdkError::ConnectionLost("socket is not open".into()));
        }
        self.cmd_tx
            .send(SocketCmd::Send(bytes))
            .map_err(|_| SdkError::Closed)
    }

    /// Ensure a connection attempt is underway.
    ///
    /// Starts a lazy or parked socket and skips a pending backoff wait;
    /// has no effect while connecting or open.
    pub fn kick(&self) {
        let _ = self.cmd_tx.send(SocketCmd::Kick);
    }

    /// Force a reconnect: drops any current connection and redials.
    pub fn reconnect(&self) {
        let _ = self.cmd_tx.send(SocketCmd::Reconnect);
    }

    /// Close the current connection and park the task.
    ///
    /// Idempotent. A later [`kick`](Self::kick) or
    /// [`reconnect`](Self::reconnect) revives the socket; the task exits
    /// for good when the handle is dropped.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(SocketCmd::Close);
    }

    /// Extract the event receiver for the dispatch loop.
    ///
    /// Returns `None` if the receiver was already taken.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SocketEvent>> {
        self.events_rx.lock().expect("events lock poisoned").take()
    }
}

/// Why the open-connection loop ended.
enum Outcome {
    /// Local close — park until the next kick.
    Parked,
    /// Remote close or transport failure — reconnect.
    Lost,
}

async fn run_connection_loop(
    url: String,
    start_closed: bool,
    mut cmd_rx: mpsc::UnboundedReceiver<SocketCmd>,
    state_tx: watch::Sender<ReadyState>,
    event_tx: mpsc::UnboundedSender<SocketEvent>,
) {
    let mut backoff = SOCKET_BACKOFF_INITIAL;
    let mut started = !start_closed;

    'outer: loop {
        if !started {
            match cmd_rx.recv().await {
                Some(SocketCmd::Kick | SocketCmd::Reconnect) => {
                    started = true;
                    backoff = SOCKET_BACKOFF_INITIAL;
                }
                Some(SocketCmd::Close) => {}
                Some(SocketCmd::Send(_)) => {
                    log::debug!("dropping write while socket is closed");
                }
                None => break,
            }
            continue;
        }

        let _ = state_tx.send(ReadyState::Connecting);

        match connect_ws(&url).await {
            Ok((mut sink, mut stream)) => {
                log::info!("socket connected: {url}");
                let _ = state_tx.send(ReadyState::Open);
                let _ = event_tx.send(SocketEvent::Open);
                backoff = SOCKET_BACKOFF_INITIAL;

                let outcome =
                    run_open_loop(&mut sink, &mut stream, &mut cmd_rx, &state_tx, &event_tx).await;

                if matches!(outcome, Outcome::Parked) {
                    started = false;
                    let _ = state_tx.send(ReadyState::Closed);
                    continue;
                }
                log::warn!("socket disconnected: {url}");
            }
            Err(e) => {
                log::warn!("socket connect failed: {e}");
                let _ = event_tx.send(SocketEvent::Error(e));
            }
        }

        let _ = state_tx.send(ReadyState::Closed);

        // Randomised exponential backoff before the next attempt.
        let jitter = Duration::from_millis(rand::random::<u64>() % SOCKET_BACKOFF_JITTER_MS);
        let wait = backoff + jitter;
        log::info!("socket reconnecting in {:.1}s", wait.as_secs_f32());

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            cmd = cmd_rx.recv() => match cmd {
                None => break 'outer,
                Some(SocketCmd::Close) => {
                    started = false;
                    continue;
                }
                Some(SocketCmd::Kick | SocketCmd::Reconnect) => backoff = SOCKET_BACKOFF_INITIAL,
                Some(SocketCmd::Send(_)) => {
                    log::debug!("dropping write during reconnect backoff");
                }
            }
        }

        backoff = (backoff * SOCKET_BACKOFF_FACTOR).min(SOCKET_BACKOFF_CAP);
    }

    let _ = state_tx.send(ReadyState::Closed);
    log::debug!("socket task exiting: {url}");
}

async fn run_open_loop(
    sink: &mut SplitSink<WsStream, Message>,
    stream: &mut SplitStream<WsStream>,
    cmd_rx: &mut mpsc::UnboundedReceiver<SocketCmd>,
    state_tx: &watch::Sender<ReadyState>,
    event_tx: &mpsc::UnboundedSender<SocketEvent>,
) -> Outcome {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(SocketCmd::Send(bytes)) => {
                    if let Err(e) = sink.send(Message::Binary(bytes)).await {
                        let _ = event_tx.send(SocketEvent::Error(format!("send failed: {e}")));
                        let _ = event_tx.send(SocketEvent::Close { code: 1006, reason: String::new() });
                        return Outcome::Lost;
                    }
                }
                Some(SocketCmd::Kick) => {}
                Some(SocketCmd::Reconnect) => return Outcome::Lost,
                Some(SocketCmd::Close) => {
                    let _ = state_tx.send(ReadyState::Closing);
                    let _ = sink.send(Message::Close(None)).await;
                    return Outcome::Parked;
                }
                None => return Outcome::Parked,
            },

            msg = stream.next() => match msg {
                Some(Ok(Message::Binary(bytes))) => {
                    let _ = event_tx.send(SocketEvent::Message(bytes));
                }
                Some(Ok(Message::Text(text))) => {
                    // The protocol is binary; forward so the transport can
                    // surface a decode error rather than silently dropping.
                    let _ = event_tx.send(SocketEvent::Message(text.into_bytes()));
                }
                Some(Ok(Message::Ping(data))) => {
                    if sink.send(Message::Pong(data)).await.is_err() {
                        let _ = event_tx.send(SocketEvent::Close { code: 1006, reason: String::new() });
                        return Outcome::Lost;
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|cf| (u16::from(cf.code), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    let _ = event_tx.send(SocketEvent::Close { code, reason });
                    return Outcome::Lost;
                }
                Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                Some(Err(e)) => {
                    let _ = event_tx.send(SocketEvent::Error(format!("read error: {e}")));
                    let _ = event_tx.send(SocketEvent::Close { code: 1006, reason: String::new() });
                    return Outcome::Lost;
                }
                None => {
                    let _ = event_tx.send(SocketEvent::Close { code: 1006, reason: String::new() });
                    return Outcome::Lost;
                }
            },
        }
    }
}

/// Connect and split, bounded by [`CONNECT_TIMEOUT`].
async fn connect_ws(
    url: &str,
) -> Result<(SplitSink<WsStream, Message>, SplitStream<WsStream>), String> {
    let request = url
        .into_client_request()
        .map_err(|e| format!("invalid WebSocket URL {url}: {e}"))?;

    match tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(request)).await {
        Ok(Ok((ws_stream, _response))) => {
            let (sink, stream) = ws_stream.split();
            Ok((sink, stream))
        }
        Ok(Err(e)) => Err(format!("WebSocket connect failed: {e}")),
        Err(_) => Err("WebSocket connect timed out".into()),
    }
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        url.replace("https://", "wss://")
            .replace("http://", "ws://")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_to_ws_scheme_https() {
        assert_eq!(http_to_ws_scheme("https://example.com"), "wss://example.com");
    }

    #[test]
    fn test_http_to_ws_scheme_http() {
        assert_eq!(
            http_to_ws_scheme("http://localhost:3000"),
            "ws://localhost:3000"
        );
    }

    #[test]
    fn test_http_to_ws_scheme_passthrough() {
        assert_eq!(
            http_to_ws_scheme("wss://example.com/channel"),
            "wss://example.com/channel"
        );
        assert_eq!(
            http_to_ws_scheme("ws://localhost:3000/channel"),
            "ws://localhost:3000/channel"
        );
    }

    #[tokio::test]
    async fn test_lazy_socket_stays_closed() {
        let socket = ReconnectingSocket::new(
            "ws://127.0.0.1:1/never".into(),
            SocketOptions { start_closed: true },
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(socket.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_send_while_closed_fails_immediately() {
        let socket = ReconnectingSocket::new(
            "ws://127.0.0.1:1/never".into(),
            SocketOptions { start_closed: true },
        );
        let err = socket.send(vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, SdkError::ConnectionLost(_)));
    }

    #[tokio::test]
    async fn test_take_events_is_single_shot() {
        let socket = ReconnectingSocket::new(
            "ws://127.0.0.1:1/never".into(),
            SocketOptions { start_closed: true },
        );
        assert!(socket.take_events().is_some());
        assert!(socket.take_events().is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let socket = ReconnectingSocket::new(
            "ws://127.0.0.1:1/never".into(),
            SocketOptions { start_closed: true },
        );
        socket.close();
        socket.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(socket.ready_state(), ReadyState::Closed);
    }

    #[tokio::test]
    async fn test_connect_failure_reports_error_event() {
        let socket = ReconnectingSocket::new(
            "ws://127.0.0.1:1/never".into(),
            SocketOptions { start_closed: false },
        );
        let mut events = socket.take_events().expect("events");
        let event = tokio::time::timeout(Duration::from_secs(15), events.recv())
            .await
            .expect("event within timeout")
            .expect("channel open");
        assert!(matches!(event, SocketEvent::Error(_)));
        socket.close();
    }
}
