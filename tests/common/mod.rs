//! In-process mock notebook server for integration tests.
//!
//! Speaks the binary frame protocol over a real WebSocket so tests can
//! script server behaviour: answer requests, push events, and close with
//! specific codes.
#![allow(dead_code)] // each test binary uses a different helper subset

use futures_util::{SinkExt, StreamExt};
use notebook_sdk::codec::{self, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub type ServerWs = WebSocketStream<TcpStream>;

/// Bind an ephemeral listener; returns it and the ws URL clients dial.
pub async fn bind() -> (TcpListener, String) {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    (listener, format!("ws://{addr}/channel"))
}

/// Accept one client connection and complete the WebSocket handshake.
pub async fn accept(listener: &TcpListener) -> ServerWs {
    let (stream, _) = listener.accept().await.expect("accept");
    tokio_tungstenite::accept_async(stream)
        .await
        .expect("server handshake")
}

/// One decoded client request frame.
#[derive(Debug, Clone)]
pub struct Request {
    pub action: String,
    pub response_event: String,
    pub error_event: String,
    pub data: Value,
}

/// Read frames until the next request; `None` when the peer is gone.
pub async fn next_request(ws: &mut ServerWs) -> Option<Request> {
    while let Some(message) = ws.next().await {
        match message {
            Ok(Message::Binary(bytes)) => {
                let frame = codec::decode(&bytes).expect("client frame decodes");
                let action = frame
                    .get("action")
                    .and_then(Value::as_str)
                    .expect("request has action")
                    .to_string();
                let response_event = frame
                    .get("responseEvent")
                    .and_then(Value::as_str)
                    .expect("request has responseEvent")
                    .to_string();
                let error_event = frame
                    .get("errorEvent")
                    .and_then(Value::as_str)
                    .expect("request has errorEvent")
                    .to_string();
                let data = frame.get("data").cloned().unwrap_or(Value::Null);
                return Some(Request { action, response_event, error_event, data });
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => {}
        }
    }
    None
}

/// A server push on `topic`.
pub fn event_frame(topic: &str, data: Value) -> Message {
    Message::Binary(codec::encode(&Value::map([
        ("event", Value::from(topic)),
        ("data", data),
    ])))
}

/// A successful reply to `request`.
pub fn response_frame(request: &Request, data: Value) -> Message {
    Message::Binary(codec::encode(&Value::map([
        ("event", Value::from("response")),
        (
            "data",
            Value::map([
                ("responseEvent", Value::from(request.response_event.as_str())),
                ("data", data),
            ]),
        ),
    ])))
}

/// A typed error reply to `request`.
pub fn error_frame(request: &Request, data: Value) -> Message {
    Message::Binary(codec::encode(&Value::map([
        ("event", Value::from("error")),
        (
            "data",
            Value::map([
                ("errorEvent", Value::from(request.error_event.as_str())),
                ("data", data),
            ]),
        ),
    ])))
}

/// The `notebook.initialized` push a healthy server sends on connect.
pub fn init_frame() -> Message {
    event_frame(
        "notebook.initialized",
        Value::map([
            ("kind", Value::from("ready")),
            ("env", Value::map([("APP_ENV", Value::from("testing"))])),
            ("previewUrl", Value::from("https://preview.test/nb-1")),
            ("ports", Value::Array(vec![Value::Int(8080)])),
        ]),
    )
}

/// Close the connection with a specific code and reason.
pub async fn close_with(ws: &mut ServerWs, code: u16, reason: &str) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    };
    let _ = ws.send(Message::Close(Some(frame))).await;
    // Drain until the peer acknowledges the close.
    while ws.next().await.is_some() {}
}

/// Reply to `request` with a plain text payload.
pub async fn reply_text(ws: &mut ServerWs, request: &Request, text: &str) {
    ws.send(response_frame(request, Value::from(text)))
        .await
        .expect("server send");
}
