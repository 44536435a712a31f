//! Transport-level end-to-end tests against the mock server.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::SinkExt;
use notebook_sdk::codec::Value;
use notebook_sdk::transport::{Transport, TransportOptions};
use notebook_sdk::SdkError;

use common::{accept, bind, close_with, event_frame, next_request, reply_text};

/// A request issued before any connection exists is queued and flushed
/// once the socket opens.
#[tokio::test]
async fn queued_send_across_outage() {
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let request = next_request(&mut ws).await.expect("queued ping arrives");
        assert_eq!(request.action, "ping");
        reply_text(&mut ws, &request, "pong").await;
        ws
    });

    // start_closed is the default: nothing has connected yet.
    let transport =
        Transport::new(url, TransportOptions::default()).expect("transport");

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        transport.invoke("ping", Value::Null),
    )
    .await
    .expect("resolves within timeout")
    .expect("queued ping succeeds");
    assert_eq!(result.as_str(), Some("pong"));

    transport.close();
    let _ = server.await;
}

/// A 1008 close with a rate-limit reason rejects the pending request with
/// a rate-limit error, schedules no reconnect, and fails fast afterwards.
#[tokio::test]
async fn rate_limit_close_during_request() {
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let request = next_request(&mut ws).await.expect("ping arrives");
        assert_eq!(request.action, "ping");
        close_with(&mut ws, 1008, "rate limit exceeded").await;
        listener
    });

    let transport =
        Transport::new(url, TransportOptions::default()).expect("transport");

    let err = tokio::time::timeout(
        Duration::from_secs(10),
        transport.invoke("ping", Value::Null),
    )
    .await
    .expect("rejected promptly")
    .unwrap_err();
    match err {
        SdkError::RateLimited(reason) => assert!(reason.contains("rate limit")),
        other => panic!("expected rate-limit error, got {other:?}"),
    }

    // Fail fast until the caller explicitly reconnects.
    let err = transport.invoke("ping", Value::Null).await.unwrap_err();
    assert!(matches!(err, SdkError::RateLimited(_)));

    // No reconnection attempt reaches the server.
    let listener = server.await.expect("server task");
    let second = tokio::time::timeout(Duration::from_millis(700), listener.accept()).await;
    assert!(second.is_err(), "no reconnect may be scheduled after 1008");

    transport.close();
}

/// An explicit reconnect after a policy stop revives the transport.
#[tokio::test]
async fn reconnect_revives_after_policy_stop() {
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let request = next_request(&mut ws).await.expect("first ping");
        close_with(&mut ws, 1008, "rate limit exceeded").await;
        drop(request);

        // Second connection only happens after the explicit reconnect.
        let mut ws = accept(&listener).await;
        let request = next_request(&mut ws).await.expect("second ping");
        reply_text(&mut ws, &request, "pong").await;
        ws
    });

    let transport =
        Transport::new(url, TransportOptions::default()).expect("transport");
    let _ = transport.invoke("ping", Value::Null).await.unwrap_err();

    tokio::time::timeout(Duration::from_secs(10), transport.reconnect())
        .await
        .expect("reconnect resolves")
        .expect("reconnect succeeds");
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        transport.invoke("ping", Value::Null),
    )
    .await
    .expect("resolves")
    .expect("ping after reconnect");
    assert_eq!(result.as_str(), Some("pong"));

    transport.close();
    let _ = server.await;
}

/// Server pushes route to listeners by topic, honouring the `as` alias.
#[tokio::test]
async fn event_routing_and_alias() {
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let request = next_request(&mut ws).await.expect("ping");
        reply_text(&mut ws, &request, "pong").await;

        ws.send(event_frame("container.stats", Value::map([("cpu", Value::Int(12))])))
            .await
            .expect("push stats");

        // Aliased push: delivered under the alias, not the event name.
        let aliased = Value::map([
            ("event", Value::from("notebook.log")),
            ("as", Value::from("logs.primary")),
            ("data", Value::from("booted")),
        ]);
        ws.send(tokio_tungstenite::tungstenite::Message::Binary(
            notebook_sdk::codec::encode(&aliased),
        ))
        .await
        .expect("push aliased");
        ws
    });

    let transport =
        Transport::new(url, TransportOptions::default()).expect("transport");

    let stats = Arc::new(Mutex::new(None));
    let stats2 = Arc::clone(&stats);
    let _sub_stats = transport.listen("container.stats", move |data| {
        *stats2.lock().unwrap() = data.get("cpu").and_then(Value::as_i64);
    });

    let logs = Arc::new(Mutex::new(Vec::new()));
    let logs2 = Arc::clone(&logs);
    let _sub_alias = transport.listen("logs.primary", move |data| {
        if let Some(line) = data.as_str() {
            logs2.lock().unwrap().push(line.to_string());
        }
    });
    let unaliased = Arc::new(Mutex::new(0u32));
    let unaliased2 = Arc::clone(&unaliased);
    let _sub_plain = transport.listen("notebook.log", move |_| {
        *unaliased2.lock().unwrap() += 1;
    });

    transport.invoke("ping", Value::Null).await.expect("ping");
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(*stats.lock().unwrap(), Some(12));
    assert_eq!(*logs.lock().unwrap(), vec!["booted".to_string()]);
    assert_eq!(*unaliased.lock().unwrap(), 0, "alias replaces the raw topic");

    transport.close();
    let _ = server.await;
}

/// Malformed frames are dropped (with a transport.error event); valid
/// traffic afterwards still works.
#[tokio::test]
async fn invalid_frame_is_dropped_not_fatal() {
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let request = next_request(&mut ws).await.expect("ping");

        ws.send(tokio_tungstenite::tungstenite::Message::Binary(
            b"definitely not cbor".to_vec(),
        ))
        .await
        .expect("send garbage");
        reply_text(&mut ws, &request, "pong").await;
        ws
    });

    let transport =
        Transport::new(url, TransportOptions::default()).expect("transport");

    let errors = Arc::new(Mutex::new(0u32));
    let errors2 = Arc::clone(&errors);
    let _sub = transport.listen("transport.error", move |_| {
        *errors2.lock().unwrap() += 1;
    });

    let result = tokio::time::timeout(
        Duration::from_secs(10),
        transport.invoke("ping", Value::Null),
    )
    .await
    .expect("resolves")
    .expect("ping still succeeds");
    assert_eq!(result.as_str(), Some("pong"));
    assert!(*errors.lock().unwrap() >= 1);

    transport.close();
    let _ = server.await;
}

/// Typed application errors surface with code and message and are not
/// retried.
#[tokio::test]
async fn application_error_not_retried() {
    let (listener, url) = bind().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let request = next_request(&mut ws).await.expect("request");
        assert_eq!(request.action, "fs.readFile");
        ws.send(common::error_frame(
            &request,
            Value::map([
                ("code", Value::Int(404)),
                ("message", Value::from("no such file")),
                ("name", Value::from("FileNotFound")),
            ]),
        ))
        .await
        .expect("send error");

        // Any retry would show up as a second request.
        let retry =
            tokio::time::timeout(Duration::from_millis(500), next_request(&mut ws)).await;
        assert!(retry.is_err(), "application errors must not be retried");
        ws
    });

    let transport =
        Transport::new(url, TransportOptions::default()).expect("transport");
    let err = tokio::time::timeout(
        Duration::from_secs(10),
        transport.invoke("fs.readFile", Value::map([("path", Value::from("/nope"))])),
    )
    .await
    .expect("resolves")
    .unwrap_err();
    match err {
        SdkError::Api { code, message, .. } => {
            assert_eq!(code, 404);
            assert_eq!(message, "no such file");
        }
        other => panic!("expected Api error, got {other:?}"),
    }

    transport.close();
    let _ = server.await;
}
