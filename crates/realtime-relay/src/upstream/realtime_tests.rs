//! Tests for the production realtime upstream against an in-process
//! WebSocket server.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;

use super::realtime::{
    RealtimeConnector, generate_event_id, outgoing_event, parse_server_event, session_endpoint,
};
use super::{
    ConnectError, ConnectionState, OpenedUpstream, SendError, UpstreamConnector, UpstreamEvent,
    UpstreamUnavailable, connect_with_timeout,
};

/// Handshake details captured by the fake realtime service.
#[derive(Debug)]
struct Handshake {
    uri: String,
    authorization: Option<String>,
    beta: Option<String>,
}

fn header(req: &Request, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

fn open(connector: &RealtimeConnector) -> OpenedUpstream {
    connector.open().expect("connector should open with a key")
}

// ── production session over a real socket ───────────────────────────

#[tokio::test]
async fn connect_send_receive_and_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = oneshot::channel::<Handshake>();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let _ = seen_tx.send(Handshake {
                uri: req.uri().to_string(),
                authorization: header(req, "authorization"),
                beta: header(req, "openai-beta"),
            });
            Ok(resp)
        };
        let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .unwrap();

        let first = ws.next().await.unwrap().unwrap();
        let received: Value = serde_json::from_str(first.to_text().unwrap()).unwrap();

        ws.send(Message::text(
            json!({"type": "session.created", "echo": received["id"]}).to_string(),
        ))
        .await
        .unwrap();
        ws.send(Message::text("not an event")).await.unwrap();
        ws.send(Message::text(json!({"type": "response.done"}).to_string()))
            .await
            .unwrap();
        ws.close(None).await.unwrap();
        received
    });

    let connector = RealtimeConnector::new(
        Some("sk-test-key".into()),
        &format!("ws://{addr}/v1/realtime"),
        "test-model",
    );
    let OpenedUpstream {
        mut session,
        mut events,
    } = open(&connector);

    assert_eq!(session.state(), ConnectionState::Unconnected);
    assert!(!session.is_ready());

    session.connect().await.unwrap();
    assert!(session.is_ready());

    session
        .send("ping", json!({"type": "ping", "id": 1}))
        .await
        .unwrap();

    let handshake = seen_rx.await.unwrap();
    assert_eq!(handshake.uri, "/v1/realtime?model=test-model");
    assert_eq!(handshake.authorization.as_deref(), Some("Bearer sk-test-key"));
    assert_eq!(handshake.beta.as_deref(), Some("realtime=v1"));

    assert_eq!(
        events.recv().await,
        Some(UpstreamEvent::Server(
            json!({"type": "session.created", "echo": 1})
        ))
    );
    // The non-JSON frame is skipped, not forwarded.
    assert_eq!(
        events.recv().await,
        Some(UpstreamEvent::Server(json!({"type": "response.done"})))
    );
    assert_eq!(events.recv().await, Some(UpstreamEvent::Closed));

    let received = server.await.unwrap();
    assert_eq!(received["type"], "ping");
    assert_eq!(received["id"], 1);
    let event_id = received["event_id"].as_str().unwrap();
    assert!(event_id.starts_with("evt_"));

    assert!(!session.is_ready());
    session.disconnect().await;
    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn rejected_handshake_is_connect_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = |_req: &Request, _resp: Response| -> Result<Response, ErrorResponse> {
            Err(http::Response::builder()
                .status(http::StatusCode::UNAUTHORIZED)
                .body(Some("invalid api key".to_string()))
                .unwrap())
        };
        let _ = tokio_tungstenite::accept_hdr_async(stream, callback).await;
    });

    let connector =
        RealtimeConnector::new(Some("sk-bad".into()), &format!("ws://{addr}/"), "m");
    let OpenedUpstream { mut session, .. } = open(&connector);

    let err = session.connect().await.unwrap_err();
    assert!(
        matches!(err, ConnectError::Rejected { status: 401 }),
        "unexpected error: {err}"
    );
    assert_eq!(session.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn silent_upstream_times_out() {
    // Accepts TCP at the OS level but never answers the handshake.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let connector = RealtimeConnector::new(Some("sk-x".into()), &format!("ws://{addr}/"), "m");
    let OpenedUpstream { mut session, .. } = open(&connector);

    let err = connect_with_timeout(session.as_mut(), Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectError::Timeout(_)));

    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Closed);
    drop(listener);
}

#[tokio::test]
async fn unreachable_upstream_is_transport_error() {
    let connector = RealtimeConnector::new(Some("sk-x".into()), "ws://127.0.0.1:1/", "m");
    let OpenedUpstream { mut session, .. } = open(&connector);
    assert!(matches!(
        session.connect().await,
        Err(ConnectError::Transport(_))
    ));
}

// ── handle discipline ───────────────────────────────────────────────

#[test]
fn missing_key_is_unavailable() {
    let connector = RealtimeConnector::new(None, "wss://example.com/v1/realtime", "m");
    assert!(matches!(
        connector.open(),
        Err(UpstreamUnavailable::MissingCredential)
    ));

    let blank = RealtimeConnector::new(Some("  ".into()), "wss://example.com/v1/realtime", "m");
    assert!(blank.open().is_err());
}

#[tokio::test]
async fn send_before_connect_is_not_connected() {
    let connector = RealtimeConnector::new(Some("sk-x".into()), "ws://127.0.0.1:1/", "m");
    let OpenedUpstream { mut session, .. } = open(&connector);
    let err = session
        .send("ping", json!({"type": "ping"}))
        .await
        .unwrap_err();
    assert!(matches!(err, SendError::NotConnected));
}

#[tokio::test]
async fn disconnect_before_connect_is_terminal() {
    let connector = RealtimeConnector::new(Some("sk-x".into()), "ws://127.0.0.1:1/", "m");
    let OpenedUpstream { mut session, .. } = open(&connector);

    session.disconnect().await;
    session.disconnect().await;
    assert_eq!(session.state(), ConnectionState::Closed);
    assert!(matches!(
        session.connect().await,
        Err(ConnectError::InvalidState(ConnectionState::Closed))
    ));
}

// ── wire shape ──────────────────────────────────────────────────────

#[test]
fn outgoing_event_sets_type_and_event_id() {
    let event = outgoing_event("input_audio_buffer.append", json!({"audio": "AAAA"})).unwrap();
    assert_eq!(event["type"], "input_audio_buffer.append");
    assert_eq!(event["audio"], "AAAA");
    assert!(event["event_id"].as_str().unwrap().starts_with("evt_"));
}

#[test]
fn outgoing_event_keeps_client_event_id() {
    let event = outgoing_event(
        "response.create",
        json!({"type": "response.create", "event_id": "evt_client"}),
    )
    .unwrap();
    assert_eq!(event["event_id"], "evt_client");
}

#[test]
fn outgoing_event_rejects_non_objects() {
    assert!(matches!(
        outgoing_event("ping", json!([1, 2])),
        Err(SendError::InvalidPayload)
    ));
}

#[test]
fn event_ids_are_unique_and_sized() {
    let a = generate_event_id();
    let b = generate_event_id();
    assert_ne!(a, b);
    assert_eq!(a.len(), "evt_".len() + 21);
    assert!(a[4..].chars().all(|c| c.is_ascii_alphanumeric()));
}

#[test]
fn endpoint_carries_model() {
    assert_eq!(
        session_endpoint("wss://api.openai.com/v1/realtime", "gpt-x"),
        "wss://api.openai.com/v1/realtime?model=gpt-x"
    );
    assert_eq!(
        session_endpoint("https://proxy.local/realtime?region=eu", "gpt-x"),
        "wss://proxy.local/realtime?region=eu&model=gpt-x"
    );
}

#[test]
fn server_events_need_a_string_type() {
    assert!(parse_server_event(r#"{"type":"error","error":{}}"#).is_some());
    assert!(parse_server_event(r#"{"kind":"error"}"#).is_none());
    assert!(parse_server_event(r#"["type"]"#).is_none());
    assert!(parse_server_event("garbage").is_none());
}
