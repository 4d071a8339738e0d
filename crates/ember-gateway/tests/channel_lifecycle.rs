//! Channel driver against an in-process axum WebSocket backend.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    extract::{
        Path,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::future::BoxFuture;
use serde_json::{Value, json};
use url::Url;

use ember_auth::CredentialSource;
use ember_gateway::{
    ABNORMAL_CLOSURE, ChannelEvent, ChannelEvents, ChannelManager, ChannelState, GatewayConfig,
    UNAUTHORIZED_CLOSURE,
};
use ember_types::events::{InboundFrame, Notification, OutboundFrame};
use ember_types::{PeerId, Topic};

const TOKEN: &str = "good-token";

struct StaticToken(Option<&'static str>);

impl CredentialSource for StaticToken {
    fn access_token(&self) -> BoxFuture<'_, Option<String>> {
        Box::pin(async move { self.0.map(str::to_string) })
    }
}

async fn upgrade(Path(topic): Path<String>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    let protocol = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if protocol != format!("Bearer.{}", TOKEN) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.protocols([protocol])
        .on_upgrade(move |socket| serve(socket, topic))
}

/// `notification/` greets with a match event. `message/{peer}/` echoes chat
/// text back as if sent by that peer, with two special inputs: `bad` yields a
/// malformed frame followed by a valid one, `close-me` makes the server close
/// with 4000.
async fn serve(mut socket: WebSocket, topic: String) {
    if topic == "notification/" {
        let greeting = json!({"type": "match", "id": 1}).to_string();
        if socket.send(Message::Text(greeting.into())).await.is_err() {
            return;
        }
    }
    let peer: u64 = topic
        .strip_prefix("message/")
        .and_then(|rest| rest.trim_end_matches('/').parse().ok())
        .unwrap_or(0);

    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let body: Value = serde_json::from_str(text.as_str()).unwrap_or_default();
        let chat = |text: &str| {
            json!({
                "type": "message",
                "sender": peer,
                "text": text,
                "created_at": "2026-01-01T00:00:00Z",
            })
            .to_string()
        };
        match body["text"].as_str() {
            Some("close-me") => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: 4000,
                        reason: "bye".into(),
                    })))
                    .await;
                break;
            }
            Some("bad") => {
                let _ = socket.send(Message::Text("not json".into())).await;
                let _ = socket.send(Message::Text(chat("after-bad").into())).await;
            }
            Some(text) => {
                let _ = socket.send(Message::Text(chat(text).into())).await;
            }
            None => {}
        }
    }
}

async fn spawn_backend() -> Url {
    let app = Router::new().route("/ws/{*topic}", get(upgrade));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    Url::parse(&format!("http://{}/", addr)).unwrap()
}

async fn manager(token: Option<&'static str>) -> ChannelManager {
    let origin = spawn_backend().await;
    let mut config = GatewayConfig::new(origin);
    config.close_timeout = Duration::from_secs(1);
    ChannelManager::new(config, Arc::new(StaticToken(token))).unwrap()
}

async fn next(events: &mut ChannelEvents) -> ChannelEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for channel event")
        .expect("channel event stream ended")
}

async fn assert_quiet(events: &mut ChannelEvents) {
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(events.try_recv(), None);
}

fn chat(text: &str) -> OutboundFrame {
    OutboundFrame::Chat { text: text.into() }
}

fn chat_text(event: ChannelEvent) -> (PeerId, String) {
    match event {
        ChannelEvent::Frame(InboundFrame::Chat(msg)) => (msg.sender, msg.text),
        other => panic!("expected chat frame, got {:?}", other),
    }
}

#[tokio::test]
async fn toggling_enabled_opens_and_closes_once_per_phase() {
    let manager = manager(Some(TOKEN)).await;
    let (mut handle, mut events) = manager.open_channel(Topic::notifications(), true);

    for _ in 0..2 {
        assert_eq!(next(&mut events).await, ChannelEvent::Open);
        assert_eq!(
            next(&mut events).await,
            ChannelEvent::Frame(InboundFrame::Notification(Notification::Match { id: PeerId(1) }))
        );

        handle.set_enabled(false);
        match next(&mut events).await {
            ChannelEvent::Closed(close) => {
                assert!(close.is_normal());
                assert_eq!(close.reason, "disabled");
            }
            other => panic!("expected close, got {:?}", other),
        }
        assert_eq!(handle.state(), ChannelState::Closed);
        assert_quiet(&mut events).await;

        handle.set_enabled(true);
    }
}

#[tokio::test]
async fn disabled_channel_stays_idle() {
    let manager = manager(Some(TOKEN)).await;
    let (handle, mut events) = manager.open_channel(Topic::notifications(), false);
    assert_quiet(&mut events).await;
    assert_eq!(handle.state(), ChannelState::Idle);
}

#[tokio::test]
async fn missing_credential_closes_without_handshake() {
    let manager = manager(None).await;
    let (handle, mut events) = manager.open_channel(Topic::notifications(), true);

    match next(&mut events).await {
        ChannelEvent::Closed(close) => {
            assert_eq!(close.code, UNAUTHORIZED_CLOSURE);
            assert_eq!(close.reason, "no credential");
        }
        other => panic!("expected close, got {:?}", other),
    }
    assert_eq!(handle.state(), ChannelState::Closed);
}

#[tokio::test]
async fn rejected_handshake_is_abnormal_closure() {
    let manager = manager(Some("stale-token")).await;
    let (_handle, mut events) = manager.open_channel(Topic::notifications(), true);

    match next(&mut events).await {
        ChannelEvent::Closed(close) => assert_eq!(close.code, ABNORMAL_CLOSURE),
        other => panic!("expected close, got {:?}", other),
    }
    assert_quiet(&mut events).await;
}

#[tokio::test]
async fn malformed_frame_is_dropped() {
    let manager = manager(Some(TOKEN)).await;
    let (handle, mut events) = manager.open_channel(Topic::messages(PeerId(5)), true);
    assert_eq!(next(&mut events).await, ChannelEvent::Open);

    handle.send(chat("bad")).unwrap();
    assert_eq!(chat_text(next(&mut events).await), (PeerId(5), "after-bad".into()));
}

#[tokio::test]
async fn server_close_is_surfaced_and_not_retried() {
    let manager = manager(Some(TOKEN)).await;
    let (mut handle, mut events) = manager.open_channel(Topic::messages(PeerId(5)), true);
    assert_eq!(next(&mut events).await, ChannelEvent::Open);

    handle.send(chat("close-me")).unwrap();
    match next(&mut events).await {
        ChannelEvent::Closed(close) => {
            assert_eq!(close.code, 4000);
            assert_eq!(close.reason, "bye");
        }
        other => panic!("expected close, got {:?}", other),
    }
    assert_quiet(&mut events).await;
    assert_eq!(handle.state(), ChannelState::Closed);
    assert!(handle.send(chat("hello")).is_err());

    // Re-enabling starts a fresh cycle
    handle.set_enabled(true);
    assert_eq!(next(&mut events).await, ChannelEvent::Open);
}

#[tokio::test]
async fn topic_change_reconnects() {
    let manager = manager(Some(TOKEN)).await;
    let (mut handle, mut events) = manager.open_channel(Topic::messages(PeerId(1)), true);
    assert_eq!(next(&mut events).await, ChannelEvent::Open);

    handle.set_topic(Topic::messages(PeerId(2)));
    match next(&mut events).await {
        ChannelEvent::Closed(close) => assert_eq!(close.reason, "topic change"),
        other => panic!("expected close, got {:?}", other),
    }
    assert_eq!(next(&mut events).await, ChannelEvent::Open);

    handle.send(chat("hello")).unwrap();
    assert_eq!(chat_text(next(&mut events).await), (PeerId(2), "hello".into()));
}

#[tokio::test]
async fn dropping_the_handle_closes_cleanly() {
    let manager = manager(Some(TOKEN)).await;
    let (handle, mut events) = manager.open_channel(Topic::messages(PeerId(3)), true);
    assert_eq!(next(&mut events).await, ChannelEvent::Open);

    drop(handle);
    match next(&mut events).await {
        ChannelEvent::Closed(close) => {
            assert!(close.is_normal());
            assert_eq!(close.reason, "component unmount");
        }
        other => panic!("expected close, got {:?}", other),
    }
    let end = tokio::time::timeout(Duration::from_secs(5), events.recv()).await;
    assert_eq!(end.unwrap(), None);
}

#[tokio::test]
async fn close_all_tears_down_every_channel() {
    let manager = manager(Some(TOKEN)).await;
    let (a, mut a_events) = manager.open_channel(Topic::notifications(), true);
    let (b, mut b_events) = manager.open_channel(Topic::messages(PeerId(9)), true);
    assert_eq!(next(&mut a_events).await, ChannelEvent::Open);
    assert_eq!(next(&mut b_events).await, ChannelEvent::Open);
    assert_eq!(manager.live_channels(), 2);

    manager.close_all().await;
    assert_eq!(a.state(), ChannelState::Closed);
    assert_eq!(b.state(), ChannelState::Closed);
    assert_eq!(manager.live_channels(), 0);

    // Channels opened afterwards work normally
    let (_c, mut c_events) = manager.open_channel(Topic::notifications(), true);
    assert_eq!(next(&mut c_events).await, ChannelEvent::Open);
}
