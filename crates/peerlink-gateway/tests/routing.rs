//! Integration tests for identity-based signaling routing.
//!
//! Each test runs a gateway on an ephemeral port and talks to it with
//! plain WebSocket clients.

use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use peerlink_gateway::AppState;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OFFER_TO_RECEIVER: &str = r#"{"event":"sdp","type":"OFFER","description":"v=0\r\n","sender":"Sender","receiver":"Receiver"}"#;
const TRICKLE_TO_SENDER: &str = r#"{"event":"trickle","candidate":{"sdpMid":"0","sdpMLineIndex":0,"sdp":"candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host"},"sender":"Receiver","receiver":"Sender"}"#;

async fn spawn_gateway() -> (SocketAddr, AppState) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let state = AppState::new();
    tokio::spawn(peerlink_gateway::serve(listener, state.clone()));
    (addr, state)
}

async fn wait_until(state: &AppState, identity: &str, registered: bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if state.connections.read().await.contains_key(identity) == registered {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("registration state did not settle");
}

async fn register(addr: SocketAddr, state: &AppState, identity: &str) -> Client {
    let (mut client, _) = connect_async(format!("ws://{addr}/websocket"))
        .await
        .expect("connect");
    let register = format!(r#"{{"event":"register","userId":"{identity}"}}"#);
    client.send(Message::Text(register)).await.expect("register");
    wait_until(state, identity, true).await;
    client
}

async fn next_text(client: &mut Client) -> String {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for a message")
}

async fn assert_silent(client: &mut Client) {
    let received = tokio::time::timeout(Duration::from_millis(200), client.next()).await;
    assert!(received.is_err(), "unexpected message: {received:?}");
}

#[tokio::test]
async fn test_sdp_is_forwarded_verbatim_to_receiver() {
    let (addr, state) = spawn_gateway().await;
    let mut sender = register(addr, &state, "Sender").await;
    let mut receiver = register(addr, &state, "Receiver").await;

    sender
        .send(Message::Text(OFFER_TO_RECEIVER.to_string()))
        .await
        .unwrap();

    assert_eq!(next_text(&mut receiver).await, OFFER_TO_RECEIVER);
    assert_silent(&mut sender).await;
}

#[tokio::test]
async fn test_trickle_is_routed_by_receiver_label() {
    let (addr, state) = spawn_gateway().await;
    let mut sender = register(addr, &state, "Sender").await;
    let mut receiver = register(addr, &state, "Receiver").await;

    receiver
        .send(Message::Text(TRICKLE_TO_SENDER.to_string()))
        .await
        .unwrap();

    assert_eq!(next_text(&mut sender).await, TRICKLE_TO_SENDER);
}

#[tokio::test]
async fn test_newer_registration_replaces_older() {
    let (addr, state) = spawn_gateway().await;
    let mut sender = register(addr, &state, "Sender").await;
    let mut stale = register(addr, &state, "Receiver").await;
    let mut fresh = {
        let (mut client, _) = connect_async(format!("ws://{addr}/websocket")).await.unwrap();
        client
            .send(Message::Text(r#"{"event":"register","userId":"Receiver"}"#.to_string()))
            .await
            .unwrap();
        client
    };
    // Let the second registration land before routing.
    tokio::time::sleep(Duration::from_millis(100)).await;

    sender
        .send(Message::Text(OFFER_TO_RECEIVER.to_string()))
        .await
        .unwrap();

    assert_eq!(next_text(&mut fresh).await, OFFER_TO_RECEIVER);
    assert_silent(&mut stale).await;

    // The replaced connection leaving must not unbind the newer one.
    stale.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(state.connections.read().await.contains_key("Receiver"));
}

#[tokio::test]
async fn test_undecodable_frames_are_dropped() {
    let (addr, state) = spawn_gateway().await;
    let mut sender = register(addr, &state, "Sender").await;
    let mut receiver = register(addr, &state, "Receiver").await;

    for junk in ["not json", r#"{"event":"bye"}"#, r#"{"event":"sdp","type":"offer"}"#] {
        sender.send(Message::Text(junk.to_string())).await.unwrap();
    }
    sender
        .send(Message::Text(OFFER_TO_RECEIVER.to_string()))
        .await
        .unwrap();

    assert_eq!(next_text(&mut receiver).await, OFFER_TO_RECEIVER);
}

#[tokio::test]
async fn test_oversized_sdp_is_dropped() {
    let (addr, state) = spawn_gateway().await;
    let mut sender = register(addr, &state, "Sender").await;
    let mut receiver = register(addr, &state, "Receiver").await;

    let huge = serde_json::json!({
        "event": "sdp",
        "type": "offer",
        "description": "a".repeat(40 * 1024),
        "sender": "Sender",
        "receiver": "Receiver",
    })
    .to_string();
    sender.send(Message::Text(huge)).await.unwrap();

    assert_silent(&mut receiver).await;
}

#[tokio::test]
async fn test_disconnect_unregisters_identity() {
    let (addr, state) = spawn_gateway().await;
    let mut sender = register(addr, &state, "Sender").await;

    sender.close(None).await.unwrap();
    wait_until(&state, "Sender", false).await;
}

#[tokio::test]
async fn test_health_lists_registrations() {
    let (addr, state) = spawn_gateway().await;
    let _receiver = register(addr, &state, "Receiver").await;

    let response = peerlink_gateway::router(state.clone())
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let report: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(report["registered"], serde_json::json!(["Receiver"]));
}
