// Integration test for the Rusty Gate websocket adapter
// Runs the warp routes in-process and drives them with a real websocket client

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use rusty_gate::config::{EnforcementConfig, FailurePolicy, RoomConfigTable};
use rusty_gate::core::LifecycleSupervisor;
use rusty_gate::events::EventRecorder;
use rusty_gate::handlers::{ws_routes, WsContext};
use rusty_gate::storage::InMemoryCounterStore;
use rusty_gate::{CLOSE_CONNECTION_LIMIT, CLOSE_PAYLOAD_TOO_LARGE};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

// Start the gate on an ephemeral port
fn start_gate(limits: EnforcementConfig, idle_timeout: Duration) -> (SocketAddr, LifecycleSupervisor) {
    let supervisor = LifecycleSupervisor::builder(
        Arc::new(InMemoryCounterStore::new()),
        Arc::new(RoomConfigTable::new(limits).unwrap()),
        Arc::new(EventRecorder::new()),
        FailurePolicy::FailClosed,
    )
    .build();

    let routes = ws_routes(WsContext {
        supervisor: supervisor.clone(),
        idle_timeout,
    });
    let (addr, server) = warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);

    (addr, supervisor)
}

async fn connect(addr: SocketAddr, room: &str, user_id: i64) -> Client {
    let url = format!("ws://{}/ws/{}?user_id={}", addr, room, user_id);
    let (client, _) = connect_async(url).await.expect("Failed to connect");
    client
}

// Next data or close frame, skipping control traffic
async fn next_message(client: &mut Client) -> Message {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("Timed out waiting for a message")
            .expect("Stream ended")
            .expect("WebSocket error");
        match message {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

async fn expect_rejection(client: &mut Client, code: &str, close_code: u16) {
    match next_message(client).await {
        Message::Text(body) => {
            let body: Value = serde_json::from_str(&body).expect("Rejection is not JSON");
            assert_eq!(body["code"], json!(code));
            assert!(body["message"].is_string());
        }
        other => panic!("Expected rejection body, got {:?}", other),
    }

    match next_message(client).await {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), close_code),
        other => panic!("Expected close frame, got {:?}", other),
    }
}

async fn wait_for_idle(supervisor: &LifecycleSupervisor) {
    for _ in 0..100 {
        if supervisor.active_connections().await == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Connections were not released");
}

#[tokio::test]
async fn test_admitted_client_gets_echo() {
    let (addr, supervisor) = start_gate(EnforcementConfig::default(), Duration::from_secs(30));
    let mut client = connect(addr, "lobby", 1).await;

    client.send(Message::Text("hello".to_string())).await.unwrap();
    assert_eq!(next_message(&mut client).await, Message::Text("hello".to_string()));
    assert_eq!(supervisor.active_connections().await, 1);

    client.close(None).await.unwrap();
    wait_for_idle(&supervisor).await;
    assert_eq!(supervisor.gate().rooms().member_count("lobby").await.unwrap(), 0);
}

#[tokio::test]
async fn test_connection_limit_closes_with_4008() {
    let limits = EnforcementConfig {
        conn_per_user: 1,
        ..EnforcementConfig::default()
    };
    let (addr, supervisor) = start_gate(limits, Duration::from_secs(30));

    let mut first = connect(addr, "lobby", 42).await;
    // Round trip so the first admission has completed
    first.send(Message::Text("ping".to_string())).await.unwrap();
    next_message(&mut first).await;

    let mut second = connect(addr, "lobby", 42).await;
    expect_rejection(&mut second, "connection_limit_exceeded", CLOSE_CONNECTION_LIMIT).await;

    first.close(None).await.unwrap();
    wait_for_idle(&supervisor).await;

    let mut third = connect(addr, "lobby", 42).await;
    third.send(Message::Text("back".to_string())).await.unwrap();
    assert_eq!(next_message(&mut third).await, Message::Text("back".to_string()));
}

#[tokio::test]
async fn test_oversized_message_closes_with_4009() {
    let limits = EnforcementConfig {
        max_payload_bytes: 16,
        ..EnforcementConfig::default()
    };
    let (addr, supervisor) = start_gate(limits, Duration::from_secs(30));
    let mut client = connect(addr, "lobby", 9).await;

    client.send(Message::Text("x".repeat(17))).await.unwrap();
    expect_rejection(&mut client, "payload_too_large", CLOSE_PAYLOAD_TOO_LARGE).await;

    wait_for_idle(&supervisor).await;
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let (addr, supervisor) = start_gate(EnforcementConfig::default(), Duration::from_millis(200));
    let mut client = connect(addr, "lobby", 5).await;

    assert!(matches!(next_message(&mut client).await, Message::Close(_)));
    wait_for_idle(&supervisor).await;
}
