use std::{sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use tandem_core::{AwarenessState, ClientMessage, ServerMessage};
use tandem_server::{AppState, app};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_relay() -> (String, Arc<AppState>) {
    let state = Arc::new(AppState::new());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr.to_string(), state)
}

async fn connect(addr: &str) -> Client {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

async fn send(ws: &mut Client, msg: &ClientMessage) {
    let json = serde_json::to_string(msg).unwrap();
    ws.send(Message::Text(json.into())).await.unwrap();
}

async fn recv(ws: &mut Client) -> ServerMessage {
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for relay")
            .expect("stream closed")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn assert_silent(ws: &mut Client) {
    assert!(timeout(Duration::from_millis(150), ws.next()).await.is_err());
}

/// Join and return this connection's relay id and the backlog.
async fn join(ws: &mut Client, room: &str) -> (String, usize, Vec<String>) {
    send(ws, &ClientMessage::Join { room: room.into() }).await;
    match recv(ws).await {
        ServerMessage::Joined {
            peer_id,
            peer_count,
            initial_sync,
            ..
        } => (peer_id, peer_count, initial_sync),
        other => panic!("expected joined, got {other:?}"),
    }
}

#[tokio::test]
async fn test_join_empty_room() {
    let (addr, state) = spawn_relay().await;
    let mut a = connect(&addr).await;

    let (peer_id, peer_count, backlog) = join(&mut a, "board").await;
    assert!(!peer_id.is_empty());
    assert_eq!(peer_count, 1);
    assert!(backlog.is_empty());
    assert_eq!(state.peer_count("board"), 1);
}

#[tokio::test]
async fn test_sync_forwarded_without_echo() {
    let (addr, _state) = spawn_relay().await;
    let mut a = connect(&addr).await;
    let mut b = connect(&addr).await;

    let (a_id, _, _) = join(&mut a, "board").await;
    let (b_id, count, _) = join(&mut b, "board").await;
    assert_eq!(count, 2);
    assert_eq!(
        recv(&mut a).await,
        ServerMessage::PeerJoined {
            peer_id: b_id,
            peer_count: 2
        }
    );

    send(
        &mut a,
        &ClientMessage::Sync {
            data: "AAEC".into(),
            snapshot: false,
        },
    )
    .await;
    assert_eq!(
        recv(&mut b).await,
        ServerMessage::Sync {
            from: a_id,
            data: "AAEC".into()
        }
    );
    assert_silent(&mut a).await;
}

#[tokio::test]
async fn test_awareness_forwarded() {
    let (addr, _state) = spawn_relay().await;
    let mut a = connect(&addr).await;
    let mut b = connect(&addr).await;
    let (a_id, _, _) = join(&mut a, "board").await;
    join(&mut b, "board").await;
    recv(&mut a).await;

    let presence = AwarenessState {
        peer_id: "alice".into(),
        display_name: "Alice".into(),
        is_owner: true,
        ..Default::default()
    };
    send(&mut a, &ClientMessage::Awareness { state: presence.clone() }).await;
    assert_eq!(
        recv(&mut b).await,
        ServerMessage::Awareness {
            from: a_id,
            state: presence
        }
    );
}

#[tokio::test]
async fn test_backlog_replayed_to_joiner() {
    let (addr, _state) = spawn_relay().await;
    let mut a = connect(&addr).await;
    join(&mut a, "board").await;

    for (data, snapshot) in [("old", false), ("snap", true), ("u1", false), ("u2", false)] {
        send(
            &mut a,
            &ClientMessage::Sync {
                data: data.into(),
                snapshot,
            },
        )
        .await;
    }
    // Round trip so the relay has processed every frame
    a.send(Message::Text("not json".into())).await.unwrap();
    assert!(matches!(recv(&mut a).await, ServerMessage::Error { .. }));

    let mut c = connect(&addr).await;
    let (_, _, backlog) = join(&mut c, "board").await;
    assert_eq!(backlog, ["snap", "u1", "u2"]);
}

#[tokio::test]
async fn test_rooms_are_isolated() {
    let (addr, _state) = spawn_relay().await;
    let mut a = connect(&addr).await;
    let mut b = connect(&addr).await;
    join(&mut a, "one").await;
    join(&mut b, "two").await;

    send(
        &mut a,
        &ClientMessage::Sync {
            data: "x".into(),
            snapshot: false,
        },
    )
    .await;
    assert_silent(&mut b).await;
}

#[tokio::test]
async fn test_malformed_frame_gets_error() {
    let (addr, _state) = spawn_relay().await;
    let mut a = connect(&addr).await;
    a.send(Message::Text("{\"type\":\"bogus\"}".into())).await.unwrap();
    assert!(matches!(recv(&mut a).await, ServerMessage::Error { .. }));

    // Connection stays usable
    let (_, count, _) = join(&mut a, "board").await;
    assert_eq!(count, 1);
}

#[tokio::test]
async fn test_disconnect_notifies_and_closes_empty_room() {
    let (addr, state) = spawn_relay().await;
    let mut a = connect(&addr).await;
    let mut b = connect(&addr).await;
    join(&mut a, "board").await;
    let (b_id, _, _) = join(&mut b, "board").await;
    recv(&mut a).await;

    b.close(None).await.unwrap();
    assert_eq!(
        recv(&mut a).await,
        ServerMessage::PeerLeft {
            peer_id: b_id,
            peer_count: 1
        }
    );

    send(&mut a, &ClientMessage::Leave).await;
    for _ in 0..50 {
        if state.room_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.room_count(), 0);
}

#[tokio::test]
async fn test_health() {
    let (addr, _state) = spawn_relay().await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("ok"));
}
