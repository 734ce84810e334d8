//! Multi-instance behaviour: several relay instances wired to one in-memory
//! broker, driven either through room sessions or through real websockets.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::Message;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite, MaybeTlsStream, WebSocketStream};
use transport_bus::{LocalBus, LocalBusClient};

use crate::connection::test_support::handle;
use crate::protocol::ServerMessage;
use crate::session::RoomSession;
use crate::websocket::{router, AppState};

type Instance = Arc<AppState<LocalBusClient>>;
type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

fn instance(hub: &LocalBus) -> Instance {
    let (client, inbox) = hub.connect();
    let state = Arc::new(AppState::new(Arc::new(client), 32, None));
    tokio::spawn(Arc::clone(&state.bridge).run_inbound(inbox));
    state
}

fn session(instance: &Instance) -> (RoomSession<LocalBusClient>, mpsc::Receiver<Message>) {
    let (conn, rx) = handle(32);
    instance.heartbeat.track(conn.clone());
    (
        RoomSession::new(conn, instance.registry.clone(), Arc::clone(&instance.bridge)),
        rx,
    )
}

async fn next_message(rx: &mut mpsc::Receiver<Message>) -> ServerMessage {
    loop {
        match rx.recv().await.expect("connection channel open") {
            Message::Text(text) => return serde_json::from_str(&text).expect("server message"),
            _ => continue,
        }
    }
}

async fn next_chat(rx: &mut mpsc::Receiver<Message>) -> (String, String) {
    loop {
        if let ServerMessage::Chat { room, text, .. } = next_message(rx).await {
            return (room, text);
        }
    }
}

#[test_timeout::tokio_timeout_test(10)]
async fn joiner_sees_ack_before_any_broadcast() {
    let hub = LocalBus::new();
    let first = instance(&hub);
    let second = instance(&hub);
    let (mut watcher, mut watcher_rx) = session(&second);
    watcher.handle_frame(r#"{"type":"join","room":"lobby"}"#).await;
    assert_eq!(
        next_message(&mut watcher_rx).await,
        ServerMessage::joined_ack("lobby")
    );

    let (mut joiner, mut joiner_rx) = session(&first);
    joiner.handle_frame(r#"{"type":"join","room":"lobby"}"#).await;

    assert_eq!(
        next_message(&mut joiner_rx).await,
        ServerMessage::joined_ack("lobby")
    );
    match next_message(&mut joiner_rx).await {
        ServerMessage::System { room, text, ts } => {
            assert_eq!(room.as_deref(), Some("lobby"));
            assert_eq!(text, "A user joined room lobby");
            assert!(ts.is_some());
        }
        other => panic!("expected joined broadcast, got {other:?}"),
    }

    // The watcher sees its own broadcast, then the joiner's.
    assert!(matches!(
        next_message(&mut watcher_rx).await,
        ServerMessage::System { .. }
    ));
    assert!(matches!(
        next_message(&mut watcher_rx).await,
        ServerMessage::System { text, .. } if text == "A user joined room lobby"
    ));
}

#[test_timeout::tokio_timeout_test(10)]
async fn chat_fans_out_across_instances_including_sender() {
    let hub = LocalBus::new();
    let first = instance(&hub);
    let second = instance(&hub);

    let (mut alice, mut alice_rx) = session(&first);
    let (mut bob, mut bob_rx) = session(&second);
    alice.handle_frame(r#"{"type":"join","room":"lobby"}"#).await;
    bob.handle_frame(r#"{"type":"join","room":"lobby"}"#).await;
    assert_eq!(first.registry.members_of("lobby").len(), 1);
    assert_eq!(second.registry.members_of("lobby").len(), 1);

    alice.handle_frame(r#"{"type":"chat","text":"hi"}"#).await;

    assert_eq!(next_chat(&mut alice_rx).await, ("lobby".into(), "hi".into()));
    assert_eq!(next_chat(&mut bob_rx).await, ("lobby".into(), "hi".into()));
}

#[test_timeout::tokio_timeout_test(10)]
async fn rooms_do_not_leak_into_each_other() {
    let hub = LocalBus::new();
    let first = instance(&hub);
    let second = instance(&hub);

    let (mut alice, mut alice_rx) = session(&first);
    let (mut bob, mut bob_rx) = session(&second);
    alice.handle_frame(r#"{"type":"join","room":"north"}"#).await;
    bob.handle_frame(r#"{"type":"join","room":"south"}"#).await;

    alice.handle_frame(r#"{"type":"chat","text":"north only"}"#).await;
    bob.handle_frame(r#"{"type":"chat","text":"south only"}"#).await;

    assert_eq!(
        next_chat(&mut alice_rx).await,
        ("north".into(), "north only".into())
    );
    assert_eq!(
        next_chat(&mut bob_rx).await,
        ("south".into(), "south only".into())
    );
}

#[test_timeout::tokio_timeout_test(10)]
async fn emptied_room_is_dropped_but_stays_subscribed() {
    let hub = LocalBus::new();
    let first = instance(&hub);
    let (mut alice, _alice_rx) = session(&first);
    let (mut bob, _bob_rx) = session(&first);

    alice.handle_frame(r#"{"type":"join","room":"lobby"}"#).await;
    bob.handle_frame(r#"{"type":"join","room":"lobby"}"#).await;
    alice.handle_frame(r#"{"type":"leave"}"#).await;
    assert_eq!(first.registry.members_of("lobby").len(), 1);
    bob.disconnect().await;

    assert!(first.registry.members_of("lobby").is_empty());
    assert_eq!(first.registry.room_count(), 0);
    assert!(first.bridge.is_subscribed("lobby"));
    assert_eq!(hub.route_count("room:lobby"), 1);
}

#[test_timeout::tokio_timeout_test(10)]
async fn concurrent_joins_subscribe_once_and_deliver_once() {
    let hub = LocalBus::new();
    let first = instance(&hub);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let (mut member, rx) = session(&first);
        tasks.push(tokio::spawn(async move {
            member.handle_frame(r#"{"type":"join","room":"busy"}"#).await;
            (member, rx)
        }));
    }
    let mut members = Vec::new();
    for task in tasks {
        members.push(task.await.expect("join task"));
    }
    assert_eq!(hub.route_count("room:busy"), 1);
    assert_eq!(first.bridge.subscription_count(), 1);
    assert_eq!(first.registry.members_of("busy").len(), 8);

    let (speaker, _) = members.first_mut().expect("at least one member");
    speaker.handle_frame(r#"{"type":"chat","text":"once"}"#).await;

    for (_, rx) in members.iter_mut() {
        assert_eq!(next_chat(rx).await, ("busy".into(), "once".into()));
    }
    // A trailing marker proves no duplicate chat was queued ahead of it.
    let (speaker, _) = members.first_mut().expect("at least one member");
    speaker.handle_frame(r#"{"type":"chat","text":"marker"}"#).await;
    for (_, rx) in members.iter_mut() {
        assert_eq!(next_chat(rx).await, ("busy".into(), "marker".into()));
    }
}

async fn serve(hub: &LocalBus) -> (SocketAddr, Instance) {
    let state = instance(hub);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let app = router(Arc::clone(&state));
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    (addr, state)
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _) = connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("websocket connect");
    client
}

async fn send(client: &mut Client, frame: Value) {
    client
        .send(tungstenite::Message::Text(frame.to_string()))
        .await
        .expect("send frame");
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        match client.next().await.expect("stream open").expect("frame") {
            tungstenite::Message::Text(text) => return serde_json::from_str(&text).expect("json"),
            _ => continue,
        }
    }
}

async fn next_json_of(client: &mut Client, kind: &str) -> Value {
    loop {
        let value = next_json(client).await;
        if value["type"] == kind {
            return value;
        }
    }
}

#[test_timeout::tokio_timeout_test(20)]
async fn websocket_clients_on_two_instances_chat() {
    let hub = LocalBus::new();
    let (first_addr, _first) = serve(&hub).await;
    let (second_addr, _second) = serve(&hub).await;

    let mut x = connect(first_addr).await;
    send(&mut x, json!({"type": "join", "room": "lobby"})).await;
    assert_eq!(
        next_json(&mut x).await,
        json!({"type": "system", "text": "Joined room lobby"})
    );

    let mut y = connect(second_addr).await;
    send(&mut y, json!({"type": "join", "room": "lobby"})).await;
    assert_eq!(
        next_json(&mut y).await,
        json!({"type": "system", "text": "Joined room lobby"})
    );

    send(&mut x, json!({"type": "chat", "text": "hi"})).await;
    for client in [&mut x, &mut y] {
        let chat = next_json_of(client, "chat").await;
        assert_eq!(chat["room"], "lobby");
        assert_eq!(chat["text"], "hi");
        assert!(chat["ts"].is_u64());
    }
}

#[test_timeout::tokio_timeout_test(20)]
async fn websocket_protocol_errors_keep_connection_usable() {
    let hub = LocalBus::new();
    let (addr, _state) = serve(&hub).await;
    let mut client = connect(addr).await;

    client
        .send(tungstenite::Message::Text("{broken".into()))
        .await
        .expect("send");
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "error", "error": "Invalid JSON"})
    );

    send(&mut client, json!({"type": "wave"})).await;
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "error", "error": "Unknown message type"})
    );

    send(&mut client, json!({"type": "chat", "text": "early"})).await;
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "error", "error": "Join a room first"})
    );

    client
        .send(tungstenite::Message::Binary(
            br#"{"type":"join","roomId":"dock"}"#.to_vec(),
        ))
        .await
        .expect("send");
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "system", "text": "Joined room dock"})
    );
}

#[test_timeout::tokio_timeout_test(20)]
async fn closing_a_socket_announces_departure() {
    let hub = LocalBus::new();
    let (first_addr, first) = serve(&hub).await;
    let (second_addr, _second) = serve(&hub).await;

    let mut leaver = connect(first_addr).await;
    send(&mut leaver, json!({"type": "join", "room": "lobby"})).await;
    next_json(&mut leaver).await;

    let mut stayer = connect(second_addr).await;
    send(&mut stayer, json!({"type": "join", "room": "lobby"})).await;
    next_json(&mut stayer).await;

    leaver.close(None).await.expect("close");
    drop(leaver);

    loop {
        let notice = next_json_of(&mut stayer, "system").await;
        if notice["text"] == "A user left room lobby" {
            assert_eq!(notice["room"], "lobby");
            break;
        }
    }
    assert_eq!(first.registry.room_count(), 0);
}

#[test_timeout::tokio_timeout_test(20)]
async fn unresponsive_socket_is_reclaimed_by_heartbeat() {
    let hub = LocalBus::new();
    let (first_addr, first) = serve(&hub).await;
    let (second_addr, _second) = serve(&hub).await;

    let mut silent = connect(first_addr).await;
    send(&mut silent, json!({"type": "join", "room": "lobby"})).await;
    next_json(&mut silent).await;

    let mut watcher = connect(second_addr).await;
    send(&mut watcher, json!({"type": "join", "room": "lobby"})).await;
    next_json(&mut watcher).await;

    // `silent` is never polled again, so the probe goes unanswered.
    let probe = first.heartbeat.sweep();
    assert_eq!(probe.probed, 1);
    assert_eq!(probe.terminated, 0);
    let reclaim = first.heartbeat.sweep();
    assert_eq!(reclaim.terminated, 1);

    loop {
        let notice = next_json_of(&mut watcher, "system").await;
        if notice["text"] == "A user left room lobby" {
            break;
        }
    }
    assert_eq!(first.registry.room_count(), 0);
    drop(silent);
}
