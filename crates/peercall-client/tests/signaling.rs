//! Signaling channel against a local WebSocket server

use futures_util::{SinkExt, StreamExt};
use peercall_client::{SignalingChannel, SignalingEvent};
use peercall_protocol::{PeerId, SessionDescription, SignalingMessage};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};

struct TestRelay {
    listener: TcpListener,
}

impl TestRelay {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener }
    }

    fn url(&self) -> String {
        format!("ws://{}", self.listener.local_addr().unwrap())
    }

    async fn accept(&self) -> WebSocketStream<TcpStream> {
        let (stream, _) = self.listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    }
}

async fn next_message(ws: &mut WebSocketStream<TcpStream>) -> SignalingMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn next_event(rx: &mut tokio::sync::mpsc::UnboundedReceiver<SignalingEvent>) -> SignalingEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_register_is_first_message() {
    let relay = TestRelay::start().await;
    let url = relay.url();

    let (connected, mut server) = tokio::join!(SignalingChannel::connect(&url, "alice".into()), relay.accept());
    let (channel, _events) = connected.unwrap();

    channel
        .send_sdp(&"bob".into(), SessionDescription::offer("v=0"))
        .unwrap();

    assert_eq!(
        next_message(&mut server).await,
        SignalingMessage::register("alice".into())
    );
    assert_eq!(
        next_message(&mut server).await,
        SignalingMessage::sdp("alice".into(), "bob".into(), SessionDescription::offer("v=0"))
    );
}

#[tokio::test]
async fn test_inbound_messages_are_filtered_by_recipient() {
    let relay = TestRelay::start().await;
    let url = relay.url();

    let (connected, mut server) = tokio::join!(SignalingChannel::connect(&url, "bob".into()), relay.accept());
    let (_channel, mut events) = connected.unwrap();
    next_message(&mut server).await;

    for text in [
        r#"{"type":"sdp","from":"alice","to":"carol","sdp":{"type":"offer","sdp":"for carol"}}"#,
        "definitely not json",
        r#"{"type":"candidate","from":"alice","to":"bob","candidate":"c1","sdpMid":"0"}"#,
    ] {
        server.send(Message::Text(text.into())).await.unwrap();
    }

    assert_eq!(
        next_event(&mut events).await,
        SignalingEvent::IceCandidateReceived {
            from: PeerId::from("alice"),
            candidate: "c1".to_string(),
            sdp_mid: "0".to_string(),
        }
    );
}

#[tokio::test]
async fn test_connection_loss_is_reported() {
    let relay = TestRelay::start().await;
    let url = relay.url();

    let (connected, mut server) = tokio::join!(SignalingChannel::connect(&url, "alice".into()), relay.accept());
    let (_channel, mut events) = connected.unwrap();
    next_message(&mut server).await;

    server.close(None).await.unwrap();
    drop(server);

    assert_eq!(next_event(&mut events).await, SignalingEvent::Disconnected);
}

#[tokio::test]
async fn test_connect_to_missing_relay_fails() {
    let relay = TestRelay::start().await;
    let url = relay.url();
    drop(relay);

    assert!(SignalingChannel::connect(&url, "alice".into()).await.is_err());
}
