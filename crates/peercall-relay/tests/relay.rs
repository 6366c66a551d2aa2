//! Relay routing over real WebSocket connections
//!
//! Run with: cargo test -p peercall-relay --test relay

use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: std::net::SocketAddr,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    async fn start() -> Self {
        let config = peercall_relay::state::Config {
            bind_address: "127.0.0.1:0".to_string(),
        };
        let router = peercall_relay::create_app(config);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .ok();
        });

        Self {
            addr,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    async fn connect(&self) -> Client {
        let (ws, _) = connect_async(self.ws_url()).await.unwrap();
        ws
    }

    /// Connect and register as `identity`
    async fn join(&self, identity: &str) -> Client {
        let mut ws = self.connect().await;
        send(&mut ws, &format!(r#"{{"type":"register","from":"{}"}}"#, identity)).await;
        self.wait_for_registration(identity).await;
        ws
    }

    async fn health(&self) -> serde_json::Value {
        reqwest::get(format!("{}/health", self.http_url()))
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn wait_for_connections(&self, count: u64) {
        for _ in 0..50 {
            if self.health().await["connections"] == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {} connections", count);
    }

    async fn wait_for_registration(&self, identity: &str) {
        for _ in 0..50 {
            let health = self.health().await;
            let registered = health["registered"].as_array().unwrap();
            if registered.iter().any(|id| id == identity) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("{} never registered", identity);
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn send(ws: &mut Client, text: &str) {
    ws.send(Message::Text(text.into())).await.unwrap();
}

async fn recv_text(ws: &mut Client) -> String {
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection ended")
            .unwrap();
        if let Message::Text(text) = frame {
            return text.as_str().to_string();
        }
    }
}

async fn assert_silent(ws: &mut Client) {
    let result = timeout(Duration::from_millis(200), ws.next()).await;
    assert!(result.is_err(), "unexpected message: {:?}", result);
}

#[tokio::test]
async fn test_directed_message_reaches_only_recipient() {
    let server = TestServer::start().await;
    let mut alice = server.join("alice").await;
    let mut bob = server.join("bob").await;
    let mut carol = server.join("carol").await;

    let offer = r#"{"type":"sdp","from":"alice","to":"bob","sdp":{"type":"offer","sdp":"v=0"}}"#;
    send(&mut alice, offer).await;

    assert_eq!(recv_text(&mut bob).await, offer);
    assert_silent(&mut carol).await;
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_unknown_recipient_is_broadcast() {
    let server = TestServer::start().await;
    let mut alice = server.join("alice").await;
    let mut bob = server.join("bob").await;
    let mut anonymous = server.connect().await;
    server.wait_for_connections(3).await;

    let candidate = r#"{"type":"candidate","from":"alice","to":"dave","candidate":"c","sdpMid":"0"}"#;
    send(&mut alice, candidate).await;

    assert_eq!(recv_text(&mut bob).await, candidate);
    assert_eq!(recv_text(&mut anonymous).await, candidate);
    assert_silent(&mut alice).await;
}

#[tokio::test]
async fn test_invalid_json_and_register_are_not_forwarded() {
    let server = TestServer::start().await;
    let mut alice = server.join("alice").await;
    let mut bob = server.join("bob").await;

    send(&mut alice, "not json at all").await;
    send(&mut alice, r#"{"type":"register","from":"alice"}"#).await;
    assert_silent(&mut bob).await;

    // The connection survives bad input
    let offer = r#"{"type":"sdp","from":"alice","to":"bob","sdp":{"type":"offer","sdp":"v=0"}}"#;
    send(&mut alice, offer).await;
    assert_eq!(recv_text(&mut bob).await, offer);
}

#[tokio::test]
async fn test_register_without_identity_is_broadcast() {
    let server = TestServer::start().await;
    let mut bob = server.join("bob").await;
    let mut anonymous = server.connect().await;
    server.wait_for_connections(2).await;

    let register = r#"{"type":"register"}"#;
    send(&mut anonymous, register).await;

    assert_eq!(recv_text(&mut bob).await, register);
    assert_silent(&mut anonymous).await;
    assert_eq!(server.health().await["registered"], serde_json::json!(["bob"]));
}

#[tokio::test]
async fn test_close_unregisters_identity() {
    let server = TestServer::start().await;
    let mut alice = server.join("alice").await;
    let _bob = server.join("bob").await;

    alice.close(None).await.unwrap();

    for _ in 0..50 {
        let health = server.health().await;
        if health["registered"] == serde_json::json!(["bob"]) {
            assert_eq!(health["connections"], 1);
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("alice still registered after closing");
}

#[tokio::test]
async fn test_health_reports_status() {
    let server = TestServer::start().await;
    let health = server.health().await;

    assert_eq!(health["status"], "ok");
    assert_eq!(health["connections"], 0);
    assert_eq!(health["registered"], serde_json::json!([]));
}
