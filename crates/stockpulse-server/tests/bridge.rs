//! End-to-end tests: HTTP writes go through the store, out on the change
//! channel, through the listener and broadcaster, and reach real WebSocket
//! clients.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use stockpulse_notify::ChannelHub;
use stockpulse_server::{ServerConfig, ServerHandle};
use stockpulse_store::{Database, InventoryRepo};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct TestServer {
    hub: ChannelHub,
    handle: ServerHandle,
    http: reqwest::Client,
}

impl TestServer {
    async fn boot() -> Self {
        let hub = ChannelHub::new();
        let db = Database::in_memory().unwrap();
        let config = ServerConfig {
            port: 0,
            reconnect_base_delay_ms: 10,
            reconnect_max_delay_ms: 50,
            shutdown_timeout_secs: 1,
            ..Default::default()
        };
        let repo = Arc::new(InventoryRepo::new(db, Arc::new(hub.clone()), config.channel.clone()));
        let handle = stockpulse_server::start(config, repo, Arc::new(hub.clone()))
            .await
            .unwrap();
        Self {
            hub,
            handle,
            http: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.handle.port, path)
    }

    async fn subscribe(&self) -> WsStream {
        let before = self.handle.broadcaster().count();
        let (ws, _) = connect_async(format!("ws://127.0.0.1:{}/ws", self.handle.port))
            .await
            .unwrap();
        self.wait_for_subscribers(before + 1).await;
        ws
    }

    async fn wait_for_subscribers(&self, n: usize) {
        for _ in 0..400 {
            if self.handle.broadcaster().count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} subscribers, have {}", self.handle.broadcaster().count());
    }

    async fn health(&self) -> Value {
        self.http.get(self.url("/health")).send().await.unwrap().json().await.unwrap()
    }

    async fn create(&self, name: &str, quantity: i64) -> Value {
        let resp = self
            .http
            .post(self.url("/inventory"))
            .json(&json!({"name": name, "quantity": quantity}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 201);
        resp.json().await.unwrap()
    }

    async fn set_quantity(&self, id: i64, quantity: i64) -> reqwest::Response {
        self.http
            .put(self.url(&format!("/inventory/{id}")))
            .json(&json!({"quantity": quantity}))
            .send()
            .await
            .unwrap()
    }
}

/// Read the next text message as JSON.
async fn read_json(ws: &mut WsStream) -> Value {
    loop {
        let msg = timeout(TIMEOUT, ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream closed")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

/// Pick the fields the scenario cares about.
fn summary(msg: &Value) -> Value {
    json!({"op": msg["op"], "id": msg["id"], "quantity": msg["quantity"]})
}

#[tokio::test]
async fn health_reports_listener_and_subscribers() {
    let server = TestServer::boot().await;
    let body = server.health().await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["subscribers"], 0);
    assert_eq!(body["listener"], "listening");

    let _ws = server.subscribe().await;
    assert_eq!(server.health().await["subscribers"], 1);

    server.handle.shutdown().await;
}

#[tokio::test]
async fn crud_changes_reach_subscriber_in_order() {
    let server = TestServer::boot().await;
    let mut ws = server.subscribe().await;

    let created = server.create("Widget", 5).await;
    let id = created["id"].as_i64().unwrap();
    assert_eq!(server.set_quantity(id, 2).await.status(), 200);
    let resp = server
        .http
        .delete(server.url(&format!("/inventory/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let insert = read_json(&mut ws).await;
    assert_eq!(insert["op"], "insert");
    assert_eq!(insert["name"], "Widget");
    assert_eq!(insert["quantity"], 5);
    assert!(insert["updated_at"].is_string());

    assert_eq!(summary(&read_json(&mut ws).await), json!({"op": "update", "id": id, "quantity": 2}));
    assert_eq!(summary(&read_json(&mut ws).await), json!({"op": "delete", "id": id, "quantity": 2}));

    server.handle.shutdown().await;
}

#[tokio::test]
async fn disconnected_subscriber_stops_receiving() {
    let server = TestServer::boot().await;
    let created = server.create("Widget", 5).await;
    let id = created["id"].as_i64().unwrap();

    let mut a = server.subscribe().await;
    let mut b = server.subscribe().await;

    server.set_quantity(id, 3).await;
    let expected = json!({"op": "update", "id": id, "quantity": 3});
    assert_eq!(summary(&read_json(&mut a).await), expected);
    assert_eq!(summary(&read_json(&mut b).await), expected);

    a.close(None).await.unwrap();
    server.wait_for_subscribers(1).await;

    server.set_quantity(id, 4).await;
    assert_eq!(
        summary(&read_json(&mut b).await),
        json!({"op": "update", "id": id, "quantity": 4})
    );

    server.handle.shutdown().await;
}

#[tokio::test]
async fn upstream_drop_recovers() {
    let server = TestServer::boot().await;
    let created = server.create("Gadget", 10).await;
    let id = created["id"].as_i64().unwrap();
    let mut ws = server.subscribe().await;

    server.set_quantity(id, 9).await;
    server.set_quantity(id, 8).await;
    assert_eq!(read_json(&mut ws).await["quantity"], 9);
    assert_eq!(read_json(&mut ws).await["quantity"], 8);

    server.hub.drop_connections();
    for _ in 0..400 {
        if server.hub.listener_count("inventory_channel") == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(server.hub.listener_count("inventory_channel"), 1);

    server.set_quantity(id, 7).await;
    assert_eq!(read_json(&mut ws).await["quantity"], 7);

    server.handle.shutdown().await;
}

#[tokio::test]
async fn invalid_requests_map_to_status_codes() {
    let server = TestServer::boot().await;

    let missing = server.http.get(server.url("/inventory/999")).send().await.unwrap();
    assert_eq!(missing.status(), 404);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["error"]["code"], "NOT_FOUND");

    let created = server.create("Widget", 5).await;
    let id = created["id"].as_i64().unwrap();
    assert_eq!(server.set_quantity(id, -1).await.status(), 400);
    assert_eq!(server.set_quantity(999, 1).await.status(), 404);

    let empty_name = server
        .http
        .post(server.url("/inventory"))
        .json(&json!({"name": "  ", "quantity": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(empty_name.status(), 400);

    let listed: Value = server
        .http
        .get(server.url("/inventory"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);

    server.handle.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_subscribers() {
    let server = TestServer::boot().await;
    let mut ws = server.subscribe().await;
    let hub = server.hub.clone();

    server.handle.shutdown().await;
    assert_eq!(hub.connection_count(), 0);

    // The socket ends with a close frame or an error, never another event.
    let next = timeout(TIMEOUT, ws.next()).await.expect("socket stayed open");
    match next {
        None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {}
        Some(Ok(other)) => panic!("unexpected message after shutdown: {other:?}"),
    }
    let _ = ws.send(Message::Close(None)).await;
}
