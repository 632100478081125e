//! Integration tests for the relay server.
//!
//! These tests run a real `RelayServer` on an ephemeral port and drive it with
//! WebSocket clients, covering targeted delivery, routing misses, peers that
//! vanish mid-flight, and the decode policy.
//!
//! Tests CAN use `.unwrap()` and `.expect()` - this is allowed.
//! We test the panic-free behavior of production code through assertions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use relayd::config::RelayConfig;
use relayd::registry::Registry;
use relayd::server::RelayServer;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// Longest a client waits for an expected frame
const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// How long a client listens to confirm that nothing arrives
const SILENCE_WINDOW: Duration = Duration::from_millis(200);

/// Longest to wait for the registry to reach an expected size
const REGISTRY_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Interval between registry size checks
const REGISTRY_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Test Helpers
// ============================================================================

/// Test server context that manages server lifecycle.
struct TestServer {
    addr: SocketAddr,
    registry: Arc<Registry>,
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl TestServer {
    /// Spawns a server on 127.0.0.1 with an ephemeral port.
    async fn spawn() -> Self {
        Self::spawn_with_config(RelayConfig::default()).await
    }

    async fn spawn_with_config(config: RelayConfig) -> Self {
        let cancel_token = CancellationToken::new();
        let server = RelayServer::new(config, cancel_token.clone());
        let registry = server.registry();

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind ephemeral port");
        let addr = listener.local_addr().expect("local addr");

        let task = tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        Self {
            addr,
            registry,
            cancel_token,
            task,
        }
    }

    /// Opens a WebSocket connection and waits until it is registered.
    async fn connect(&self, role: &str, cid: &str) -> TestClient {
        let before = self.registry.len().await;
        let url = format!("ws://{}/ws?role={role}&cid={cid}", self.addr);
        let (stream, _response) = connect_async(url).await.expect("websocket connect");
        self.wait_for_connections(before + 1).await;
        TestClient { stream }
    }

    /// Polls the registry until it holds exactly `expected` connections.
    async fn wait_for_connections(&self, expected: usize) {
        let start = tokio::time::Instant::now();
        while start.elapsed() < REGISTRY_WAIT_TIMEOUT {
            if self.registry.len().await == expected {
                return;
            }
            sleep(REGISTRY_POLL_INTERVAL).await;
        }
        panic!(
            "registry did not reach {expected} connections (has {})",
            self.registry.len().await
        );
    }

    /// Sends a raw HTTP/1.1 GET and returns the whole response.
    async fn http_get(&self, path: &str) -> String {
        let mut stream = TcpStream::connect(self.addr).await.expect("tcp connect");
        let request = format!(
            "GET {path} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            self.addr
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    /// Cancels the server and waits for it to stop.
    async fn shutdown(self) {
        self.cancel_token.cancel();
        timeout(Duration::from_secs(5), self.task)
            .await
            .expect("server stops after cancel")
            .unwrap();
    }
}

/// WebSocket client with frame helpers.
struct TestClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    async fn send_text(&mut self, frame: &str) {
        self.stream.send(Message::text(frame.to_string())).await.unwrap();
    }

    async fn send_stamp(&mut self, guid: &str, prize_id: i64) {
        let frame = serde_json::json!({
            "event": "SEND_STAMP_TO_CUSTOMER_NOTIFY",
            "data": {
                "guid": guid,
                "uid": "staff-1",
                "desc": "stamp card",
                "prize_id": prize_id,
                "item_name": "coffee",
                "exchange_num": 1,
                "spend_stamp_num": 10,
                "remain_stamp_num": 2
            }
        });
        self.send_text(&frame.to_string()).await;
    }

    async fn send_success(&mut self, uid: &str, message: &str) {
        let frame = serde_json::json!({
            "event": "SEND_STAMP_SUCCESS_NOTIFY",
            "data": { "uid": uid, "code": 200, "message": message }
        });
        self.send_text(&frame.to_string()).await;
    }

    /// Receives the next text frame as JSON, skipping control frames.
    async fn recv_json(&mut self) -> Value {
        loop {
            let next = timeout(RECV_TIMEOUT, self.stream.next())
                .await
                .expect("frame within timeout")
                .expect("stream open")
                .expect("frame read");
            match next {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("Expected text frame, got {other:?}"),
            }
        }
    }

    /// Returns true if no data frame arrives within the silence window.
    async fn is_silent(&mut self) -> bool {
        loop {
            match timeout(SILENCE_WINDOW, self.stream.next()).await {
                Err(_) => return true,
                Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => continue,
                Ok(_) => return false,
            }
        }
    }

    /// Returns true once the server has closed the connection.
    async fn is_closed_by_server(&mut self) -> bool {
        loop {
            match timeout(RECV_TIMEOUT, self.stream.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => continue,
            }
        }
    }
}

// ============================================================================
// Targeted Delivery
// ============================================================================

#[tokio::test]
async fn test_event_reaches_only_matching_client() {
    let server = TestServer::spawn().await;
    let mut customer_a = server.connect("customer", "u1").await;
    let mut customer_b = server.connect("customer", "u2").await;
    let mut staff = server.connect("staff", "staff-1").await;

    staff.send_stamp("u1", 7).await;

    let frame = customer_a.recv_json().await;
    assert_eq!(frame["event"], "SEND_STAMP_TO_CUSTOMER_NOTIFY");
    assert_eq!(frame["data"]["guid"], "u1");
    assert_eq!(frame["data"]["prize_id"], 7);
    assert_eq!(frame["data"]["item_name"], "coffee");
    assert_eq!(frame["data"]["remain_stamp_num"], 2);

    assert!(customer_b.is_silent().await);
    assert!(staff.is_silent().await);

    server.shutdown().await;
}

#[tokio::test]
async fn test_every_connection_sharing_a_cid_receives() {
    let server = TestServer::spawn().await;
    let mut tab_one = server.connect("customer", "u1").await;
    let mut tab_two = server.connect("customer", "u1").await;
    let mut staff = server.connect("staff", "staff-1").await;

    staff.send_success("u1", "stamped").await;

    for client in [&mut tab_one, &mut tab_two] {
        let frame = client.recv_json().await;
        assert_eq!(frame["event"], "SEND_STAMP_SUCCESS_NOTIFY");
        assert_eq!(frame["data"]["uid"], "u1");
        assert_eq!(frame["data"]["code"], 200);
        assert_eq!(frame["data"]["message"], "stamped");
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_sender_can_target_itself() {
    let server = TestServer::spawn().await;
    let mut client = server.connect("customer", "u1").await;

    client.send_success("u1", "self").await;

    let frame = client.recv_json().await;
    assert_eq!(frame["data"]["message"], "self");

    server.shutdown().await;
}

#[tokio::test]
async fn test_missing_fields_are_zero_filled() {
    let server = TestServer::spawn().await;
    let mut customer = server.connect("customer", "u1").await;
    let mut staff = server.connect("staff", "staff-1").await;

    staff
        .send_text(r#"{"event":"SEND_STAMP_TO_CUSTOMER_NOTIFY","data":{"guid":"u1","prize_id":"seven"}}"#)
        .await;

    let frame = customer.recv_json().await;
    let data = &frame["data"];
    assert_eq!(data["guid"], "u1");
    assert_eq!(data["prize_id"], 0);
    assert_eq!(data["uid"], "");
    assert_eq!(data["item_name"], "");
    assert_eq!(data["exchange_num"], 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_events_from_one_sender_arrive_in_order() {
    let server = TestServer::spawn().await;
    let mut customer = server.connect("customer", "u1").await;
    let mut staff = server.connect("staff", "staff-1").await;

    for i in 0..20 {
        staff.send_success("u1", &format!("msg-{i}")).await;
    }

    for i in 0..20 {
        let frame = customer.recv_json().await;
        assert_eq!(frame["data"]["message"], format!("msg-{i}"));
    }

    server.shutdown().await;
}

// ============================================================================
// Routing Misses and Disconnects
// ============================================================================

#[tokio::test]
async fn test_unmatched_event_is_dropped_and_server_continues() {
    let server = TestServer::spawn().await;
    let mut customer = server.connect("customer", "u1").await;
    let mut staff = server.connect("staff", "staff-1").await;

    staff.send_stamp("nobody", 1).await;
    assert!(customer.is_silent().await);

    // Nothing was queued for a late joiner either
    let mut late = server.connect("customer", "nobody").await;
    assert!(late.is_silent().await);

    staff.send_stamp("u1", 2).await;
    let frame = customer.recv_json().await;
    assert_eq!(frame["data"]["prize_id"], 2);

    assert_eq!(server.registry.len().await, 3);
    server.shutdown().await;
}

#[tokio::test]
async fn test_client_disconnect_mid_flight() {
    let server = TestServer::spawn().await;
    let leaving = server.connect("customer", "u1").await;
    let mut staying = server.connect("customer", "u1").await;
    let mut staff = server.connect("staff", "staff-1").await;

    drop(leaving);
    staff.send_stamp("u1", 3).await;

    let frame = staying.recv_json().await;
    assert_eq!(frame["data"]["prize_id"], 3);

    // The vanished peer is removed by its ingress loop or by a failed write
    server.wait_for_connections(2).await;

    staff.send_stamp("u1", 4).await;
    let frame = staying.recv_json().await;
    assert_eq!(frame["data"]["prize_id"], 4);

    server.shutdown().await;
}

#[tokio::test]
async fn test_graceful_client_close_unregisters() {
    let server = TestServer::spawn().await;
    let mut client = server.connect("customer", "u1").await;
    assert_eq!(server.registry.count_matching("u1").await, 1);

    client.stream.close(None).await.unwrap();

    server.wait_for_connections(0).await;
    assert_eq!(server.registry.count_matching("u1").await, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_connection_without_cid_receives_nothing() {
    let server = TestServer::spawn().await;
    let mut anonymous = server.connect("viewer", "").await;
    let mut staff = server.connect("staff", "staff-1").await;

    staff.send_stamp("", 1).await;
    assert!(anonymous.is_silent().await);

    server.shutdown().await;
}

// ============================================================================
// Decode Policy
// ============================================================================

#[tokio::test]
async fn test_unknown_event_keeps_connection_open() {
    let server = TestServer::spawn().await;
    let mut customer = server.connect("customer", "u1").await;
    let mut staff = server.connect("staff", "staff-1").await;

    staff
        .send_text(r#"{"event":"SEND_SOMETHING_ELSE","data":{"guid":"u1"}}"#)
        .await;
    assert!(customer.is_silent().await);
    assert_eq!(server.registry.len().await, 2);

    staff.send_stamp("u1", 5).await;
    let frame = customer.recv_json().await;
    assert_eq!(frame["data"]["prize_id"], 5);

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_envelope_closes_sender_only() {
    let server = TestServer::spawn().await;
    let mut customer = server.connect("customer", "u1").await;
    let mut staff = server.connect("staff", "staff-1").await;

    staff.send_text("{not json").await;

    assert!(staff.is_closed_by_server().await);
    server.wait_for_connections(1).await;

    // Other connections are unaffected
    let mut other_staff = server.connect("staff", "staff-2").await;
    other_staff.send_stamp("u1", 6).await;
    let frame = customer.recv_json().await;
    assert_eq!(frame["data"]["prize_id"], 6);

    server.shutdown().await;
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let config = RelayConfig {
        max_frame_size: 256,
        ..Default::default()
    };
    let server = TestServer::spawn_with_config(config).await;
    let mut staff = server.connect("staff", "staff-1").await;

    let padding = "x".repeat(1024);
    let frame = format!(
        r#"{{"event":"SEND_STAMP_SUCCESS_NOTIFY","data":{{"uid":"u1","message":"{padding}"}}}}"#
    );
    // The server may drop the connection while the frame is still in flight
    let _ = staff.stream.send(Message::text(frame)).await;

    assert!(staff.is_closed_by_server().await);
    server.wait_for_connections(0).await;

    server.shutdown().await;
}

// ============================================================================
// Health Check and Shutdown
// ============================================================================

#[tokio::test]
async fn test_ping_endpoint() {
    let server = TestServer::spawn().await;

    let response = server.http_get("/ping").await;
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains("application/json"));
    assert!(response.contains(r#"{"message":"pong"}"#));

    server.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_open_connections() {
    let server = TestServer::spawn().await;
    let mut customer = server.connect("customer", "u1").await;
    let registry = Arc::clone(&server.registry);

    server.shutdown().await;

    assert!(customer.is_closed_by_server().await);
    assert!(registry.is_empty().await);
}
