//! End-to-end tests against a mock gateway.
//!
//! Each test starts a WebSocket server on an ephemeral port that accepts a
//! single connection and plays a scripted conversation. The script records
//! every frame the client sent so the test can assert on the exact sequence.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use gateway_client::config::Config;
use gateway_client::identity::{load_or_create_device_identity, DeviceAuthStore};
use gateway_client::{invoke, CallOptions, ConnectionDetails, GatewayClient, GatewayError};
use protocol::{verify_device_signature, DeviceAuthPayload, OPERATOR_ROLE};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

// =============================================================================
// Mock gateway
// =============================================================================

struct MockConn {
    ws: WebSocketStream<TcpStream>,
    received: Vec<Value>,
}

impl MockConn {
    /// Next JSON text frame from the client, or `None` once the socket ends.
    async fn recv(&mut self) -> Option<Value> {
        while let Some(Ok(message)) = self.ws.next().await {
            if let Message::Text(text) = message {
                let value: Value = serde_json::from_str(&text).unwrap();
                self.received.push(value.clone());
                return Some(value);
            }
        }
        None
    }

    async fn recv_within(&mut self, duration: Duration) -> Option<Value> {
        tokio::time::timeout(duration, self.recv())
            .await
            .ok()
            .flatten()
    }

    async fn send(&mut self, value: Value) {
        self.send_raw(&value.to_string()).await;
    }

    async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string())).await.unwrap();
    }

    async fn close(&mut self, code: CloseCode, reason: &str) {
        let _ = self
            .ws
            .close(Some(CloseFrame {
                code,
                reason: reason.to_string().into(),
            }))
            .await;
    }

    /// Reads until the client goes away and returns everything it sent.
    async fn drain(mut self) -> Vec<Value> {
        while self.recv().await.is_some() {}
        self.received
    }
}

async fn spawn_gateway<F, Fut>(script: F) -> (String, JoinHandle<Vec<Value>>)
where
    F: FnOnce(MockConn) -> Fut + Send + 'static,
    Fut: Future<Output = MockConn> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let ws = accept_async(stream).await.unwrap();
        let conn = script(MockConn {
            ws,
            received: Vec::new(),
        })
        .await;
        conn.drain().await
    });
    (url, handle)
}

async fn gateway_log(handle: JoinHandle<Vec<Value>>) -> Vec<Value> {
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("mock gateway did not see the socket close")
        .unwrap()
}

// =============================================================================
// Helpers
// =============================================================================

fn client_for(url: &str, state_dir: &Path, token: Option<&str>) -> GatewayClient {
    GatewayClient::new(ConnectionDetails {
        url: url.to_string(),
        token: token.map(str::to_string),
        password: None,
        state_dir: state_dir.to_path_buf(),
    })
}

fn fast_options() -> CallOptions {
    CallOptions::new()
        .with_connect_delay(Duration::from_millis(20))
        .with_timeout_ms(5_000)
}

/// Checks a connect request's signature and returns the signed payload.
fn verify_connect(frame: &Value) -> DeviceAuthPayload {
    assert_eq!(frame["type"], "req");
    assert_eq!(frame["method"], "connect");

    let params = &frame["params"];
    let device = &params["device"];
    let payload = DeviceAuthPayload {
        device_id: device["id"].as_str().unwrap().to_string(),
        client_id: params["client"]["id"].as_str().unwrap().to_string(),
        client_mode: params["client"]["mode"].as_str().unwrap().to_string(),
        role: params["role"].as_str().unwrap().to_string(),
        scopes: params["scopes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s.as_str().unwrap().to_string())
            .collect(),
        signed_at_ms: device["signedAt"].as_u64().unwrap(),
        token: params["auth"]["token"].as_str().map(str::to_string),
        nonce: device["nonce"].as_str().map(str::to_string),
    };

    verify_device_signature(
        device["publicKey"].as_str().unwrap(),
        &payload.canonical(),
        device["signature"].as_str().unwrap(),
    )
    .expect("connect signature must verify");
    payload
}

fn res_ok(request: &Value, payload: Value) -> Value {
    json!({"type": "res", "id": request["id"], "ok": true, "payload": payload})
}

fn res_err(request: &Value, message: Option<&str>) -> Value {
    let error = match message {
        Some(message) => json!({"code": "ERR", "message": message}),
        None => json!({}),
    };
    json!({"type": "res", "id": request["id"], "ok": false, "error": error})
}

fn hello(device_token: &str) -> Value {
    json!({"type": "hello-ok", "protocol": 3, "auth": {"deviceToken": device_token, "role": "operator"}})
}

// =============================================================================
// Handshake scenarios
// =============================================================================

#[tokio::test]
async fn test_fresh_handshake() {
    let temp_dir = TempDir::new().unwrap();
    let (url, server) = spawn_gateway(|mut conn| async move {
        let connect = conn.recv().await.unwrap();
        conn.send(res_ok(&connect, hello("dt-1"))).await;
        let method = conn.recv().await.unwrap();
        conn.send(res_ok(&method, json!({"healthy": true}))).await;
        conn
    })
    .await;

    let payload = client_for(&url, temp_dir.path(), None)
        .call("status", json!({}), fast_options())
        .await
        .unwrap();
    assert_eq!(payload, json!({"healthy": true}));

    let frames = gateway_log(server).await;
    assert_eq!(frames.len(), 2, "expected one connect and one method: {:?}", frames);

    let signed = verify_connect(&frames[0]);
    assert_eq!(signed.version(), "v1");
    assert!(signed.token.is_none());
    assert!(frames[0]["params"].get("auth").is_none());
    assert_eq!(frames[0]["params"]["minProtocol"], 3);

    assert_eq!(frames[1]["method"], "status");
    assert_eq!(frames[1]["params"], json!({}));

    // The identity on disk is the one that signed, and the token was cached.
    let identity = load_or_create_device_identity(temp_dir.path()).unwrap();
    assert_eq!(signed.device_id, identity.device_id());
    let entry = DeviceAuthStore::new(temp_dir.path())
        .get(identity.device_id(), OPERATOR_ROLE)
        .unwrap();
    assert_eq!(entry.token, "dt-1");
}

#[tokio::test]
async fn test_cached_device_token_is_sent_on_next_call() {
    let temp_dir = TempDir::new().unwrap();
    let identity = load_or_create_device_identity(temp_dir.path()).unwrap();
    DeviceAuthStore::new(temp_dir.path())
        .store(identity.device_id(), OPERATOR_ROLE, "cached-dt", &[])
        .unwrap();

    let (url, server) = spawn_gateway(|mut conn| async move {
        let connect = conn.recv().await.unwrap();
        conn.send(res_ok(&connect, json!({"type": "hello-ok"}))).await;
        let method = conn.recv().await.unwrap();
        conn.send(res_ok(&method, json!(1))).await;
        conn
    })
    .await;

    client_for(&url, temp_dir.path(), Some("shared-token"))
        .call("status", json!({}), fast_options())
        .await
        .unwrap();

    let frames = gateway_log(server).await;
    let signed = verify_connect(&frames[0]);
    assert_eq!(signed.token.as_deref(), Some("cached-dt"));
    assert_eq!(frames[0]["params"]["auth"]["token"], "cached-dt");
}

#[tokio::test]
async fn test_challenged_handshake() {
    let temp_dir = TempDir::new().unwrap();
    let (url, server) = spawn_gateway(|mut conn| async move {
        let first = conn.recv().await.unwrap();
        conn.send(json!({"type": "event", "event": "connect.challenge", "payload": {"nonce": "abc", "ts": 1}}))
            .await;
        let second = conn.recv().await.unwrap();

        // Accepting the superseded connect must not release the method call.
        conn.send(res_ok(&first, json!({"type": "hello-ok"}))).await;
        assert!(conn.recv_within(Duration::from_millis(200)).await.is_none());

        conn.send(res_ok(&second, json!({"type": "hello-ok"}))).await;
        let method = conn.recv().await.unwrap();
        conn.send(res_ok(&method, json!({"ok": 1}))).await;
        conn
    })
    .await;

    let payload = client_for(&url, temp_dir.path(), Some("shared"))
        .call("status", json!({}), fast_options())
        .await
        .unwrap();
    assert_eq!(payload, json!({"ok": 1}));

    let frames = gateway_log(server).await;
    assert_eq!(frames.len(), 3, "{:?}", frames);

    let first = verify_connect(&frames[0]);
    assert_eq!(first.version(), "v1");

    let second = verify_connect(&frames[1]);
    assert_eq!(second.version(), "v2");
    assert_eq!(second.nonce.as_deref(), Some("abc"));
    assert!(second.canonical().ends_with("|shared|abc"));
    assert_ne!(frames[0]["id"], frames[1]["id"]);

    assert_eq!(frames[2]["method"], "status");
}

#[tokio::test]
async fn test_challenge_before_first_connect() {
    let temp_dir = TempDir::new().unwrap();
    let (url, server) = spawn_gateway(|mut conn| async move {
        conn.send(json!({"type": "event", "event": "connect.challenge", "payload": {"nonce": "early"}}))
            .await;
        let connect = conn.recv().await.unwrap();
        conn.send(res_ok(&connect, json!({}))).await;
        let method = conn.recv().await.unwrap();
        conn.send(res_ok(&method, json!(null))).await;
        conn
    })
    .await;

    // A long settle delay: only the challenge can trigger the connect in time.
    let options = CallOptions::new()
        .with_connect_delay(Duration::from_secs(30))
        .with_timeout_ms(5_000);
    client_for(&url, temp_dir.path(), None)
        .call("status", json!({}), options)
        .await
        .unwrap();

    let frames = gateway_log(server).await;
    assert_eq!(frames.len(), 2);
    let signed = verify_connect(&frames[0]);
    assert_eq!(signed.version(), "v2");
    assert_eq!(signed.nonce.as_deref(), Some("early"));
}

#[tokio::test]
async fn test_stale_token_is_evicted() {
    let temp_dir = TempDir::new().unwrap();
    let identity = load_or_create_device_identity(temp_dir.path()).unwrap();
    let store = DeviceAuthStore::new(temp_dir.path());
    store
        .store(identity.device_id(), OPERATOR_ROLE, "stale-dt", &[])
        .unwrap();
    store
        .store(identity.device_id(), "node", "node-dt", &[])
        .unwrap();

    let (url, server) = spawn_gateway(|mut conn| async move {
        let connect = conn.recv().await.unwrap();
        assert_eq!(connect["params"]["auth"]["token"], "stale-dt");
        conn.send(res_err(&connect, Some("unauthorized: invalid device token")))
            .await;
        conn
    })
    .await;

    let err = client_for(&url, temp_dir.path(), None)
        .call("status", json!({}), fast_options())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::StaleToken(_)), "got {:?}", err);
    assert!(err.is_auth_failure());
    assert_eq!(
        err.to_string(),
        "gateway connect failed: unauthorized: invalid device token"
    );

    assert!(store.get(identity.device_id(), OPERATOR_ROLE).is_none());
    assert_eq!(store.get(identity.device_id(), "node").unwrap().token, "node-dt");

    // No method request follows a rejected connect.
    let frames = gateway_log(server).await;
    assert_eq!(frames.len(), 1);
}

#[tokio::test]
async fn test_connect_rejection_without_message() {
    let temp_dir = TempDir::new().unwrap();
    let (url, server) = spawn_gateway(|mut conn| async move {
        let connect = conn.recv().await.unwrap();
        conn.send(res_err(&connect, None)).await;
        conn
    })
    .await;

    let err = client_for(&url, temp_dir.path(), None)
        .call("status", json!({}), fast_options())
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::Auth("connect failed".to_string()));
    gateway_log(server).await;
}

// =============================================================================
// Method call scenarios
// =============================================================================

#[tokio::test]
async fn test_expect_final_waits_for_final_frame() {
    let temp_dir = TempDir::new().unwrap();
    let (url, server) = spawn_gateway(|mut conn| async move {
        let connect = conn.recv().await.unwrap();
        conn.send(res_ok(&connect, json!({}))).await;
        let method = conn.recv().await.unwrap();
        conn.send(res_ok(&method, json!({"status": "accepted", "runId": "r-1"})))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        conn.send(res_ok(&method, json!({"status": "ok", "summary": "done"})))
            .await;
        conn
    })
    .await;

    let payload = client_for(&url, temp_dir.path(), None)
        .call(
            "agent.run",
            json!({"prompt": "hi"}),
            fast_options().with_expect_final(true),
        )
        .await
        .unwrap();
    assert_eq!(payload["status"], "ok");
    assert_eq!(payload["summary"], "done");

    let frames = gateway_log(server).await;
    assert_eq!(frames[1]["params"], json!({"prompt": "hi"}));
}

#[tokio::test]
async fn test_method_error_fallback_names_method() {
    let temp_dir = TempDir::new().unwrap();
    let (url, server) = spawn_gateway(|mut conn| async move {
        let connect = conn.recv().await.unwrap();
        conn.send(res_ok(&connect, json!({}))).await;
        let method = conn.recv().await.unwrap();
        conn.send(res_err(&method, None)).await;
        conn
    })
    .await;

    let err = client_for(&url, temp_dir.path(), None)
        .call("boards.list", json!({}), fast_options())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "gateway method boards.list failed");
    assert!(matches!(err, GatewayError::Method { ref method, .. } if method == "boards.list"));
    gateway_log(server).await;
}

#[tokio::test]
async fn test_malformed_frames_are_ignored() {
    let temp_dir = TempDir::new().unwrap();
    let (url, server) = spawn_gateway(|mut conn| async move {
        conn.send_raw("this is not json").await;
        conn.send_raw(r#"{"type": "mystery", "id": "x"}"#).await;
        conn.send_raw(r#"{"type": "res", "ok": true"#).await;
        let connect = conn.recv().await.unwrap();
        conn.send_raw(r#"{"event": "connect.challenge"}"#).await;
        conn.send(res_ok(&connect, json!({}))).await;
        let method = conn.recv().await.unwrap();
        conn.send(json!({"type": "event", "event": "tick", "payload": {}})).await;
        conn.send(res_ok(&method, json!("fine"))).await;
        conn
    })
    .await;

    let payload = client_for(&url, temp_dir.path(), None)
        .call("status", json!({}), fast_options())
        .await
        .unwrap();
    assert_eq!(payload, json!("fine"));
    gateway_log(server).await;
}

// =============================================================================
// Failure scenarios
// =============================================================================

#[tokio::test]
async fn test_timeout_closes_socket() {
    let temp_dir = TempDir::new().unwrap();
    let (url, server) = spawn_gateway(|mut conn| async move {
        // Swallow the connect and never answer.
        conn.recv().await;
        conn
    })
    .await;

    let options = CallOptions::new()
        .with_connect_delay(Duration::from_millis(10))
        .with_timeout_ms(300);
    let err = client_for(&url, temp_dir.path(), None)
        .call("status", json!({}), options)
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::Timeout { timeout_ms: 300 });
    assert_eq!(err.to_string(), "gateway timeout after 300ms");

    // The mock only finishes once the client has closed the socket.
    let frames = gateway_log(server).await;
    assert_eq!(frames.len(), 1);
}

#[tokio::test]
async fn test_premature_close_reports_code_and_reason() {
    let temp_dir = TempDir::new().unwrap();
    let (url, server) = spawn_gateway(|mut conn| async move {
        conn.recv().await;
        conn.close(CloseCode::Policy, "pairing required").await;
        conn
    })
    .await;

    let err = client_for(&url, temp_dir.path(), None)
        .call("status", json!({}), fast_options())
        .await
        .unwrap_err();
    assert_eq!(
        err,
        GatewayError::ConnectionClosed {
            code: 1008,
            reason: "pairing required".to_string()
        }
    );
    assert!(err.is_retryable());
    gateway_log(server).await;
}

// =============================================================================
// Config entry point
// =============================================================================

#[tokio::test]
async fn test_invoke_with_config() {
    let temp_dir = TempDir::new().unwrap();
    let (url, server) = spawn_gateway(|mut conn| async move {
        let connect = conn.recv().await.unwrap();
        conn.send(res_ok(&connect, json!({}))).await;
        let method = conn.recv().await.unwrap();
        conn.send(res_ok(&method, json!({"tasks": []}))).await;
        conn
    })
    .await;

    let mut config = Config::default();
    config.gateway.url = url;
    config.gateway.password = "pw".to_string();
    config.client.state_dir = temp_dir.path().to_path_buf();

    let payload = invoke(&config, "tasks.list", json!({"board": "b1"}), fast_options())
        .await
        .unwrap();
    assert_eq!(payload, json!({"tasks": []}));

    let frames = gateway_log(server).await;
    assert_eq!(frames[0]["params"]["auth"]["password"], "pw");
    assert!(frames[0]["params"]["auth"].get("token").is_none());
    assert_eq!(frames[1]["params"], json!({"board": "b1"}));
}

#[tokio::test]
async fn test_invoke_uses_configured_timeout() {
    let temp_dir = TempDir::new().unwrap();
    let (url, server) = spawn_gateway(|mut conn| async move {
        conn.recv().await;
        conn
    })
    .await;

    let mut config = Config::default();
    config.gateway.url = url;
    config.client.state_dir = temp_dir.path().to_path_buf();
    config.client.timeout_ms = 200;

    let started = std::time::Instant::now();
    let options = CallOptions::new().with_connect_delay(Duration::from_millis(10));
    let err = invoke(&config, "status", json!({}), options)
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::Timeout { timeout_ms: 200 });
    assert!(started.elapsed() < Duration::from_secs(5));
    gateway_log(server).await;
}

#[tokio::test]
async fn test_invoke_explicit_timeout_wins_over_config() {
    let temp_dir = TempDir::new().unwrap();
    let (url, server) = spawn_gateway(|mut conn| async move {
        conn.recv().await;
        conn
    })
    .await;

    let mut config = Config::default();
    config.gateway.url = url;
    config.client.state_dir = temp_dir.path().to_path_buf();
    config.client.timeout_ms = 60_000;

    let options = CallOptions::new()
        .with_connect_delay(Duration::from_millis(10))
        .with_timeout_ms(150);
    let err = invoke(&config, "status", json!({}), options)
        .await
        .unwrap_err();
    assert_eq!(err, GatewayError::Timeout { timeout_ms: 150 });
    gateway_log(server).await;
}
