//! HTTP and WebSocket tests against an in-process server

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use webterm::{AppState, Server, ServerConfig};
use webterm_daemon::DaemonConfig;

struct TestServer {
    _dir: TempDir,
    addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    client: reqwest::Client,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(|config| config).await
    }

    async fn start_with(adjust: impl FnOnce(DaemonConfig) -> DaemonConfig) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::from_env()
            .with_pipes_dir(dir.path().join("pipes"))
            .with_eviction_delay(Duration::from_millis(200))
            .with_termination_timeout(Duration::from_secs(2))
            .with_stop_timeout(Duration::from_secs(2));
        let state = AppState::new(adjust(config)).unwrap();
        let server = Server::bind(
            &ServerConfig::from_env().with_host("127.0.0.1").with_port(0),
            state,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .serve(async move {
                    let _ = stopped.await;
                })
                .await
                .unwrap();
        });

        Self {
            _dir: dir,
            addr,
            stop: Some(stop),
            task,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn create_session(&self, body: Value) -> Value {
        let response = self
            .client
            .post(self.url("/api/sessions"))
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 201);
        response.json::<Value>().await.unwrap()["session"].clone()
    }

    async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(Duration::from_secs(15), &mut self.task)
            .await
            .expect("server stops")
            .unwrap();
    }
}

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame in time")
            .expect("socket open")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

// =============================================================================
// REST
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_reports_ok() {
    let server = TestServer::start().await;
    let body: Value = server
        .client
        .get(server.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["sessions"], 0);
    assert!(body["metrics"]["uptime_ms"].is_number());
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_crud() {
    let server = TestServer::start().await;
    let session = server.create_session(json!({ "shell": "/bin/sh" })).await;
    let id = session["id"].as_str().unwrap().to_string();
    assert_eq!(session["status"], "starting");
    assert!(session.get("error_message").is_none());

    let list: Value = server
        .client
        .get(server.url("/api/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["count"], 1);
    assert_eq!(list["sessions"][0]["id"], id.as_str());

    let one: Value = server
        .client
        .get(server.url(&format!("/api/sessions/{id}")))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(one["session"]["status"], "running");

    let deleted = server
        .client
        .delete(server.url(&format!("/api/sessions/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), 204);

    let again = server
        .client
        .delete(server.url(&format!("/api/sessions/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), 409);
    let body: Value = again.json().await.unwrap();
    assert_eq!(body["error"]["code"], "SESSION_INVALID_STATE");
    assert_eq!(body["error"]["retryable"], false);

    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_session_is_404() {
    let server = TestServer::start().await;
    let response = server
        .client
        .get(server.url("/api/sessions/does-not-exist"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "SESSION_NOT_FOUND");
    assert!(body["error"]["timestamp"].is_string());
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_body_is_400() {
    let server = TestServer::start().await;
    let response = server
        .client
        .post(server.url("/api/sessions"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "INVALID_REQUEST");
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_session_limit_is_503() {
    let server = TestServer::start_with(|config| config.with_max_sessions(1)).await;
    server.create_session(json!({ "shell": "/bin/sh" })).await;

    let response = server
        .client
        .post(server.url("/api/sessions"))
        .json(&json!({ "shell": "/bin/sh" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], "SESSION_LIMIT");
    assert_eq!(body["error"]["retryable"], true);
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_output_endpoint_returns_history() {
    let server = TestServer::start().await;
    let session = server
        .create_session(json!({ "command": ["/bin/sh", "-c", "echo captured-history; sleep 5"] }))
        .await;
    let id = session["id"].as_str().unwrap();

    let mut text = String::new();
    for _ in 0..50 {
        text = server
            .client
            .get(server.url(&format!("/api/sessions/{id}/output")))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        if text.contains("captured-history") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(text.contains("captured-history"));
    server.stop().await;
}

// =============================================================================
// Live channel
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_websocket_round_trip() {
    let server = TestServer::start().await;
    let session = server.create_session(json!({ "command": ["/bin/cat"] })).await;
    let id = session["id"].as_str().unwrap();

    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{}/ws?session={id}", server.addr))
            .await
            .unwrap();
    assert_eq!(next_json(&mut socket).await["type"], "connected");
    let status = next_json(&mut socket).await;
    assert_eq!(status["type"], "status");
    assert_eq!(status["session_id"], id);

    socket
        .send(Message::Text(
            json!({ "type": "input", "data": "over-the-wire\n" }).to_string(),
        ))
        .await
        .unwrap();
    let mut seen = String::new();
    while !seen.contains("over-the-wire") {
        let frame = next_json(&mut socket).await;
        if frame["type"] == "output" {
            seen.push_str(frame["data"].as_str().unwrap_or_default());
        }
    }

    socket
        .send(Message::Text(r#"{"type":"bogus"}"#.to_string()))
        .await
        .unwrap();
    let mut error = next_json(&mut socket).await;
    while error["type"] != "error" {
        error = next_json(&mut socket).await;
    }
    assert_eq!(error["error"], "Invalid message type");
    assert_eq!(error["retryable"], false);

    socket
        .send(Message::Text(r#"{"type":"ping"}"#.to_string()))
        .await
        .unwrap();
    let mut pong = next_json(&mut socket).await;
    while pong["type"] != "pong" {
        pong = next_json(&mut socket).await;
    }
    assert_eq!(pong["session_id"], id);

    let _ = socket.close(None).await;
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_websocket_unknown_session_gets_error_then_close() {
    let server = TestServer::start().await;
    let (mut socket, _) =
        tokio_tungstenite::connect_async(format!("ws://{}/ws?session=missing", server.addr))
            .await
            .unwrap();

    let frame = next_json(&mut socket).await;
    assert_eq!(frame["type"], "error");
    assert_eq!(frame["error"], "Session not found");

    let rest = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("close in time");
    assert!(matches!(rest, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
    server.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_limit_refuses_upgrade() {
    let server = TestServer::start_with(|config| config.with_max_connections(0)).await;
    let session = server.create_session(json!({ "shell": "/bin/sh" })).await;
    let id = session["id"].as_str().unwrap();

    let result =
        tokio_tungstenite::connect_async(format!("ws://{}/ws?session={id}", server.addr)).await;
    match result {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 503);
        }
        Err(e) => panic!("expected HTTP 503, got {e}"),
        Ok(_) => panic!("upgrade should have been refused"),
    }
    server.stop().await;
}
