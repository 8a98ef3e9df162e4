//! Integration tests for the `GET /health` and `GET /metrics` side-channels
//! multiplexed onto the same listening port as the WebSocket server.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ocppjd::cluster::adapter::InMemoryAdapter;
use ocppjd::config::OcppConfig;
use ocppjd::endpoint::{ActionHandler, HandlerContext};
use ocppjd::errors::OcppError;
use ocppjd::ServerContext;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

struct NoopHandler;

#[async_trait]
impl ActionHandler for NoopHandler {
    async fn handle(
        &self,
        _protocol: Option<&str>,
        action: &str,
        _payload: serde_json::Value,
        _context: HandlerContext,
    ) -> Result<Option<serde_json::Value>, OcppError> {
        Err(OcppError::not_implemented(action))
    }
}

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn spawn_test_server() -> (Arc<ServerContext>, u16) {
    let dir = TempDir::new().unwrap();
    let port = find_free_port();
    let config = Arc::new(OcppConfig::new(Some(port), Some(dir.path().to_path_buf()), Some("error".to_string())));
    let adapter = Arc::new(InMemoryAdapter::new());
    let ctx = Arc::new(ServerContext::new(config, adapter));

    let handler: Arc<dyn ActionHandler> = Arc::new(NoopHandler);
    let ctx_clone = ctx.clone();
    tokio::spawn(async move {
        let _ = ocppjd::server::run(ctx_clone, handler).await;
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    (ctx, port)
}

async fn get(port: u16, path: &str) -> String {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{port}")).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    String::from_utf8_lossy(&buf).into_owned()
}

#[tokio::test]
async fn health_endpoint_returns_200_with_expected_fields() {
    let (ctx, port) = spawn_test_server().await;
    let response = get(port, "/health").await;

    let first_line = response.lines().next().unwrap_or("");
    assert!(first_line.contains("200"), "expected HTTP 200, got: {first_line}");
    assert!(response.contains("Content-Type: application/json"));

    let body_start = response.find("\r\n\r\n").map(|i| i + 4).expect("no body");
    let body = &response[body_start..];
    let json: serde_json::Value = serde_json::from_str(body).expect("body is not valid JSON");

    assert_eq!(json["status"], "ok");
    assert_eq!(json["version"].as_str().unwrap(), env!("CARGO_PKG_VERSION"));
    assert!(json["uptime"].is_number());
    assert_eq!(json["activeSessions"].as_u64().unwrap(), 0);
    assert_eq!(json["nodeId"].as_str().unwrap(), ctx.node_id);
}

#[tokio::test]
async fn metrics_endpoint_returns_prometheus_text() {
    let (_ctx, port) = spawn_test_server().await;
    let response = get(port, "/metrics").await;

    let first_line = response.lines().next().unwrap_or("");
    assert!(first_line.contains("200"), "expected HTTP 200, got: {first_line}");
    assert!(response.contains("Content-Type: text/plain"));
    assert!(response.contains("ocpp_connected_clients"));
    assert!(response.contains("ocpp_memory_rss_bytes"));
    assert!(response.contains("ocpp_ws_buffered_bytes"));
}

#[tokio::test]
async fn unknown_path_returns_404() {
    let (_ctx, port) = spawn_test_server().await;
    let response = get(port, "/nope").await;
    let first_line = response.lines().next().unwrap_or("");
    assert!(first_line.contains("404"), "expected HTTP 404, got: {first_line}");
}
