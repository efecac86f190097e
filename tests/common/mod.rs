//! Shared helpers for the CWC server integration tests.
//!
//! Spins up a real `axum::serve` instance bound to an ephemeral port and
//! connects to it with `tokio-tungstenite`, exercising the full stack the
//! way a real client would rather than calling into the session controller
//! directly.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use cwc_server::codec::NoopValidator;
use cwc_server::service::{self, SessionRegistry};

pub type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A running test server instance. Dropping this does not stop the server;
/// call `shutdown` explicitly to exercise the shutdown path, or simply let
/// the process-wide listener leak for the duration of the test binary.
#[allow(dead_code)]
pub struct TestServer {
    pub port: u16,
    pub registry: SessionRegistry,
    handle: tokio::task::JoinHandle<()>,
}

#[allow(dead_code)]
impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let registry = SessionRegistry::new();
        let router = service::router(Arc::new(NoopValidator), registry.clone());

        let registry_for_shutdown = registry.clone();
        let handle = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    // In tests shutdown is driven explicitly via `shutdown()`
                    // rather than OS signals; this future only completes if
                    // the registry is told to do so out of band, which it
                    // never is here -- the server simply runs until the test
                    // process exits or the handle is aborted.
                    std::future::pending::<()>().await;
                    let _ = &registry_for_shutdown;
                })
                .await
                .unwrap();
        });

        // Give the listener a moment to accept connections.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        Self {
            port,
            registry,
            handle,
        }
    }

    pub async fn connect(&self) -> Client {
        let url = format!("ws://127.0.0.1:{}/spawn", self.port);
        let (stream, _response) = connect_async(url).await.expect("connect failed");
        stream
    }

    /// Trip every live session's cancellation token, the same cascade the
    /// real server performs on SIGTERM/SIGINT.
    pub async fn shutdown_sessions(&self) {
        self.registry.shutdown_all().await;
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

pub async fn send_run(
    client: &mut Client,
    args: Vec<&str>,
    stdout: &str,
    stderr: &str,
) {
    let msg = serde_json::json!({
        "type": "run",
        "args": args,
        "stdout": stdout,
        "stderr": stderr,
    });
    client
        .send(WsMessage::Text(msg.to_string()))
        .await
        .unwrap();
}

pub async fn send_stdin(client: &mut Client, data: &[u8]) {
    let encoded = STANDARD.encode(data);
    let msg = serde_json::json!({"type": "stdin", "data": encoded});
    client
        .send(WsMessage::Text(msg.to_string()))
        .await
        .unwrap();
}

pub async fn send_signal(client: &mut Client, signum: i32) {
    let msg = serde_json::json!({"type": "signal", "signum": signum});
    client
        .send(WsMessage::Text(msg.to_string()))
        .await
        .unwrap();
}

/// Collected outcome of draining a session to its `exit` message.
#[derive(Debug, Default)]
pub struct Collected {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: Option<i32>,
}

/// Read frames from `client` until the `exit` message arrives (or the socket
/// closes without one), decoding and concatenating stream payloads.
pub async fn drain_to_exit(client: &mut Client) -> Collected {
    let mut collected = Collected::default();
    loop {
        let next = tokio::time::timeout(std::time::Duration::from_secs(10), client.next())
            .await
            .expect("timed out waiting for server message");
        match next {
            Some(Ok(WsMessage::Text(text))) => {
                let value: serde_json::Value = serde_json::from_str(&text).unwrap();
                match value["type"].as_str().unwrap() {
                    "stdout" => {
                        let data = value["data"].as_str().unwrap();
                        collected.stdout.extend(STANDARD.decode(data).unwrap());
                    }
                    "stderr" => {
                        let data = value["data"].as_str().unwrap();
                        collected.stderr.extend(STANDARD.decode(data).unwrap());
                    }
                    "exit" => {
                        collected.exit_code = Some(value["code"].as_i64().unwrap() as i32);
                        break;
                    }
                    other => panic!("unexpected message type: {other}"),
                }
            }
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("websocket error: {e}"),
        }
    }
    collected
}
