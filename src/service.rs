//! Service endpoint: the `GET /spawn` WebSocket route, the live-session
//! registry, and optional mDNS advertisement.
//!
//! Grounded in the teacher's `Transport` trait (`mcp/transport/mod.rs`) for
//! the pluggable-interface shape of [`Publisher`], and in its async_trait
//! convention for the same reason.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::MessageValidator;
use crate::error::{CwcError, Result};
use crate::session;

/// Live sessions, keyed by a server-generated id, so shutdown can cascade a
/// cancellation to every in-flight session.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    async fn register(&self, id: Uuid, token: CancellationToken) {
        self.sessions.lock().await.insert(id, token);
    }

    async fn deregister(&self, id: Uuid) {
        self.sessions.lock().await.remove(&id);
    }

    /// Trip every live session's cancellation token. Each session sends its
    /// own close frame (code 1001, "Server shutdown.") as it unwinds --
    /// mirroring the original `close_all` broadcast, just cascaded through
    /// tokens instead of iterating live sockets directly.
    pub async fn shutdown_all(&self) {
        let sessions = self.sessions.lock().await;
        tracing::info!(count = sessions.len(), "shutting down live sessions");
        for token in sessions.values() {
            token.cancel();
        }
    }
}

#[derive(Clone)]
struct AppState {
    validator: Arc<dyn MessageValidator>,
    registry: SessionRegistry,
}

/// Build the `axum::Router` exposing `GET /spawn`.
pub fn router(validator: Arc<dyn MessageValidator>, registry: SessionRegistry) -> Router {
    let state = AppState { validator, registry };
    Router::new()
        .route("/spawn", get(spawn_handler))
        .with_state(state)
}

async fn spawn_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let id = Uuid::new_v4();
    let token = CancellationToken::new();
    state.registry.register(id, token.clone()).await;

    let validator = Arc::clone(&state.validator);
    let registry = state.registry.clone();
    ws.on_upgrade(move |socket| async move {
        session::run(id, socket, validator, token).await;
        registry.deregister(id).await;
    })
}

/// Advertises (or doesn't) the service over mDNS. Constructor-injected so
/// tests never have to shell out to `avahi-publish-service`.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    /// Begin advertising `name` on `port`. Called once at startup.
    async fn start(&mut self, name: &str, port: u16) -> Result<()>;
    /// Stop advertising. Called once at shutdown.
    async fn stop(&mut self) -> Result<()>;
}

/// Default publisher: advertises nothing. Used when `--mdns-name` is empty.
#[derive(Debug, Default)]
pub struct NullPublisher;

#[async_trait::async_trait]
impl Publisher for NullPublisher {
    async fn start(&mut self, _name: &str, _port: u16) -> Result<()> {
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Advertises the service via `avahi-publish-service`, spawned and held as a
/// child process for the server's lifetime -- grounded in the original
/// Python implementation's `publish_service`/`unpublish_service`, which
/// shelled out to the same binary.
#[derive(Debug, Default)]
pub struct AvahiPublisher {
    child: Option<Child>,
}

#[async_trait::async_trait]
impl Publisher for AvahiPublisher {
    async fn start(&mut self, name: &str, port: u16) -> Result<()> {
        let child = Command::new("avahi-publish-service")
            .arg(name)
            .arg("_aiy_cwc._tcp")
            .arg(port.to_string())
            .arg("CWC Server")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| anyhow::anyhow!(CwcError::Publisher(format!("spawn avahi-publish-service: {e}"))))?;
        self.child = Some(child);
        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        Ok(())
    }
}
