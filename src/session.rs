//! Session controller
//!
//! Owns one client WebSocket end to end: `AwaitRun` (wait for the single
//! `run` command that may start this session) -> `Running` (stage files,
//! spawn, drive the multiplexer) -> `Done` (send the terminal `exit`
//! message, clean up staging, deregister). The controller is the sole
//! writer of the `exit` message and the sole cleanup gate, matching the
//! teacher's pattern of concentrating lifecycle decisions in one place
//! (`mcp/transport/stdio.rs`'s `Drop` impl is the cleanup-gate analogue).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::codec::{decode_client_message, ClientMessage, MessageValidator, ServerMessage};
use crate::multiplex;
use crate::staging::StagingDir;
use crate::supervisor::{self, SPAWN_FAILURE_EXIT_CODE};

/// How long the controller waits for the first `run` message before giving
/// up on an idle connection.
const AWAIT_RUN_TIMEOUT: Duration = Duration::from_secs(300);

/// Drive one session's full lifecycle on `socket`.
///
/// `id` is used only for log correlation; `cancel` is this session's entry
/// in the [`crate::service::SessionRegistry`] and may be tripped externally
/// (server shutdown) to unwind the session early.
pub async fn run(
    id: Uuid,
    socket: WebSocket,
    validator: Arc<dyn MessageValidator>,
    cancel: CancellationToken,
) {
    tracing::info!(session = %id, "session connected");

    let (sink, mut stream) = socket.split();
    let sink = Arc::new(Mutex::new(sink));

    let run_cmd = match await_run(&mut stream, validator.as_ref(), &cancel).await {
        AwaitRunOutcome::Run(cmd) => cmd,
        AwaitRunOutcome::Disconnected => {
            tracing::info!(session = %id, "session closed before run");
            return;
        }
        AwaitRunOutcome::ShutdownRequested => {
            tracing::info!(session = %id, "server shutdown before run");
            close_for_shutdown(&sink).await;
            return;
        }
        AwaitRunOutcome::ProtocolError(msg) => {
            tracing::warn!(session = %id, error = %msg, "protocol error awaiting run");
            close_with_protocol_error(&sink).await;
            return;
        }
    };

    tracing::info!(session = %id, argv = ?run_cmd.args, "run received");

    let staging = match StagingDir::create(&run_cmd.files).await {
        Ok(staging) => staging,
        Err(e) => {
            tracing::warn!(session = %id, error = %e, "staging failed");
            send_exit(&sink, SPAWN_FAILURE_EXIT_CODE).await;
            return;
        }
    };

    let spawn_result = supervisor::spawn(
        &run_cmd.args,
        run_cmd.stdout,
        run_cmd.stderr,
        &run_cmd.env,
        staging.path(),
    );

    let mut supervised = match spawn_result {
        Ok(supervised) => supervised,
        Err(e) => {
            tracing::warn!(session = %id, error = %e, "spawn failed");
            send_exit(&sink, SPAWN_FAILURE_EXIT_CODE).await;
            cleanup_staging(id, staging).await;
            return;
        }
    };

    let stdout_active = matches!(run_cmd.stdout, crate::codec::StdoutDisposition::Pipe);
    let stderr_active = !supervised.stderr_merged
        && matches!(run_cmd.stderr, crate::codec::StderrDisposition::Pipe);

    let outcome = multiplex::run(
        &mut supervised.child,
        run_cmd.chunk_size,
        stdout_active,
        stderr_active,
        stream,
        Arc::clone(&sink),
        cancel.clone(),
        validator,
    )
    .await;

    match outcome {
        Ok(outcome) if outcome.client_disconnected => {
            tracing::info!(session = %id, "client disconnected, child killed");
        }
        Ok(_) if cancel.is_cancelled() => {
            tracing::info!(session = %id, "server shutdown, child killed");
            close_for_shutdown(&sink).await;
        }
        Ok(outcome) => {
            tracing::info!(session = %id, exit_code = outcome.exit_code, "session exited");
            send_exit(&sink, outcome.exit_code).await;
        }
        Err(e) => {
            tracing::warn!(session = %id, error = %e, "multiplexer error");
        }
    }

    cleanup_staging(id, staging).await;
    tracing::info!(session = %id, "session done");
}

enum AwaitRunOutcome {
    Run(crate::codec::RunCommand),
    Disconnected,
    ShutdownRequested,
    ProtocolError(String),
}

async fn await_run(
    stream: &mut futures::stream::SplitStream<WebSocket>,
    validator: &dyn MessageValidator,
    cancel: &CancellationToken,
) -> AwaitRunOutcome {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return AwaitRunOutcome::ShutdownRequested,
            _ = tokio::time::sleep(AWAIT_RUN_TIMEOUT) => {
                return AwaitRunOutcome::ProtocolError("no `run` received within timeout".to_string());
            }
            msg = stream.next() => msg,
        };

        match next {
            Some(Ok(Message::Text(text))) => match decode_client_message(&text, validator) {
                Ok(Some(ClientMessage::Run(cmd))) => return AwaitRunOutcome::Run(cmd),
                Ok(Some(_)) => {
                    tracing::debug!("dropping pre-run signal/stdin command");
                }
                Ok(None) => {
                    tracing::debug!("dropping unrecognized pre-run message");
                }
                Err(e) => return AwaitRunOutcome::ProtocolError(e.to_string()),
            },
            Some(Ok(Message::Close(_))) | None => return AwaitRunOutcome::Disconnected,
            Some(Ok(_)) => {
                tracing::debug!("dropping non-text pre-run frame");
            }
            Some(Err(e)) => {
                tracing::debug!("pre-run websocket error: {e}");
                return AwaitRunOutcome::Disconnected;
            }
        }
    }
}

async fn send_exit(sink: &Arc<Mutex<futures::stream::SplitSink<WebSocket, Message>>>, code: i32) {
    let msg = ServerMessage::exit(code);
    if let Err(e) = multiplex::send_frame(sink, &msg).await {
        tracing::warn!(error = %e, "failed to send exit message");
    }
}

async fn cleanup_staging(id: Uuid, staging: StagingDir) {
    if let Err(e) = staging.close().await {
        tracing::warn!(session = %id, error = %e, "staging cleanup failed");
    }
}

async fn close_with_protocol_error(
    sink: &Arc<Mutex<futures::stream::SplitSink<WebSocket, Message>>>,
) {
    let mut guard = sink.lock().await;
    let _ = guard
        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
            code: 1002,
            reason: "protocol error".into(),
        })))
        .await;
}

/// Close this session's socket the way the original server's `close_all`
/// broadcast did: code 1001 (going away), reason verbatim from the Python
/// implementation.
async fn close_for_shutdown(sink: &Arc<Mutex<futures::stream::SplitSink<WebSocket, Message>>>) {
    let mut guard = sink.lock().await;
    let _ = guard
        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
            code: 1001,
            reason: "Server shutdown.".into(),
        })))
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::NoopValidator;

    #[test]
    fn noop_validator_accepts_run_json() {
        let text = r#"{"type":"run","args":["/bin/echo"]}"#;
        let msg = decode_client_message(text, &NoopValidator).unwrap().unwrap();
        assert!(matches!(msg, ClientMessage::Run(_)));
    }
}
