//! Stream multiplexer -- the coordination core
//!
//! Once a child is spawned, the multiplexer owns four concurrent
//! activities: draining stdout, draining stderr, receiving inbound client
//! commands, and waiting for the child to exit. It joins when `wait` has
//! completed *and* both OutRead tasks have reached EOF; on cancellation it
//! kills the child and lets the remaining branches converge naturally.
//!
//! The task-per-direction-plus-channel shape mirrors the teacher's
//! `StdioTransport::spawn`, which runs one background task per stdio pipe
//! and funnels everything through `mpsc` channels rather than sharing raw
//! handles across tasks.
//!
//! `cancel` is the session's externally-visible token (the one held in the
//! `SessionRegistry` and consulted by `session.rs` to tell a real server
//! shutdown apart from a session finishing on its own) -- this module only
//! ever *reads* it, never cancels it. Internal teardown of `in_receive` and
//! the stdin writer runs off a private `child_token()` derived from it, so a
//! child exiting normally never makes `cancel.is_cancelled()` look true to
//! the caller. `out_read` never races against cancellation at all: once the
//! child is gone (exited or killed), its pipes close and `read` reaches EOF
//! on its own, so the readers always drain everything the child wrote
//! before this function returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::codec::{decode_client_message, ClientMessage, MessageValidator, ServerMessage, StreamKind};
use crate::error::Result;
use crate::supervisor;

/// Outcome of running the multiplexer to completion.
pub struct MultiplexOutcome {
    /// The child's exit code, already mapped through
    /// [`supervisor::exit_code_for`].
    pub exit_code: i32,
    /// Whether the session ended because the client's socket closed (or
    /// errored) before the child exited on its own. Per the error handling
    /// table, a client disconnect means the child is killed and cleaned up
    /// with no terminal `exit` message sent -- the caller checks this flag
    /// rather than always sending one.
    pub client_disconnected: bool,
}

/// Drive the four concurrent activities of §4.4 for one session.
///
/// `stdout_active`/`stderr_active` indicate whether a pipe reader should run
/// for that stream (false when the disposition was `null`, or for stderr
/// when it was merged into stdout).
#[allow(clippy::too_many_arguments)]
pub async fn run(
    child: &mut Child,
    chunk_size: usize,
    stdout_active: bool,
    stderr_active: bool,
    mut inbound: impl futures::Stream<Item = std::result::Result<Message, axum::Error>> + Unpin,
    sink: Arc<Mutex<SplitSink<WebSocket, Message>>>,
    cancel: CancellationToken,
    validator: Arc<dyn MessageValidator>,
) -> Result<MultiplexOutcome> {
    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    // Private token for internal teardown (in_receive / stdin writer). It
    // inherits cancellation from `cancel` (so a real shutdown still cascades
    // in) but cancelling *it* never touches `cancel` itself -- only this
    // session's own completion logic below may trip it.
    let internal_cancel = cancel.child_token();

    let (stdin_tx, stdin_rx) = mpsc::unbounded_channel::<StdinEvent>();
    let (sig_tx, mut sig_rx) = mpsc::unbounded_channel::<i32>();

    let writer_cancel = internal_cancel.clone();
    let stdin_writer = tokio::spawn(stdin_writer_task(stdin, stdin_rx, writer_cancel));

    let stdout_task = spawn_out_read(
        stdout,
        stdout_active,
        StreamKind::Stdout,
        chunk_size,
        Arc::clone(&sink),
    );
    let stderr_task = spawn_out_read(
        stderr,
        stderr_active,
        StreamKind::Stderr,
        chunk_size,
        Arc::clone(&sink),
    );

    let disconnected = Arc::new(AtomicBool::new(false));
    let in_receive_cancel = internal_cancel.clone();
    let in_receive_disconnected = Arc::clone(&disconnected);
    let in_receive = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = in_receive_cancel.cancelled() => break,
                msg = futures::StreamExt::next(&mut inbound) => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            dispatch_text(&text, validator.as_ref(), &stdin_tx, &sig_tx);
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            in_receive_disconnected.store(true, Ordering::SeqCst);
                            in_receive_cancel.cancel();
                            break;
                        }
                        Some(Ok(_)) => {
                            tracing::debug!("dropping non-text inbound frame");
                        }
                        Some(Err(e)) => {
                            tracing::debug!("inbound websocket error: {e}");
                            in_receive_disconnected.store(true, Ordering::SeqCst);
                            in_receive_cancel.cancel();
                            break;
                        }
                    }
                }
            }
        }
    });

    // Drain signal requests concurrently with the wait below; signals are
    // applied in send order but are not synchronized with stream output.
    // Captured once, rather than borrowed from `child`, since `Child::wait`
    // needs `&mut self` for the rest of this function and `kill(2)` only
    // ever needed the pid.
    let pid = child.id();
    let signal_forwarder = tokio::spawn(async move {
        let Some(pid) = pid else { return };
        while let Some(signum) = sig_rx.recv().await {
            if let Err(e) = supervisor::signal_pid(pid, signum) {
                tracing::debug!("signal delivery failed: {e}");
            }
        }
    });

    let wait_result = tokio::select! {
        status = child.wait() => status,
        _ = internal_cancel.cancelled() => {
            let _ = supervisor::kill(child).await;
            child.wait().await
        }
    };

    // Either the child exited naturally or cancellation already killed it.
    // Either way, trip the *private* token so in_receive/stdin_writer
    // converge. `cancel` (the externally-visible, session-registry token)
    // is never touched here -- it must only reflect a real external
    // shutdown, not "this session happened to finish".
    internal_cancel.cancel();

    let _ = stdout_task.await;
    let _ = stderr_task.await;
    in_receive.abort();
    let _ = in_receive.await;
    signal_forwarder.abort();
    let _ = signal_forwarder.await;
    stdin_writer.abort();
    let _ = stdin_writer.await;

    let status = wait_result.map_err(|e| anyhow::anyhow!(crate::error::CwcError::Io(e)))?;
    Ok(MultiplexOutcome {
        exit_code: supervisor::exit_code_for(status),
        client_disconnected: disconnected.load(Ordering::SeqCst),
    })
}

enum StdinEvent {
    Write(Vec<u8>),
    Close,
}

fn dispatch_text(
    text: &str,
    validator: &dyn MessageValidator,
    stdin_tx: &mpsc::UnboundedSender<StdinEvent>,
    sig_tx: &mpsc::UnboundedSender<i32>,
) {
    let msg = match decode_client_message(text, validator) {
        Ok(Some(msg)) => msg,
        Ok(None) => {
            tracing::debug!("dropping unrecognized inbound message");
            return;
        }
        Err(e) => {
            tracing::debug!("dropping invalid inbound frame: {e}");
            return;
        }
    };
    match msg {
        ClientMessage::Signal(cmd) => {
            let _ = sig_tx.send(cmd.signum);
        }
        ClientMessage::Stdin(cmd) => match cmd.decode() {
            Ok(data) if data.is_empty() => {
                let _ = stdin_tx.send(StdinEvent::Close);
            }
            Ok(data) => {
                let _ = stdin_tx.send(StdinEvent::Write(data));
            }
            Err(e) => tracing::debug!("dropping stdin command with bad base64: {e}"),
        },
        ClientMessage::Run(_) => {
            tracing::debug!("dropping extra `run` message after session start");
        }
    }
}

async fn stdin_writer_task(
    stdin: Option<tokio::process::ChildStdin>,
    mut rx: mpsc::UnboundedReceiver<StdinEvent>,
    cancel: CancellationToken,
) {
    let Some(mut stdin) = stdin else { return };
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => {
                match event {
                    Some(StdinEvent::Write(data)) => {
                        if stdin.write_all(&data).await.is_err() {
                            break;
                        }
                    }
                    Some(StdinEvent::Close) | None => break,
                }
            }
        }
    }
    let _ = stdin.shutdown().await;
}

/// Read `stream` to EOF, forwarding each chunk as a framed message. Runs
/// unconditionally to its own natural EOF -- never cut short by session
/// cancellation -- so that once the child is gone (exited or killed) every
/// byte it already wrote is still drained and delivered before this task
/// ends. `wait()`/pipe-EOF are observed via separate syscalls and are not
/// ordered with respect to each other; racing this loop against a
/// cancellation signal could otherwise drop buffered output that arrived
/// just as the child exited.
fn spawn_out_read<R>(
    stream: Option<R>,
    active: bool,
    kind: StreamKind,
    chunk_size: usize,
    sink: Arc<Mutex<SplitSink<WebSocket, Message>>>,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        if !active {
            return;
        }
        let Some(mut stream) = stream else { return };
        let mut buf = vec![0u8; chunk_size.max(1)];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let frame = ServerMessage::stream(kind, &buf[..n]);
                    if send_frame(&sink, &frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("child {kind:?} read error: {e}");
                    break;
                }
            }
        }
    })
}

/// Send a single outbound frame through the shared, single-writer sink.
pub async fn send_frame(
    sink: &Arc<Mutex<SplitSink<WebSocket, Message>>>,
    msg: &ServerMessage,
) -> Result<()> {
    let json = msg.to_json()?;
    let mut guard = sink.lock().await;
    guard
        .send(Message::Text(json))
        .await
        .map_err(|e| anyhow::anyhow!(crate::error::CwcError::Staging(format!("websocket send: {e}"))))
}
