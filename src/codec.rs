//! Wire codec and schema validation for the CWC protocol
//!
//! The transport is a WebSocket carrying UTF-8 text frames, each containing
//! exactly one JSON object. Inbound frames decode to a [`ClientMessage`];
//! outbound frames are produced from [`ServerMessage`]. Child stdio bytes are
//! never interpreted as text: payloads are base64-encoded and decoded at the
//! edges only.
//!
//! The maximum size of a single inbound text frame is [`MAX_MESSAGE_BYTES`];
//! frames larger than this are rejected before any JSON parse is attempted.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::error::{CwcError, Result};

/// Maximum size, in bytes, of a single inbound WebSocket text frame.
pub const MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;

/// Default chunk size used when a `run` message omits `chunk_size`.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// How a child's standard stream is wired up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StdoutDisposition {
    /// Forward the stream to the client as `stdout` messages.
    Pipe,
    /// Discard the stream.
    Null,
}

/// How a child's stderr stream is wired up. Distinct from
/// [`StdoutDisposition`] because stderr additionally supports merging into
/// stdout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrDisposition {
    /// Forward the stream to the client as `stderr` messages.
    Pipe,
    /// Discard the stream.
    Null,
    /// Merge into the same pipe as stdout; stream messages are still tagged
    /// `stdout`.
    Stdout,
}

impl Default for StdoutDisposition {
    fn default() -> Self {
        StdoutDisposition::Pipe
    }
}

impl Default for StderrDisposition {
    fn default() -> Self {
        StderrDisposition::Pipe
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

/// A `run` command: the only message that may start a session.
#[derive(Debug, Clone, Deserialize)]
pub struct RunCommand {
    /// argv; element 0 is the executable, resolved against the server's
    /// `PATH`.
    pub args: Vec<String>,
    /// Maximum bytes read from a child pipe per iteration, and the upper
    /// bound on a single outbound stream message's payload.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// stdout disposition.
    #[serde(default)]
    pub stdout: StdoutDisposition,
    /// stderr disposition.
    #[serde(default)]
    pub stderr: StderrDisposition,
    /// Environment overlay merged over the server process's environment;
    /// overlay wins on conflict.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Relative path → UTF-8 file contents to materialize in the staging
    /// directory.
    #[serde(default)]
    pub files: HashMap<String, String>,
}

/// A `signal` command: deliver a signal to the running child.
#[derive(Debug, Clone, Deserialize)]
pub struct SignalCommand {
    /// Signal number in `[1, 32]`.
    pub signum: i32,
}

/// A `stdin` command: forward bytes to the child's stdin, or close it.
#[derive(Debug, Clone, Deserialize)]
pub struct StdinCommand {
    /// Base64-encoded payload. An empty payload means "close stdin".
    pub data: String,
}

impl StdinCommand {
    /// Decode the base64 payload. An empty string decodes to an empty
    /// `Vec`, which callers interpret as "close stdin".
    pub fn decode(&self) -> Result<Vec<u8>> {
        if self.data.is_empty() {
            return Ok(Vec::new());
        }
        STANDARD
            .decode(&self.data)
            .map_err(|e| anyhow::anyhow!(CwcError::Protocol(format!("invalid base64: {e}"))))
    }
}

/// Every message a client may send, tagged on the wire by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// `{"type": "run", ...}`
    Run(RunCommand),
    /// `{"type": "signal", ...}`
    Signal(SignalCommand),
    /// `{"type": "stdin", ...}`
    Stdin(StdinCommand),
}

/// Which child stream a [`ServerMessage::Stream`] carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    /// Bytes from the child's stdout (or merged stderr).
    Stdout,
    /// Bytes from the child's stderr.
    Stderr,
}

/// Every message the server may send, tagged on the wire by `type`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// A chunk of child stdout/stderr output.
    Stdout {
        /// base64-encoded bytes.
        data: String,
    },
    /// A chunk of child stderr output (only ever sent when stderr is not
    /// merged into stdout).
    Stderr {
        /// base64-encoded bytes.
        data: String,
    },
    /// The terminal message of a session: the child's exit code.
    Exit {
        /// The exit code. See [`crate::supervisor::exit_code_for`] for how
        /// signal termination is mapped into this field.
        code: i32,
    },
}

impl ServerMessage {
    /// Build a stream message from raw bytes, base64-encoding the payload.
    pub fn stream(kind: StreamKind, data: &[u8]) -> Self {
        let encoded = STANDARD.encode(data);
        match kind {
            StreamKind::Stdout => ServerMessage::Stdout { data: encoded },
            StreamKind::Stderr => ServerMessage::Stderr { data: encoded },
        }
    }

    /// Build the terminal exit message.
    pub fn exit(code: i32) -> Self {
        ServerMessage::Exit { code }
    }

    /// Serialize to a single-line JSON string, the wire format for a
    /// WebSocket text frame.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Pluggable validation of inbound client messages.
///
/// Implementations are constructor-injected into the service endpoint rather
/// than selected through process-global state, so tests can swap validators
/// freely.
pub trait MessageValidator: Send + Sync {
    /// Validate a raw JSON value before it is interpreted as a
    /// [`ClientMessage`]. Returns an error describing the first violation
    /// found.
    fn validate(&self, raw: &serde_json::Value) -> Result<()>;
}

/// Default validator: accepts any value that later deserializes into a
/// [`ClientMessage`]. Performs no structural checks of its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopValidator;

impl MessageValidator for NoopValidator {
    fn validate(&self, _raw: &serde_json::Value) -> Result<()> {
        Ok(())
    }
}

/// Full structural validator mirroring the JSON-Schema rules of the original
/// `schema.py` (`SERVER_COMMANDS`): required fields, enum membership, and
/// numeric bounds for `chunk_size`/`signum`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchemaValidator;

impl MessageValidator for SchemaValidator {
    fn validate(&self, raw: &serde_json::Value) -> Result<()> {
        let obj = raw
            .as_object()
            .ok_or_else(|| anyhow::anyhow!(CwcError::Protocol("message must be an object".into())))?;

        let ty = obj
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!(CwcError::Protocol("missing `type` field".into())))?;

        match ty {
            "run" => {
                if !obj.get("args").is_some_and(|v| v.is_array()) {
                    anyhow::bail!(CwcError::Protocol("`run` requires an `args` array".into()));
                }
                if let Some(cs) = obj.get("chunk_size") {
                    let n = cs
                        .as_f64()
                        .ok_or_else(|| anyhow::anyhow!(CwcError::Protocol("`chunk_size` must be numeric".into())))?;
                    if n <= 0.0 {
                        anyhow::bail!(CwcError::Protocol("`chunk_size` must be positive".into()));
                    }
                }
                if let Some(stdout) = obj.get("stdout").and_then(|v| v.as_str()) {
                    if !matches!(stdout, "pipe" | "null") {
                        anyhow::bail!(CwcError::Protocol(format!("invalid `stdout` value: {stdout}")));
                    }
                }
                if let Some(stderr) = obj.get("stderr").and_then(|v| v.as_str()) {
                    if !matches!(stderr, "pipe" | "null" | "stdout") {
                        anyhow::bail!(CwcError::Protocol(format!("invalid `stderr` value: {stderr}")));
                    }
                }
                Ok(())
            }
            "signal" => {
                let signum = obj
                    .get("signum")
                    .and_then(|v| v.as_f64())
                    .ok_or_else(|| anyhow::anyhow!(CwcError::Protocol("`signal` requires numeric `signum`".into())))?;
                if !(1.0..=32.0).contains(&signum) {
                    anyhow::bail!(CwcError::Protocol("`signum` must be in [1, 32]".into()));
                }
                Ok(())
            }
            "stdin" => {
                if !obj.get("data").is_some_and(|v| v.is_string()) {
                    anyhow::bail!(CwcError::Protocol("`stdin` requires string `data`".into()));
                }
                Ok(())
            }
            other => Err(anyhow::anyhow!(CwcError::Protocol(format!(
                "unknown command type: {other}"
            )))),
        }
    }
}

/// Decode a raw WebSocket text frame into a [`ClientMessage`], running it
/// through `validator` first.
///
/// Returns `Ok(None)` for a syntactically valid JSON object whose `type` is
/// not one of `run`/`signal`/`stdin` and therefore decodes to nothing the
/// protocol recognizes -- callers should log and drop, not treat this as
/// fatal, per the protocol-violation row of the error handling table.
pub fn decode_client_message(
    text: &str,
    validator: &dyn MessageValidator,
) -> Result<Option<ClientMessage>> {
    if text.len() > MAX_MESSAGE_BYTES {
        anyhow::bail!(CwcError::Protocol(format!(
            "message exceeds {MAX_MESSAGE_BYTES} bytes"
        )));
    }

    let raw: serde_json::Value = serde_json::from_str(text)?;
    validator.validate(&raw)?;

    match serde_json::from_value::<ClientMessage>(raw) {
        Ok(msg) => Ok(Some(msg)),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_run_command_with_defaults() {
        let text = r#"{"type":"run","args":["/bin/echo","hi"]}"#;
        let msg = decode_client_message(text, &NoopValidator).unwrap().unwrap();
        match msg {
            ClientMessage::Run(run) => {
                assert_eq!(run.args, vec!["/bin/echo", "hi"]);
                assert_eq!(run.chunk_size, DEFAULT_CHUNK_SIZE);
                assert_eq!(run.stdout, StdoutDisposition::Pipe);
                assert_eq!(run.stderr, StderrDisposition::Pipe);
                assert!(run.env.is_empty());
                assert!(run.files.is_empty());
            }
            _ => panic!("expected Run"),
        }
    }

    #[test]
    fn decodes_signal_command() {
        let text = r#"{"type":"signal","signum":15}"#;
        let msg = decode_client_message(text, &NoopValidator).unwrap().unwrap();
        match msg {
            ClientMessage::Signal(s) => assert_eq!(s.signum, 15),
            _ => panic!("expected Signal"),
        }
    }

    #[test]
    fn decodes_stdin_and_empty_means_close() {
        let text = r#"{"type":"stdin","data":""}"#;
        let msg = decode_client_message(text, &NoopValidator).unwrap().unwrap();
        match msg {
            ClientMessage::Stdin(cmd) => assert!(cmd.decode().unwrap().is_empty()),
            _ => panic!("expected Stdin"),
        }
    }

    #[test]
    fn stdin_decodes_base64_payload() {
        let encoded = STANDARD.encode(b"hello\n");
        let cmd = StdinCommand { data: encoded };
        assert_eq!(cmd.decode().unwrap(), b"hello\n");
    }

    #[test]
    fn unknown_type_decodes_to_none() {
        let text = r#"{"type":"ping"}"#;
        let msg = decode_client_message(text, &NoopValidator).unwrap();
        assert!(msg.is_none());
    }

    #[test]
    fn missing_type_is_an_error() {
        let text = r#"{"args":[]}"#;
        assert!(decode_client_message(text, &NoopValidator).is_err());
    }

    #[test]
    fn oversized_message_is_rejected() {
        let huge = "x".repeat(MAX_MESSAGE_BYTES + 1);
        assert!(decode_client_message(&huge, &NoopValidator).is_err());
    }

    #[test]
    fn schema_validator_rejects_bad_chunk_size() {
        let text = r#"{"type":"run","args":["a"],"chunk_size":-1}"#;
        assert!(decode_client_message(text, &SchemaValidator).is_err());
    }

    #[test]
    fn schema_validator_rejects_bad_signum() {
        let text = r#"{"type":"signal","signum":99}"#;
        assert!(decode_client_message(text, &SchemaValidator).is_err());
    }

    #[test]
    fn schema_validator_rejects_bad_stderr_enum() {
        let text = r#"{"type":"run","args":["a"],"stderr":"bogus"}"#;
        assert!(decode_client_message(text, &SchemaValidator).is_err());
    }

    #[test]
    fn schema_validator_accepts_well_formed_run() {
        let text = r#"{"type":"run","args":["a"],"stderr":"stdout","chunk_size":2048}"#;
        assert!(decode_client_message(text, &SchemaValidator).unwrap().is_some());
    }

    #[test]
    fn stream_message_round_trips_base64() {
        let msg = ServerMessage::stream(StreamKind::Stdout, b"abc");
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"type\":\"stdout\""));
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let data = value["data"].as_str().unwrap();
        assert_eq!(STANDARD.decode(data).unwrap(), b"abc");
    }

    #[test]
    fn exit_message_serializes_code() {
        let msg = ServerMessage::exit(7);
        let json = msg.to_json().unwrap();
        assert_eq!(json, r#"{"type":"exit","code":7}"#);
    }
}
