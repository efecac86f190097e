//! Error types for the CWC server
//!
//! This module defines all error types used throughout the server, using
//! `thiserror` for ergonomic error handling.

use thiserror::Error;

/// Main error type for CWC server operations.
#[derive(Error, Debug)]
pub enum CwcError {
    /// Configuration-related errors (missing/invalid fields, bad file).
    #[error("Configuration error: {0}")]
    Config(String),

    /// The inbound WebSocket frame did not parse as a known command.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A `files` entry attempted to escape the staging directory.
    #[error("Path traversal attempt rejected: {0}")]
    PathTraversal(String),

    /// Creating or populating the staging directory failed.
    #[error("Staging error: {0}")]
    Staging(String),

    /// The child process could not be spawned.
    #[error("Spawn error for {argv:?}: {source}")]
    Spawn {
        /// The argv that failed to spawn.
        argv: Vec<String>,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// Sending a signal to the child process failed for a reason other than
    /// "process already exited" (which is ignored, not an error).
    #[error("Signal delivery error: {0}")]
    Signal(String),

    /// Service advertisement (publisher) start/stop failed.
    #[error("Publisher error: {0}")]
    Publisher(String),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML config parsing errors.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for CWC server operations.
///
/// This is a convenience alias that uses `anyhow::Error` as the error type,
/// allowing for rich error context and easy error propagation.
pub type Result<T> = anyhow::Result<T>;
