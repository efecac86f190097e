//! Cloud-Workstation-Companion (CWC) server library
//!
//! A bidirectional WebSocket service that accepts a `run` request from a
//! remote client, materializes the supplied source files on disk, spawns the
//! requested child process, and streams its stdout/stderr back to the client
//! while forwarding stdin bytes and signal requests to the child.
//!
//! The library is organized into the following modules:
//!
//! - `codec`: wire protocol, message types, and pluggable validation
//! - `staging`: per-session temporary directory and path safety
//! - `supervisor`: child process spawn/signal/kill and exit code mapping
//! - `multiplex`: the stdout/stderr/stdin/wait coordination core
//! - `session`: the per-connection state machine
//! - `service`: the `GET /spawn` route, session registry, and mDNS publisher
//! - `config`: configuration file/env/CLI layering
//! - `error`: error types and the crate-wide `Result` alias
//! - `cli`: command-line interface definition

pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod multiplex;
pub mod service;
pub mod session;
pub mod staging;
pub mod supervisor;

pub use config::Config;
pub use error::{CwcError, Result};
