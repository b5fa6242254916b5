//! Typed error kinds for the daemon core.
//!
//! The core returns [`ShareTtyError`]; `main.rs` converts to `anyhow::Error`
//! at the CLI boundary and maps variants back to process exit codes.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the session multiplexer and its collaborators.
#[derive(Debug, Error)]
pub enum ShareTtyError {
    /// Config file could not be read or parsed as JSON (exit code 2).
    #[error("config parse error: {0}")]
    ConfigParse(String),

    /// Startup configuration parsed but failed validation (exit code 6):
    /// bad rec dir, invalid TTL, ...
    #[error("config error: {0}")]
    Config(String),

    /// Bad credential or malformed init frame during the upgrade handshake.
    #[error("auth error: {0}")]
    Auth(String),

    /// Unknown opcode, malformed JSON, or oversize frame on a transport.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A session, parent, or recording could not be found.
    #[error("lookup error: {0}")]
    Lookup(String),

    /// A policy check (CIDR, share, write) rejected the operation.
    #[error("policy error: {0}")]
    Policy(String),

    /// Underlying I/O failure (PTY, recorder, transport, accept).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The child process failed to start.
    #[error("spawn error: {0}")]
    Spawn(String),
}

impl ShareTtyError {
    /// Lookup error naming a missing session key.
    pub fn missing_session(name: &str, addr: &str) -> Self {
        Self::Lookup(format!("no session for ({name}, {addr})"))
    }

    /// Lookup error naming a recording file that could not be found.
    pub fn missing_recording(path: &PathBuf) -> Self {
        Self::Lookup(format!("recording not found: {}", path.display()))
    }

    /// Policy error: remote address rejected by the session's CIDR filter.
    pub fn address_rejected(addr: &str) -> Self {
        Self::Policy(format!("{addr} is not permitted by this session's nets"))
    }

    /// Exit code this error should map to at the CLI boundary (§6).
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigParse(_) => 2,
            Self::Config(_) => 6,
            Self::Spawn(_) => 3,
            Self::Auth(_) | Self::Protocol(_) | Self::Lookup(_) | Self::Policy(_) | Self::Io(_) => 4,
        }
    }
}

pub type Result<T> = std::result::Result<T, ShareTtyError>;
