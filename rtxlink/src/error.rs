//! Error types for rtxlink.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Main error type for rtxlink operations.
#[derive(Error, Debug)]
pub enum Error {
    /// SSH transport-level errors (dial, handshake, disconnect).
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// No shell prompt was recognized before the timeout elapsed.
    #[error("Prompt not detected within {0:?}")]
    PromptTimeout(Duration),

    /// SSH authentication was rejected.
    #[error("Authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },

    /// The administrator password was rejected during elevation.
    #[error("Administrator authentication failed: {message}")]
    ElevationFailed { message: String },

    /// The device reported that the target object does not exist.
    ///
    /// This is a sentinel: callers treat "absent" differently from
    /// "error" and must be able to match on it without inspecting
    /// message text.
    #[error("Target object not found: {0}")]
    NotFound(String),

    /// The device rejected the command (syntax error, invalid parameter).
    #[error("Device rejected command '{key}': {message}")]
    CommandRejected { key: String, message: String },

    /// Output that completed normally but cannot be interpreted.
    #[error("Malformed response for command '{key}': {message}")]
    MalformedResponse { key: String, message: String },

    /// The command failed after exhausting the retry policy.
    #[error("Command '{key}' failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        key: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// The session pool has been shut down.
    #[error("Session pool is closed")]
    PoolClosed,

    /// No pooled session became available in time.
    #[error("Timed out after {0:?} waiting for a pooled session")]
    PoolTimeout(Duration),

    /// Bulk (SFTP) transfer failure.
    #[error("Bulk transfer failed: {0}")]
    BulkTransfer(String),

    /// The fetched configuration could not be parsed.
    #[error("Configuration parse error: {0}")]
    ConfigParse(String),

    /// Invalid client configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Transport layer errors (SSH connection, host-key checks, I/O).
#[derive(Error, Debug)]
pub enum TransportError {
    /// Failed to connect to host.
    #[error("Connection failed to {host}:{port}: {source}")]
    ConnectionFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// SSH handshake or protocol error.
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// SSH key error.
    #[error("SSH key error: {0}")]
    Key(String),

    /// The host key did not match the pinned key.
    #[error("Host key mismatch for {host}:{port}")]
    HostKeyMismatch { host: String, port: u16 },

    /// The host is not present in known_hosts.
    #[error("Unknown host key for {host}:{port}")]
    HostKeyUnknown { host: String, port: u16 },

    /// The host key changed from the recorded known_hosts entry.
    #[error("Host key for {host}:{port} changed (known_hosts line {line})")]
    HostKeyChanged { host: String, port: u16, line: usize },

    /// known_hosts file access or format error.
    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    /// Connection was closed unexpectedly.
    #[error("Connection disconnected")]
    Disconnected,

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failure classification driving retry decisions.
///
/// Derived once from the error that detected the condition and carried
/// through the executor, instead of re-derived from message text at
/// every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Connection refused/reset, handshake failure. Retryable.
    Transport,
    /// Prompt not recognized before the timeout. Retryable.
    Protocol,
    /// Credential rejected (login or administrator). Never retried.
    Auth,
    /// Device reports the target object does not exist. Never retried.
    NotFound,
    /// Response completed but cannot be interpreted. Never retried.
    Malformed,
    /// Everything else (rejected command, pool shutdown, bad config).
    Fatal,
}

impl FailureKind {
    /// Whether a failure of this kind may be retried at all.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Transport | FailureKind::Protocol)
    }
}

impl Error {
    /// Classify this error for retry purposes.
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Transport(_) | Error::PoolTimeout(_) => FailureKind::Transport,
            Error::PromptTimeout(_) => FailureKind::Protocol,
            Error::AuthenticationFailed { .. } | Error::ElevationFailed { .. } => FailureKind::Auth,
            Error::NotFound(_) => FailureKind::NotFound,
            Error::MalformedResponse { .. } => FailureKind::Malformed,
            Error::RetriesExhausted { source, .. } => source.kind(),
            _ => FailureKind::Fatal,
        }
    }
}

/// Result type alias using rtxlink's Error.
pub type Result<T> = std::result::Result<T, Error>;
