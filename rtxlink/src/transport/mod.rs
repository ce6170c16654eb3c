//! SSH transport layer.
//!
//! Wraps russh with RTX-appropriate defaults: a vt100 PTY for the
//! interactive shell and an SFTP subsystem channel for bulk
//! configuration reads.

mod config;
mod sftp;
mod ssh;

pub use config::{AuthMethod, HostKeyVerification, PoolConfig, TargetConfig};
pub use sftp::fetch_file;
pub use ssh::SshTransport;
