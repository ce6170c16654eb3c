//! Target and connection configuration.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

/// Host key verification mode.
#[derive(Debug, Clone, Default)]
pub enum HostKeyVerification {
    /// Compare against a pinned public key (openssh/base64 encoded).
    Pinned(String),

    /// Check against a known_hosts file; `None` means the user default.
    /// Unknown and changed keys are rejected.
    KnownHosts(Option<PathBuf>),

    /// Accept all keys without checking. For lab use only.
    #[default]
    Disabled,
}

/// Authentication method for the SSH login.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// Password authentication.
    Password(SecretString),

    /// Private key authentication.
    PrivateKey {
        /// Path to the private key file.
        path: PathBuf,
        /// Optional passphrase for encrypted keys.
        passphrase: Option<SecretString>,
    },
}

/// Session pool sizing and lifecycle limits.
///
/// RTX hardware accepts only a small fixed number of concurrent
/// interactive connections, so `max_sessions` is a correctness ceiling,
/// not a tuning knob.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum concurrent sessions (hardware ceiling).
    pub max_sessions: usize,

    /// Close idle sessions after this long.
    pub idle_timeout: Duration,

    /// Maximum wait for a session lease.
    pub acquire_timeout: Duration,

    /// How often the background reaper scans for stale idle sessions.
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: 2,
            idle_timeout: Duration::from_secs(5 * 60),
            acquire_timeout: Duration::from_secs(30),
            reap_interval: Duration::from_secs(30),
        }
    }
}

/// Immutable description of one target router.
#[derive(Debug, Clone)]
pub struct TargetConfig {
    /// Target host (hostname or IP address).
    pub host: String,

    /// SSH port (default: 22).
    pub port: u16,

    /// Username for authentication.
    pub username: String,

    /// Authentication method.
    pub auth: AuthMethod,

    /// Administrator password for elevated mode, if configured.
    pub admin_password: Option<SecretString>,

    /// Connection establishment timeout.
    pub connect_timeout: Duration,

    /// Per-command response timeout.
    pub command_timeout: Duration,

    /// Host key verification mode.
    pub host_key_verification: HostKeyVerification,

    /// Session pool limits.
    pub pool: PoolConfig,

    /// Whether the bulk SFTP channel may be used for configuration reads.
    pub bulk_channel: bool,

    /// Remote path of the configuration file. When unset, the path is
    /// resolved from `show environment` output.
    pub bulk_path: Option<String>,
}

impl TargetConfig {
    /// Get the socket address for connection.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
