//! SSH transport implementation using russh.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use russh::Channel;
use russh::client::{self, Handle, Msg};
use russh::keys::{PrivateKeyWithHashAlg, PublicKey, load_secret_key};
use secrecy::ExposeSecret;

use super::config::{AuthMethod, HostKeyVerification, TargetConfig};
use crate::error::{Error, Result, TransportError};

/// SSH transport wrapping a russh client connection.
///
/// One transport corresponds to one TCP connection. Interactive shell
/// channels and SFTP channels are multiplexed on top of it.
pub struct SshTransport {
    /// The russh session handle.
    session: Handle<SshHandler>,
}

impl SshTransport {
    /// Connect to the router and authenticate.
    pub async fn connect(config: &TargetConfig) -> Result<Self> {
        let ssh_config = Arc::new(client::Config::default());

        let host_key_error: Arc<Mutex<Option<TransportError>>> = Arc::new(Mutex::new(None));

        let handler = SshHandler {
            host: config.host.clone(),
            port: config.port,
            verification: config.host_key_verification.clone(),
            host_key_error: host_key_error.clone(),
        };

        debug!("connecting to {}", config.socket_addr());

        let mut session = tokio::time::timeout(
            config.connect_timeout,
            client::connect(ssh_config, (config.host.as_str(), config.port), handler),
        )
        .await
        .map_err(|_| TransportError::Timeout(config.connect_timeout))?
        .map_err(|e| {
            // If check_server_key stored a detailed error, use that instead
            // of the generic russh::Error::UnknownKey
            if let Some(hk_err) = host_key_error.lock().unwrap().take() {
                hk_err
            } else {
                TransportError::Ssh(e)
            }
        })?;

        Self::authenticate(&mut session, config).await?;

        Ok(Self { session })
    }

    /// Open an interactive shell channel with a vt100 PTY.
    ///
    /// RTX firmware paginates and echoes based on the PTY geometry, so
    /// the dimensions are fixed rather than configurable.
    pub async fn open_shell_channel(&self) -> Result<Channel<Msg>> {
        let channel = self
            .session
            .channel_open_session()
            .await
            .map_err(TransportError::Ssh)?;

        channel
            .request_pty(true, "vt100", 80, 25, 0, 0, &[])
            .await
            .map_err(TransportError::Ssh)?;

        channel
            .request_shell(true)
            .await
            .map_err(TransportError::Ssh)?;

        Ok(channel)
    }

    /// Open a channel running the SFTP subsystem.
    pub async fn open_sftp_channel(&self) -> Result<Channel<Msg>> {
        let channel = self
            .session
            .channel_open_session()
            .await
            .map_err(TransportError::Ssh)?;

        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(TransportError::Ssh)?;

        Ok(channel)
    }

    /// Authenticate with the router.
    async fn authenticate(session: &mut Handle<SshHandler>, config: &TargetConfig) -> Result<()> {
        let success = match &config.auth {
            AuthMethod::Password(password) => session
                .authenticate_password(&config.username, password.expose_secret())
                .await
                .map_err(TransportError::Ssh)?
                .success(),
            AuthMethod::PrivateKey { path, passphrase } => {
                let key = load_secret_key(
                    path,
                    passphrase.as_ref().map(|p| p.expose_secret()),
                )
                .map_err(|e| TransportError::Key(e.to_string()))?;

                // Get the best RSA hash algorithm supported by the server
                let hash_alg = session
                    .best_supported_rsa_hash()
                    .await
                    .map_err(TransportError::Ssh)?
                    .flatten();

                session
                    .authenticate_publickey(
                        &config.username,
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg),
                    )
                    .await
                    .map_err(TransportError::Ssh)?
                    .success()
            }
        };

        if !success {
            return Err(Error::AuthenticationFailed {
                user: config.username.clone(),
            });
        }

        Ok(())
    }

    /// Close the connection.
    pub async fn close(self) -> Result<()> {
        self.session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
            .map_err(TransportError::Ssh)?;
        Ok(())
    }
}

/// SSH client handler for russh.
struct SshHandler {
    host: String,
    port: u16,
    verification: HostKeyVerification,
    /// Stores a detailed host-key error so connect() can surface it
    /// instead of the generic russh::Error::UnknownKey.
    host_key_error: Arc<Mutex<Option<TransportError>>>,
}

impl SshHandler {
    /// Check the host key against known_hosts.
    ///
    /// Returns `Ok(true)` if matched, `Ok(false)` if the host is not
    /// present, `Err(TransportError::HostKeyChanged)` if the key changed.
    fn check_known_hosts(
        &self,
        path: &Option<PathBuf>,
        pubkey: &PublicKey,
    ) -> std::result::Result<bool, TransportError> {
        let result = if let Some(path) = path {
            russh::keys::check_known_hosts_path(&self.host, self.port, pubkey, path)
        } else {
            russh::keys::check_known_hosts(&self.host, self.port, pubkey)
        };

        match result {
            Ok(matched) => Ok(matched),
            Err(russh::keys::Error::KeyChanged { line }) => Err(TransportError::HostKeyChanged {
                host: self.host.clone(),
                port: self.port,
                line,
            }),
            Err(e) => Err(TransportError::KnownHosts(e.to_string())),
        }
    }

    fn reject(&self, err: TransportError) {
        *self.host_key_error.lock().unwrap() = Some(err);
    }
}

impl client::Handler for SshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match &self.verification {
            HostKeyVerification::Disabled => {
                warn!(
                    "host key verification disabled for {}:{}",
                    self.host, self.port
                );
                Ok(true)
            }

            HostKeyVerification::Pinned(expected) => {
                // Pinned keys may be a full openssh line or just its
                // base64 key field.
                let matched = match PublicKey::from_openssh(expected.trim()) {
                    Ok(pinned) => pinned.key_data() == server_public_key.key_data(),
                    Err(_) => server_public_key
                        .to_openssh()
                        .map(|line| {
                            line.split_whitespace().any(|field| field == expected.trim())
                        })
                        .unwrap_or(false),
                };
                if matched {
                    Ok(true)
                } else {
                    self.reject(TransportError::HostKeyMismatch {
                        host: self.host.clone(),
                        port: self.port,
                    });
                    Ok(false)
                }
            }

            HostKeyVerification::KnownHosts(path) => {
                match self.check_known_hosts(path, server_public_key) {
                    Ok(true) => Ok(true),
                    Ok(false) => {
                        self.reject(TransportError::HostKeyUnknown {
                            host: self.host.clone(),
                            port: self.port,
                        });
                        Ok(false)
                    }
                    Err(e) => {
                        self.reject(e);
                        Ok(false)
                    }
                }
            }
        }
    }
}
