//! Client facade tying the pool, executor, lock registry and snapshot
//! cache together.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use secrecy::SecretString;
use tokio::sync::OwnedMutexGuard;

use crate::channel::{PromptDetector, RtxPromptDetector};
use crate::error::{Error, Result};
use crate::executor::{Command, CommandExecutor, CommandResult, NoRetry, RetryPolicy};
use crate::lock::KeyedMutex;
use crate::session::{Connector, PoolStats, SessionPool, SshConnector};
use crate::snapshot::{
    ConfigParser, ConfigSnapshot, RtxConfigParser, SnapshotCache, config_path_from_environment,
};
use crate::transport::{AuthMethod, HostKeyVerification, PoolConfig, TargetConfig};

/// One router, one client.
///
/// Cheap to share behind an `Arc`; all state (pool, locks, cache) is
/// internally synchronized.
pub struct RtxClient {
    config: Arc<TargetConfig>,
    pool: Arc<SessionPool>,
    executor: CommandExecutor,
    connector: Arc<dyn Connector>,
    parser: Arc<dyn ConfigParser>,
    locks: KeyedMutex,
    cache: SnapshotCache,
}

impl RtxClient {
    pub fn builder(host: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(host)
    }

    /// Run one command through the pool.
    pub async fn run(&self, cmd: &Command) -> Result<CommandResult> {
        self.executor.run(cmd).await
    }

    /// Run a command sequence on a single session.
    pub async fn run_batch(&self, cmds: &[Command]) -> Result<Vec<CommandResult>> {
        self.executor.run_batch(cmds).await
    }

    /// Lock a router object for the duration of the returned guard.
    ///
    /// Callers mutating the same object (one DHCP scope, one tunnel)
    /// must serialize through this before issuing their batch.
    pub async fn lock_object(&self, key: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(key).await
    }

    /// Closure form of [`RtxClient::lock_object`].
    pub async fn with_object_lock<F, Fut, T>(&self, key: &str, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.locks.with_lock(key, f).await
    }

    /// The current configuration snapshot.
    ///
    /// `Ok(None)` means the bulk channel is disabled for this target;
    /// that is an availability statement, not a failure. Otherwise a
    /// fresh, clean cached snapshot is served, or the config file is
    /// fetched over SFTP, parsed, cached and returned.
    pub async fn snapshot(&self) -> Result<Option<Arc<ConfigSnapshot>>> {
        if !self.config.bulk_channel {
            return Ok(None);
        }
        if let Some(snapshot) = self.cache.get() {
            debug!("serving cached config snapshot");
            return Ok(Some(snapshot));
        }

        let path = match &self.config.bulk_path {
            Some(path) => path.clone(),
            None => self.resolve_config_path().await,
        };

        let raw = self.connector.fetch_file(&self.config, &path).await?;
        let text = String::from_utf8_lossy(&raw).into_owned();
        let parsed = self.parser.parse(&text)?;
        info!(
            "config snapshot fetched from {path}: {} commands",
            parsed.command_count()
        );
        Ok(Some(self.cache.store(parsed)))
    }

    /// Mark the cached snapshot stale. Call after any mutation that
    /// bypasses [`RtxClient::save_config`].
    pub fn mark_config_dirty(&self) {
        self.cache.mark_dirty();
    }

    /// Persist the running configuration and mark the snapshot cache
    /// dirty, since the saved file now differs from whatever was
    /// cached.
    pub async fn save_config(&self) -> Result<()> {
        self.executor
            .run(&Command::new("save-config", "save"))
            .await?;
        self.cache.mark_dirty();
        Ok(())
    }

    /// Where the active configuration lives on the SFTP side.
    ///
    /// Falls back to `/system/config0` when `show environment` fails
    /// or its output is unparseable.
    async fn resolve_config_path(&self) -> String {
        match self
            .executor
            .run(&Command::new("show-environment", "show environment"))
            .await
        {
            Ok(result) => config_path_from_environment(&result.body),
            Err(e) => {
                debug!("config path resolution failed ({e}), using default");
                crate::snapshot::DEFAULT_CONFIG_PATH.to_string()
            }
        }
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Shut the session pool down. Outstanding leases close their
    /// sessions on release.
    pub async fn close(&self) {
        self.pool.shutdown().await;
    }
}

/// Builder for [`RtxClient`].
///
/// # Example
///
/// ```rust,no_run
/// use rtxlink::RtxClient;
///
/// # async fn example() -> Result<(), rtxlink::Error> {
/// let client = RtxClient::builder("192.168.100.1")
///     .username("admin")
///     .password("secret")
///     .admin_password("secret")
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct ClientBuilder {
    host: String,
    port: u16,
    username: Option<String>,
    auth: Option<AuthMethod>,
    admin_password: Option<SecretString>,
    connect_timeout: Duration,
    command_timeout: Duration,
    host_key_verification: HostKeyVerification,
    pool: PoolConfig,
    bulk_channel: bool,
    bulk_path: Option<String>,
    detector: Option<Arc<dyn PromptDetector>>,
    retry: Option<Arc<dyn RetryPolicy>>,
    parser: Option<Arc<dyn ConfigParser>>,
    connector: Option<Arc<dyn Connector>>,
}

impl ClientBuilder {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 22,
            username: None,
            auth: None,
            admin_password: None,
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(30),
            host_key_verification: HostKeyVerification::default(),
            pool: PoolConfig::default(),
            bulk_channel: false,
            bulk_path: None,
            detector: None,
            retry: None,
            parser: None,
            connector: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Password authentication.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.auth = Some(AuthMethod::Password(password.into().into()));
        self
    }

    /// Private key authentication.
    pub fn private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.auth = Some(AuthMethod::PrivateKey {
            path: path.into(),
            passphrase: None,
        });
        self
    }

    pub fn private_key_with_passphrase(
        mut self,
        path: impl Into<PathBuf>,
        passphrase: impl Into<String>,
    ) -> Self {
        self.auth = Some(AuthMethod::PrivateKey {
            path: path.into(),
            passphrase: Some(passphrase.into().into()),
        });
        self
    }

    /// The administrator-mode password. Commands default to elevated
    /// execution once this is set.
    pub fn admin_password(mut self, password: impl Into<String>) -> Self {
        self.admin_password = Some(password.into().into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Per-command response timeout.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn host_key_verification(mut self, verification: HostKeyVerification) -> Self {
        self.host_key_verification = verification;
        self
    }

    /// Session pool limits. `max_sessions` must match what the
    /// hardware accepts.
    pub fn pool_config(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Enable the bulk SFTP channel for configuration reads. Off by
    /// default; without it [`RtxClient::snapshot`] reports the
    /// snapshot as unavailable. Requires `sftpd host` to be configured
    /// on the router.
    pub fn with_bulk_channel(mut self) -> Self {
        self.bulk_channel = true;
        self
    }

    /// Pin the remote config file path instead of resolving it from
    /// `show environment`.
    pub fn bulk_path(mut self, path: impl Into<String>) -> Self {
        self.bulk_path = Some(path.into());
        self
    }

    /// Replace the prompt detection strategy.
    pub fn prompt_detector(mut self, detector: Arc<dyn PromptDetector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// Replace the retry policy (default: no retries).
    pub fn retry_policy(mut self, retry: Arc<dyn RetryPolicy>) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Replace the config file parser.
    pub fn config_parser(mut self, parser: Arc<dyn ConfigParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    /// Replace the connection factory. Tests inject scripted shells
    /// here.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Build the client. Does not connect; the first lease does.
    pub fn build(self) -> Result<RtxClient> {
        let username = self
            .username
            .ok_or_else(|| Error::InvalidConfig("username is required".into()))?;
        let auth = self
            .auth
            .ok_or_else(|| Error::InvalidConfig("an authentication method is required".into()))?;
        if self.pool.max_sessions == 0 {
            return Err(Error::InvalidConfig(
                "pool.max_sessions must be at least 1".into(),
            ));
        }

        let config = Arc::new(TargetConfig {
            host: self.host,
            port: self.port,
            username,
            auth,
            admin_password: self.admin_password,
            connect_timeout: self.connect_timeout,
            command_timeout: self.command_timeout,
            host_key_verification: self.host_key_verification,
            pool: self.pool,
            bulk_channel: self.bulk_channel,
            bulk_path: self.bulk_path,
        });

        let detector = self
            .detector
            .unwrap_or_else(|| Arc::new(RtxPromptDetector::new()));
        let retry = self.retry.unwrap_or_else(|| Arc::new(NoRetry));
        let parser = self
            .parser
            .unwrap_or_else(|| Arc::new(RtxConfigParser::new()));
        let connector = self.connector.unwrap_or_else(|| Arc::new(SshConnector));

        let pool = Arc::new(SessionPool::new(
            (*config).clone(),
            connector.clone(),
            detector.clone(),
        ));
        let executor = CommandExecutor::new(pool.clone(), config.clone(), detector, retry);

        Ok(RtxClient {
            config,
            pool,
            executor,
            connector,
            parser,
            locks: KeyedMutex::new(),
            cache: SnapshotCache::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{ScriptedConnector, ScriptedShell};

    fn scripted_client(connector: ScriptedConnector) -> RtxClient {
        RtxClient::builder("192.0.2.1")
            .username("admin")
            .password("admin")
            .with_bulk_channel()
            .connector(Arc::new(connector))
            .build()
            .unwrap()
    }

    fn shell_with(replies: &[&[u8]]) -> ScriptedShell {
        let mut scripted = vec![vec![b"console character en.ascii\r\n> ".to_vec()]];
        scripted.extend(replies.iter().map(|r| vec![r.to_vec()]));
        ScriptedShell::new(b"> ", scripted)
    }

    #[test]
    fn build_requires_credentials() {
        assert!(matches!(
            RtxClient::builder("192.0.2.1").password("x").build(),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            RtxClient::builder("192.0.2.1").username("admin").build(),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn snapshot_is_unavailable_unless_bulk_channel_is_enabled() {
        // No `with_bulk_channel()`: the default client must report the
        // snapshot unavailable instead of attempting an SFTP fetch.
        let client = RtxClient::builder("192.0.2.1")
            .username("admin")
            .password("admin")
            .connector(Arc::new(ScriptedConnector::new(vec![])))
            .build()
            .unwrap();

        assert!(client.snapshot().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_resolves_the_path_fetches_and_caches() {
        let shell = shell_with(&[
            b"show environment\r\nDefault config file: config1\r\n> " as &[u8],
        ]);
        let connector = ScriptedConnector::new(vec![shell])
            .with_file(b"ip route default gateway 192.168.100.1\ndhcp service server\n");
        let client = scripted_client(connector);

        let snapshot = client.snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.parsed.command_count(), 2);

        // Second call is served from cache: the scripted shell has no
        // replies left, so a refetch would fail.
        let again = client.snapshot().await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&snapshot, &again));
    }

    #[tokio::test]
    async fn pinned_bulk_path_skips_resolution() {
        let connector =
            ScriptedConnector::new(vec![]).with_file(b"dhcp service server\n");
        let client = RtxClient::builder("192.0.2.1")
            .username("admin")
            .password("admin")
            .with_bulk_channel()
            .bulk_path("/system/config2")
            .connector(Arc::new(connector))
            .build()
            .unwrap();

        let snapshot = client.snapshot().await.unwrap().unwrap();
        assert_eq!(snapshot.parsed.command_count(), 1);
    }

    #[tokio::test]
    async fn save_config_marks_the_snapshot_dirty() {
        let shell = shell_with(&[
            b"show environment\r\nDefault config file: config0\r\n> " as &[u8],
            b"save\r\nSaving ... CONFIG0 Done .\r\n> ",
            b"show environment\r\nDefault config file: config0\r\n> ",
        ]);
        let connector =
            ScriptedConnector::new(vec![shell]).with_file(b"dhcp service server\n");
        let client = scripted_client(connector);

        let first = client.snapshot().await.unwrap().unwrap();
        client.save_config().await.unwrap();
        let second = client.snapshot().await.unwrap().unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn close_shuts_the_pool_down() {
        let client = scripted_client(ScriptedConnector::new(vec![]));
        client.close().await;
        let err = client
            .run(&Command::new("show-status", "show status"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolClosed));
    }
}
