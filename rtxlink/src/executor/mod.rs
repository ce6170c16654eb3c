//! Command execution over pooled sessions.

mod retry;

pub use retry::{ExponentialBackoff, FixedDelay, NoRetry, RetryPolicy};

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use secrecy::ExposeSecret;

use crate::channel::{PromptDetector, clean_response};
use crate::error::{Error, Result};
use crate::session::{Lease, SessionPool};
use crate::transport::TargetConfig;

/// Substrings RTX firmware uses to report a rejected command. The
/// device never sets an exit status, so rejection is text.
const REJECTION_PATTERNS: &[&str] = &[
    "Error:",
    "% Error:",
    "Command failed:",
    "Invalid parameter",
    "Permission denied",
    "Connection timeout",
    "already exists",
    "not found",
];

/// One command to run on the router.
#[derive(Debug, Clone)]
pub struct Command {
    /// Stable identifier used in errors and logs, not sent to the
    /// device.
    pub key: String,

    /// The exact line to type at the prompt.
    pub payload: String,

    /// Whether administrator mode is required. `None` follows the
    /// target default: elevated whenever an administrator password is
    /// configured, since RTX reports more complete state there.
    pub elevated: Option<bool>,
}

impl Command {
    pub fn new(key: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            payload: payload.into(),
            elevated: None,
        }
    }

    pub fn elevated(mut self, elevated: bool) -> Self {
        self.elevated = Some(elevated);
        self
    }
}

/// A completed command.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Cleaned response body: echo, pagination markers and trailing
    /// prompt removed.
    pub body: String,

    /// Wall time from write to prompt.
    pub elapsed: Duration,

    /// Whether the command ran in administrator mode.
    pub elevated: bool,
}

/// Runs commands through the session pool, applying the retry policy
/// and the failure taxonomy.
pub struct CommandExecutor {
    pool: Arc<SessionPool>,
    config: Arc<TargetConfig>,
    detector: Arc<dyn PromptDetector>,
    retry: Arc<dyn RetryPolicy>,
}

impl CommandExecutor {
    pub fn new(
        pool: Arc<SessionPool>,
        config: Arc<TargetConfig>,
        detector: Arc<dyn PromptDetector>,
        retry: Arc<dyn RetryPolicy>,
    ) -> Self {
        Self {
            pool,
            config,
            detector,
            retry,
        }
    }

    /// Run one command.
    ///
    /// Transport and protocol failures discard the session and consult
    /// the retry policy; authentication failures and device rejections
    /// fail fast. A rejection leaves the session healthy, because the
    /// shell is back at its prompt.
    pub async fn run(&self, cmd: &Command) -> Result<CommandResult> {
        self.with_retries(&cmd.key, || async move {
            let mut lease = self.lease_for(cmd.elevated).await?;
            let result = self.run_on(&mut lease, cmd).await;
            lease.release(!result_discards(&result)).await;
            result
        })
        .await
    }

    /// Run a command sequence on a single leased session, stopping at
    /// the first failure.
    ///
    /// Interdependent mutations (context selection followed by
    /// settings) must see each other, which pooled round-robin would
    /// break.
    pub async fn run_batch(&self, cmds: &[Command]) -> Result<Vec<CommandResult>> {
        if cmds.is_empty() {
            return Ok(Vec::new());
        }
        let elevated = cmds.iter().any(|c| self.wants_elevation(c.elevated));
        let key = &cmds[0].key;

        self.with_retries(key, || async move {
            let mut lease = self.lease_for(Some(elevated)).await?;
            let mut results = Vec::with_capacity(cmds.len());
            for cmd in cmds {
                match self.run_on(&mut lease, cmd).await {
                    Ok(result) => results.push(result),
                    Err(e) => {
                        lease.release(false).await;
                        return Err(e);
                    }
                }
            }
            lease.release(true).await;
            Ok(results)
        })
        .await
    }

    /// Lease a session elevated (or not) as required.
    async fn lease_for(&self, elevated: Option<bool>) -> Result<Lease> {
        let lease = self.pool.lease().await?;
        if self.wants_elevation(elevated) {
            self.ensure_elevated(lease).await
        } else {
            Ok(lease)
        }
    }

    async fn ensure_elevated(&self, mut lease: Lease) -> Result<Lease> {
        let Some(password) = &self.config.admin_password else {
            lease.release(true).await;
            return Err(Error::InvalidConfig(
                "administrator mode requested but no administrator password configured".into(),
            ));
        };
        match lease
            .elevate(
                password.expose_secret(),
                self.detector.as_ref(),
                self.config.command_timeout,
            )
            .await
        {
            Ok(()) => Ok(lease),
            Err(e) => {
                lease.release(false).await;
                Err(e)
            }
        }
    }

    fn wants_elevation(&self, elevated: Option<bool>) -> bool {
        elevated.unwrap_or(self.config.admin_password.is_some())
    }

    /// One attempt of one command on an already-leased session.
    async fn run_on(&self, lease: &mut Lease, cmd: &Command) -> Result<CommandResult> {
        let started = Instant::now();
        let raw = lease
            .execute(&cmd.payload, self.detector.as_ref(), self.config.command_timeout)
            .await?;
        let elapsed = started.elapsed();

        let body = clean_response(&raw, &cmd.payload, self.detector.as_ref());
        if let Some(err) = classify_output(&cmd.key, &body) {
            return Err(err);
        }

        debug!("command '{}' completed in {elapsed:?}", cmd.key);
        Ok(CommandResult {
            body,
            elapsed,
            elevated: lease.is_elevated(),
        })
    }

    async fn with_retries<T, F, Fut>(&self, key: &str, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match self.retry.next_delay(attempt, err.kind()) {
                Some(delay) => {
                    warn!(
                        "command '{key}' attempt {attempt} failed ({err}), retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
                None if attempt > 1 => {
                    return Err(Error::RetriesExhausted {
                        key: key.to_string(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                None => return Err(err),
            }
        }
    }
}

/// Whether the failed attempt poisoned the session.
///
/// Device rejections leave the shell at a clean prompt; everything
/// else means the channel state is unknown.
fn result_discards<T>(result: &Result<T>) -> bool {
    match result {
        Ok(_) => false,
        Err(Error::CommandRejected { .. })
        | Err(Error::NotFound(_))
        | Err(Error::MalformedResponse { .. }) => false,
        Err(_) => true,
    }
}

/// Map rejection text in an otherwise well-formed response to the
/// typed taxonomy. Absence ("not found") is its own sentinel so
/// callers can treat missing objects as state, not failure.
fn classify_output(key: &str, body: &str) -> Option<Error> {
    let line = body
        .lines()
        .find(|l| REJECTION_PATTERNS.iter().any(|p| l.contains(p)))?;

    if line.contains("not found") {
        return Some(Error::NotFound(line.trim().to_string()));
    }
    Some(Error::CommandRejected {
        key: key.to_string(),
        message: line.trim().to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::RtxPromptDetector;
    use crate::error::FailureKind;
    use crate::session::testing::{ScriptedConnector, ScriptedShell};
    use crate::transport::{AuthMethod, HostKeyVerification, PoolConfig};

    fn target(admin_password: Option<&str>) -> Arc<TargetConfig> {
        Arc::new(TargetConfig {
            host: "192.0.2.1".into(),
            port: 22,
            username: "admin".into(),
            auth: AuthMethod::Password("admin".to_string().into()),
            admin_password: admin_password.map(|p| p.to_string().into()),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            host_key_verification: HostKeyVerification::Disabled,
            pool: PoolConfig::default(),
            bulk_channel: false,
            bulk_path: None,
        })
    }

    fn executor(
        shells: Vec<ScriptedShell>,
        config: Arc<TargetConfig>,
        retry: Arc<dyn RetryPolicy>,
    ) -> (CommandExecutor, Arc<SessionPool>) {
        let detector: Arc<dyn PromptDetector> = Arc::new(RtxPromptDetector::new());
        let pool = Arc::new(SessionPool::new(
            (*config).clone(),
            Arc::new(ScriptedConnector::new(shells)),
            detector.clone(),
        ));
        (
            CommandExecutor::new(pool.clone(), config, detector, retry),
            pool,
        )
    }

    fn plain_shell(replies: &[&[u8]]) -> ScriptedShell {
        let mut scripted = vec![vec![b"console character en.ascii\r\n> ".to_vec()]];
        scripted.extend(replies.iter().map(|r| vec![r.to_vec()]));
        ScriptedShell::new(b"> ", scripted)
    }

    #[tokio::test]
    async fn run_returns_the_cleaned_body_and_reuses_the_session() {
        let shell = plain_shell(&[b"show status\r\nuptime 4 days\r\n> " as &[u8]]);
        let (executor, pool) = executor(vec![shell], target(None), Arc::new(NoRetry));

        let result = executor
            .run(&Command::new("show-status", "show status"))
            .await
            .unwrap();

        assert_eq!(result.body, "uptime 4 days");
        assert!(!result.elevated);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn rejection_fails_fast_and_keeps_the_session() {
        let shell = plain_shell(&[b"dhcp scope 1\r\nError: Invalid parameter\r\n> " as &[u8]]);
        let (executor, pool) = executor(vec![shell], target(None), Arc::new(NoRetry));

        let err = executor
            .run(&Command::new("dhcp-scope", "dhcp scope 1"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CommandRejected { .. }));
        assert_eq!(err.kind(), FailureKind::Fatal);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn absent_objects_surface_as_the_not_found_sentinel() {
        let shell = plain_shell(&[b"show dhcp scope 9\r\nscope not found\r\n> " as &[u8]]);
        let (executor, _pool) = executor(vec![shell], target(None), Arc::new(NoRetry));

        let err = executor
            .run(&Command::new("show-scope", "show dhcp scope 9"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::NotFound(_)));
        assert_eq!(err.kind(), FailureKind::NotFound);
    }

    #[tokio::test]
    async fn transport_failure_discards_and_retries_on_a_new_session() {
        // First session dies mid-command; the retry succeeds on a
        // fresh connection.
        let dying = ScriptedShell::new(
            b"> ",
            vec![vec![b"console character en.ascii\r\n> ".to_vec()]],
        )
        .eof_on_exhaust();
        let healthy = plain_shell(&[b"show status\r\nok\r\n> " as &[u8]]);

        let policy = Arc::new(FixedDelay {
            delay: Duration::from_millis(1),
            max_attempts: 3,
        });
        let (executor, pool) = executor(vec![dying, healthy], target(None), policy);

        let result = executor
            .run(&Command::new("show-status", "show status"))
            .await
            .unwrap();

        assert_eq!(result.body, "ok");
        assert_eq!(pool.stats().created, 2);
    }

    #[tokio::test]
    async fn exhausted_retries_wrap_the_last_error() {
        let dying = |_: usize| {
            ScriptedShell::new(
                b"> ",
                vec![vec![b"console character en.ascii\r\n> ".to_vec()]],
            )
            .eof_on_exhaust()
        };
        let policy = Arc::new(FixedDelay {
            delay: Duration::from_millis(1),
            max_attempts: 2,
        });
        let (executor, _pool) = executor(
            (0..2).map(dying).collect(),
            target(None),
            policy,
        );

        let err = executor
            .run(&Command::new("show-status", "show status"))
            .await
            .unwrap_err();

        match err {
            Error::RetriesExhausted { attempts, source, .. } => {
                assert_eq!(attempts, 2);
                assert_eq!(source.kind(), FailureKind::Transport);
            }
            other => panic!("expected RetriesExhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn commands_default_to_administrator_mode_when_configured() {
        let shell = ScriptedShell::new(
            b"> ",
            vec![
                vec![b"console character en.ascii\r\n> ".to_vec()],
                vec![b"administrator\r\nPassword: ".to_vec()],
                vec![b"\r\n# ".to_vec()],
                vec![b"show config\r\nip route...\r\n# ".to_vec()],
            ],
        );
        let (executor, _pool) = executor(vec![shell], target(Some("secret")), Arc::new(NoRetry));

        let result = executor
            .run(&Command::new("show-config", "show config"))
            .await
            .unwrap();

        assert!(result.elevated);
        assert_eq!(result.body, "ip route...");
    }

    #[tokio::test]
    async fn elevation_without_a_password_is_a_config_error() {
        let shell = plain_shell(&[]);
        let (executor, _pool) = executor(vec![shell], target(None), Arc::new(NoRetry));

        let err = executor
            .run(&Command::new("save", "save").elevated(true))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn batch_runs_every_command_on_one_session() {
        let shell = plain_shell(&[
            b"tunnel select 1\r\n> " as &[u8],
            b"ip tunnel mtu 1400\r\n> ",
            b"tunnel enable 1\r\n> ",
        ]);
        let (executor, pool) = executor(vec![shell], target(None), Arc::new(NoRetry));

        let cmds = vec![
            Command::new("tunnel", "tunnel select 1").elevated(false),
            Command::new("tunnel", "ip tunnel mtu 1400").elevated(false),
            Command::new("tunnel", "tunnel enable 1").elevated(false),
        ];
        let results = executor.run_batch(&cmds).await.unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(pool.stats().created, 1);
    }

    #[tokio::test]
    async fn batch_stops_at_the_first_rejection() {
        let shell = plain_shell(&[
            b"tunnel select 1\r\n> " as &[u8],
            b"bogus\r\nError: Invalid parameter\r\n> ",
        ]);
        let (executor, pool) = executor(vec![shell], target(None), Arc::new(NoRetry));

        let cmds = vec![
            Command::new("tunnel", "tunnel select 1").elevated(false),
            Command::new("tunnel", "bogus").elevated(false),
            Command::new("tunnel", "tunnel enable 1").elevated(false),
        ];
        let err = executor.run_batch(&cmds).await.unwrap_err();

        assert!(matches!(err, Error::CommandRejected { .. }));
        // The failed batch does not leave its session behind.
        assert_eq!(pool.stats().idle, 0);
    }
}
