//! Interactive sessions and the bounded session pool.

mod pool;
mod shell;

pub use pool::{Lease, PoolStats, SessionPool};
pub use shell::{Connector, Shell, SshConnector};

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::channel::{PatternBuffer, PromptDetector, PromptSignal};
use crate::error::{Error, Result, TransportError};

/// Sent to continue paginated output.
const PAGE_CONTINUE: &[u8] = b" ";

/// One interactive shell session on a router.
///
/// Tracks whether administrator elevation has already been performed on
/// this connection, so pooled reuse does not re-elevate.
pub struct Session {
    shell: Box<dyn Shell>,
    id: u64,
    elevated: bool,
    last_used: Instant,
}

impl Session {
    /// Drive a freshly opened shell to a usable state: wait for the
    /// login banner to settle into a prompt, then switch the console to
    /// ASCII output so responses are parseable.
    pub async fn open(
        shell: Box<dyn Shell>,
        id: u64,
        detector: &dyn PromptDetector,
        timeout: Duration,
    ) -> Result<Self> {
        let mut session = Self {
            shell,
            id,
            elevated: false,
            last_used: Instant::now(),
        };

        session.read_until_prompt(detector, timeout).await?;

        // Firmware rejects this on some models; the session still works,
        // only Japanese text survives in responses.
        if let Err(e) = session.execute("console character en.ascii", detector, timeout).await {
            warn!("session {}: console character setup failed: {e}", session.id);
        }

        debug!("session {} ready", session.id);
        Ok(session)
    }

    /// Send one command and read until the prompt returns.
    ///
    /// Pagination prompts are answered with a space so multi-page
    /// output accumulates into a single response. Returns the raw
    /// output including the echo and trailing prompt.
    pub async fn execute(
        &mut self,
        payload: &str,
        detector: &dyn PromptDetector,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        self.last_used = Instant::now();

        let mut line = payload.as_bytes().to_vec();
        line.push(b'\r');
        self.shell.send(&line).await?;

        let mut buffer = PatternBuffer::default();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let chunk = self.recv_before(deadline, timeout).await?;
            buffer.extend(&chunk);

            match detector.inspect(buffer.as_slice()) {
                PromptSignal::Complete { .. } => {
                    self.last_used = Instant::now();
                    return Ok(buffer.take());
                }
                PromptSignal::Pagination => {
                    self.shell.send(PAGE_CONTINUE).await?;
                }
                PromptSignal::Pending => {}
            }
        }
    }

    /// Elevate to administrator mode.
    ///
    /// No-op when this session is already elevated. The transcript is
    /// `administrator` -> credential prompt -> password -> shell
    /// prompt, verified to be the elevated form with no rejection text.
    pub async fn elevate(
        &mut self,
        password: &str,
        detector: &dyn PromptDetector,
        timeout: Duration,
    ) -> Result<()> {
        if self.elevated {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + timeout;
        self.shell.send(b"administrator\r").await?;

        let mut buffer = PatternBuffer::default();
        loop {
            let chunk = self.recv_before(deadline, timeout).await?;
            buffer.extend(&chunk);
            if detector.auth_prompt(buffer.as_slice()) {
                break;
            }
        }

        let mut line = password.as_bytes().to_vec();
        line.push(b'\r');
        self.shell.send(&line).await?;

        buffer.clear();
        loop {
            let chunk = self.recv_before(deadline, timeout).await?;
            buffer.extend(&chunk);
            if let PromptSignal::Complete { prompt_start } = detector.inspect(buffer.as_slice()) {
                let output = buffer.as_str_lossy();
                let rejected = ["incorrect", "failed", "Invalid"]
                    .iter()
                    .any(|needle| output.contains(needle));
                let prompt = &buffer.as_slice()[prompt_start..];
                if rejected || !detector.is_elevated_prompt(prompt) {
                    return Err(Error::ElevationFailed {
                        message: output.trim().to_string(),
                    });
                }
                break;
            }
        }

        debug!("session {} elevated", self.id);
        self.elevated = true;
        self.last_used = Instant::now();
        Ok(())
    }

    /// Wait for the prompt with no command in flight.
    async fn read_until_prompt(
        &mut self,
        detector: &dyn PromptDetector,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut buffer = PatternBuffer::default();
        loop {
            let chunk = self.recv_before(deadline, timeout).await?;
            buffer.extend(&chunk);
            match detector.inspect(buffer.as_slice()) {
                PromptSignal::Complete { .. } => return Ok(()),
                PromptSignal::Pagination => self.shell.send(PAGE_CONTINUE).await?,
                PromptSignal::Pending => {}
            }
        }
    }

    /// Receive one chunk, failing with the protocol-timeout
    /// classification once the deadline passes.
    async fn recv_before(
        &mut self,
        deadline: tokio::time::Instant,
        timeout: Duration,
    ) -> Result<bytes::Bytes> {
        match tokio::time::timeout_at(deadline, self.shell.recv()).await {
            Err(_) => Err(Error::PromptTimeout(timeout)),
            Ok(Err(e)) => Err(e),
            Ok(Ok(None)) => Err(Error::Transport(TransportError::Disconnected)),
            Ok(Ok(Some(chunk))) => Ok(chunk),
        }
    }

    /// Close the session politely.
    ///
    /// An elevated session must `exit` twice; leaving administrator
    /// mode with unsaved changes makes the router ask whether to save,
    /// which is answered `N` because persistence is an explicit
    /// operation here.
    pub async fn close(mut self, detector: &dyn PromptDetector) {
        let grace = Duration::from_secs(3);

        if self.elevated && self.shell.send(b"exit\r").await.is_ok() {
            let transcript = self.drain_for(grace, detector).await;
            if transcript.contains("(Y/N)") {
                self.shell.send(b"N\r").await.ok();
                self.drain_for(grace, detector).await;
            }
        }

        self.shell.send(b"exit\r").await.ok();
        if let Err(e) = self.shell.close().await {
            debug!("session {} close: {e}", self.id);
        }
    }

    /// Read output for up to `grace`, stopping early at a prompt or a
    /// confirmation question. Errors are swallowed; this only runs on
    /// the teardown path.
    async fn drain_for(&mut self, grace: Duration, detector: &dyn PromptDetector) -> String {
        let deadline = tokio::time::Instant::now() + grace;
        let mut buffer = PatternBuffer::default();
        loop {
            match tokio::time::timeout_at(deadline, self.shell.recv()).await {
                Ok(Ok(Some(chunk))) => buffer.extend(&chunk),
                _ => break,
            }
            if buffer.as_str_lossy().contains("(Y/N)")
                || matches!(
                    detector.inspect(buffer.as_slice()),
                    PromptSignal::Complete { .. }
                )
            {
                break;
            }
        }
        buffer.as_str_lossy().into_owned()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_elevated(&self) -> bool {
        self.elevated
    }

    /// Time since this session last carried traffic.
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }
}
