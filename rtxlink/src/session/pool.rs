//! Bounded session pool.
//!
//! RTX hardware refuses logins beyond a small fixed ceiling, so the
//! pool is a correctness mechanism, not a throughput optimization. A
//! semaphore permit is required to hold a leased session; sessions
//! parked idle carry no permit but are always preferred over opening a
//! new connection, which keeps the total number of live connections at
//! or below the ceiling.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use super::Session;
use super::shell::Connector;
use crate::channel::PromptDetector;
use crate::error::{Error, Result};
use crate::transport::TargetConfig;

/// Pool of interactive sessions against one router.
pub struct SessionPool {
    inner: Arc<PoolInner>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

struct PoolInner {
    config: TargetConfig,
    connector: Arc<dyn Connector>,
    detector: Arc<dyn PromptDetector>,
    /// Permits gate leased sessions. Closed on shutdown so waiters
    /// fail fast instead of timing out.
    semaphore: Arc<Semaphore>,
    /// LIFO: the most recently used session is reused first, letting
    /// older ones age out.
    idle: Mutex<Vec<Session>>,
    closed: AtomicBool,
    next_id: AtomicU64,
    created: AtomicU64,
    reused: AtomicU64,
    evicted: AtomicU64,
}

/// Counters for observability and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub created: u64,
    pub reused: u64,
    pub evicted: u64,
    pub idle: usize,
}

impl SessionPool {
    pub fn new(
        config: TargetConfig,
        connector: Arc<dyn Connector>,
        detector: Arc<dyn PromptDetector>,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(config.pool.max_sessions)),
            config,
            connector,
            detector,
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        });

        // The reaper is spawned from the first lease; construction may
        // happen outside a runtime.
        Self {
            inner,
            reaper: Mutex::new(None),
        }
    }

    /// Lease a session, waiting up to the configured acquire timeout
    /// for one to become available.
    ///
    /// A healthy idle session is reused; stale ones found on the way
    /// are closed instead of handed out. A new connection is opened
    /// only when nothing idle remains and the ceiling allows it.
    pub async fn lease(&self) -> Result<Lease> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) {
            return Err(Error::PoolClosed);
        }
        self.ensure_reaper();

        let acquire = inner.semaphore.clone().acquire_owned();
        let permit = match tokio::time::timeout(inner.config.pool.acquire_timeout, acquire).await {
            Err(_) => return Err(Error::PoolTimeout(inner.config.pool.acquire_timeout)),
            Ok(Err(_)) => return Err(Error::PoolClosed),
            Ok(Ok(permit)) => permit,
        };

        while let Some(session) = inner.idle.lock().unwrap().pop() {
            if session.idle_for() <= inner.config.pool.idle_timeout {
                inner.reused.fetch_add(1, Ordering::Relaxed);
                debug!("pool: reusing session {}", session.id());
                return Ok(Lease {
                    session: Some(session),
                    _permit: permit,
                    inner: inner.clone(),
                });
            }
            inner.evict(session);
        }

        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let shell = inner.connector.open_shell(&inner.config).await?;
        let session = Session::open(
            shell,
            id,
            inner.detector.as_ref(),
            inner.config.command_timeout,
        )
        .await?;

        inner.created.fetch_add(1, Ordering::Relaxed);
        debug!("pool: opened session {id}");
        Ok(Lease {
            session: Some(session),
            _permit: permit,
            inner: inner.clone(),
        })
    }

    /// Shut the pool down: stop the reaper, fail waiters, close every
    /// idle session. In-flight leases close their sessions on release.
    pub async fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.semaphore.close();

        if let Some(handle) = self.reaper.lock().unwrap().take() {
            handle.abort();
        }

        let idle = std::mem::take(&mut *self.inner.idle.lock().unwrap());
        for session in idle {
            debug!("pool: closing session {} on shutdown", session.id());
            session.close(self.inner.detector.as_ref()).await;
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.inner.created.load(Ordering::Relaxed),
            reused: self.inner.reused.load(Ordering::Relaxed),
            evicted: self.inner.evicted.load(Ordering::Relaxed),
            idle: self.inner.idle.lock().unwrap().len(),
        }
    }

    fn ensure_reaper(&self) {
        let mut reaper = self.reaper.lock().unwrap();
        if reaper.is_none() {
            *reaper = Some(Self::spawn_reaper(&self.inner));
        }
    }

    fn spawn_reaper(inner: &Arc<PoolInner>) -> JoinHandle<()> {
        let weak = Arc::downgrade(inner);
        let interval = inner.config.pool.reap_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(inner) = weak.upgrade() else { return };
                let stale: Vec<Session> = {
                    let mut idle = inner.idle.lock().unwrap();
                    let limit = inner.config.pool.idle_timeout;
                    let (keep, stale) = std::mem::take(&mut *idle)
                        .into_iter()
                        .partition(|s| s.idle_for() <= limit);
                    *idle = keep;
                    stale
                };
                for session in stale {
                    inner.evict(session);
                }
            }
        })
    }
}

impl PoolInner {
    /// Close a session that aged out.
    fn evict(self: &Arc<Self>, session: Session) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
        debug!("pool: evicting stale session {}", session.id());
        let detector = self.detector.clone();
        tokio::spawn(async move {
            session.close(detector.as_ref()).await;
        });
    }
}

/// A leased session.
///
/// Consume it with [`Lease::release`]; dropping it instead (the caller
/// gave up or was cancelled mid-exchange) counts as unhealthy and the
/// session is closed rather than returned, since its channel may hold
/// a half-read response.
pub struct Lease {
    session: Option<Session>,
    _permit: OwnedSemaphorePermit,
    inner: Arc<PoolInner>,
}

impl Lease {
    /// Return the session to the pool. `healthy` means the shell is at
    /// a clean prompt and safe to reuse; anything else closes it.
    pub async fn release(mut self, healthy: bool) {
        let Some(session) = self.session.take() else {
            return;
        };

        // `closed` is re-checked under the idle lock: shutdown sets it
        // before draining under the same lock, so a session parked here
        // is always seen by the drain, and a release that misses the
        // park window closes the session itself.
        let session = if healthy {
            let mut idle = self.inner.idle.lock().unwrap();
            if self.inner.closed.load(Ordering::SeqCst) {
                Some(session)
            } else {
                debug!("pool: parking session {}", session.id());
                idle.push(session);
                // The permit drops with `self`, after the push, so a
                // concurrent leaser always finds either the idle entry
                // or this held permit.
                None
            }
        } else {
            Some(session)
        };

        if let Some(session) = session {
            session.close(self.inner.detector.as_ref()).await;
        }
    }
}

impl Deref for Lease {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session.as_ref().unwrap()
    }
}

impl DerefMut for Lease {
    fn deref_mut(&mut self) -> &mut Session {
        self.session.as_mut().unwrap()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            warn!("pool: lease for session {} dropped, closing", session.id());
            let detector = self.inner.detector.clone();
            tokio::spawn(async move {
                session.close(detector.as_ref()).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_test::assert_ok;

    use super::*;
    use crate::channel::RtxPromptDetector;
    use crate::session::testing::{ScriptedConnector, ScriptedShell};
    use crate::transport::{AuthMethod, HostKeyVerification, PoolConfig};

    fn target(pool: PoolConfig) -> TargetConfig {
        TargetConfig {
            host: "192.0.2.1".into(),
            port: 22,
            username: "admin".into(),
            auth: AuthMethod::Password("admin".to_string().into()),
            admin_password: None,
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            host_key_verification: HostKeyVerification::Disabled,
            pool,
            bulk_channel: false,
            bulk_path: None,
        }
    }

    fn pool_with(shells: Vec<ScriptedShell>, cfg: PoolConfig) -> SessionPool {
        let _ = env_logger::builder().is_test(true).try_init();
        SessionPool::new(
            target(cfg),
            Arc::new(ScriptedConnector::new(shells)),
            Arc::new(RtxPromptDetector::new()),
        )
    }

    #[tokio::test]
    async fn healthy_release_is_reused() {
        let pool = pool_with(
            vec![ScriptedShell::obedient(8), ScriptedShell::obedient(8)],
            PoolConfig::default(),
        );

        let lease = assert_ok!(pool.lease().await);
        let first_id = lease.id();
        lease.release(true).await;

        let lease = pool.lease().await.unwrap();
        assert_eq!(lease.id(), first_id);
        lease.release(true).await;

        let stats = pool.stats();
        assert_eq!(stats.created, 1);
        assert_eq!(stats.reused, 1);
    }

    #[tokio::test]
    async fn unhealthy_release_closes_the_session() {
        let pool = pool_with(
            vec![ScriptedShell::obedient(8), ScriptedShell::obedient(8)],
            PoolConfig::default(),
        );

        let lease = pool.lease().await.unwrap();
        let first_id = lease.id();
        lease.release(false).await;

        let lease = pool.lease().await.unwrap();
        assert_ne!(lease.id(), first_id);
        assert_eq!(pool.stats().created, 2);
        lease.release(true).await;
    }

    #[tokio::test]
    async fn ceiling_blocks_the_third_lease() {
        let cfg = PoolConfig {
            max_sessions: 2,
            acquire_timeout: Duration::from_millis(100),
            ..PoolConfig::default()
        };
        let pool = pool_with(
            vec![
                ScriptedShell::obedient(8),
                ScriptedShell::obedient(8),
                ScriptedShell::obedient(8),
            ],
            cfg,
        );

        let a = pool.lease().await.unwrap();
        let b = pool.lease().await.unwrap();

        let Err(err) = pool.lease().await else {
            panic!("third lease succeeded past the ceiling");
        };
        assert!(matches!(err, Error::PoolTimeout(_)));

        a.release(true).await;
        b.release(true).await;
    }

    #[tokio::test]
    async fn releasing_unblocks_a_waiter() {
        let cfg = PoolConfig {
            max_sessions: 1,
            acquire_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        };
        let pool = Arc::new(pool_with(vec![ScriptedShell::obedient(8)], cfg));

        let lease = pool.lease().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let lease = pool.lease().await.unwrap();
                let id = lease.id();
                lease.release(true).await;
                id
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = lease.id();
        lease.release(true).await;

        assert_eq!(waiter.await.unwrap(), id);
    }

    #[tokio::test]
    async fn five_concurrent_leases_share_two_sessions() {
        let cfg = PoolConfig {
            max_sessions: 2,
            acquire_timeout: Duration::from_secs(5),
            ..PoolConfig::default()
        };
        let shells = (0..5).map(|_| ScriptedShell::obedient(8)).collect();
        let pool = Arc::new(pool_with(shells, cfg));

        let a = pool.lease().await.unwrap();
        let b = pool.lease().await.unwrap();

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let pool = pool.clone();
            waiters.push(tokio::spawn(async move {
                let lease = pool.lease().await.unwrap();
                lease.release(true).await;
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        for waiter in &waiters {
            assert!(!waiter.is_finished());
        }

        a.release(true).await;
        b.release(true).await;
        for waiter in waiters {
            waiter.await.unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.created, 2);
        assert_eq!(stats.reused, 3);
    }

    #[tokio::test]
    async fn stale_idle_sessions_are_evicted_on_lease() {
        let cfg = PoolConfig {
            idle_timeout: Duration::from_millis(0),
            ..PoolConfig::default()
        };
        let pool = pool_with(
            vec![ScriptedShell::obedient(8), ScriptedShell::obedient(8)],
            cfg,
        );

        let lease = pool.lease().await.unwrap();
        lease.release(true).await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        let lease = pool.lease().await.unwrap();
        let stats = pool.stats();
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.created, 2);
        lease.release(true).await;
    }

    #[tokio::test]
    async fn reaper_evicts_stale_sessions_without_a_lease() {
        let cfg = PoolConfig {
            idle_timeout: Duration::from_millis(10),
            reap_interval: Duration::from_millis(20),
            ..PoolConfig::default()
        };
        let pool = pool_with(vec![ScriptedShell::obedient(8)], cfg);

        let lease = pool.lease().await.unwrap();
        lease.release(true).await;
        assert_eq!(pool.stats().idle, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;

        let stats = pool.stats();
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.idle, 0);
    }

    #[tokio::test]
    async fn shutdown_fails_new_leases_and_drains_idle() {
        let pool = pool_with(
            vec![ScriptedShell::obedient(8)],
            PoolConfig::default(),
        );

        let lease = pool.lease().await.unwrap();
        lease.release(true).await;
        assert_eq!(pool.stats().idle, 1);

        pool.shutdown().await;
        assert_eq!(pool.stats().idle, 0);
        assert!(matches!(pool.lease().await, Err(Error::PoolClosed)));
    }

    #[tokio::test]
    async fn release_after_shutdown_closes_instead_of_parking() {
        let shell = ScriptedShell::obedient(8);
        let closed = shell.closed.clone();
        let pool = pool_with(vec![shell], PoolConfig::default());

        let lease = pool.lease().await.unwrap();
        pool.shutdown().await;
        lease.release(true).await;

        assert_eq!(pool.stats().idle, 0);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn dropped_lease_is_not_returned_to_the_pool() {
        let pool = pool_with(
            vec![ScriptedShell::obedient(8), ScriptedShell::obedient(8)],
            PoolConfig::default(),
        );

        let lease = pool.lease().await.unwrap();
        drop(lease);
        tokio::task::yield_now().await;

        let lease = pool.lease().await.unwrap();
        assert_eq!(pool.stats().created, 2);
        assert_eq!(pool.stats().reused, 0);
        lease.release(true).await;
    }
}
