use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harvest_listing::{RenderingSession, SessionError};
use harvest_storage::WebDriverLauncher;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Launches one isolated rendering session per call.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn launch(&self, profile_dir: &Path) -> Result<Box<dyn RenderingSession>, SessionError>;
}

#[async_trait]
impl SessionFactory for WebDriverLauncher {
    async fn launch(&self, profile_dir: &Path) -> Result<Box<dyn RenderingSession>, SessionError> {
        let session = WebDriverLauncher::launch(self, profile_dir).await?;
        Ok(Box::new(session))
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no rendering session became free within {0:?}")]
    Exhausted(Duration),
    #[error("session pool is closed")]
    Closed,
    #[error("creating session profile directory: {0}")]
    Profile(#[source] std::io::Error),
    #[error(transparent)]
    Launch(#[from] SessionError),
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_sessions: usize,
    /// Watchdog deadline for every lease.
    pub max_lifetime: Duration,
    pub acquire_timeout: Option<Duration>,
    /// Parent directory for per-session profiles; system temp dir when unset.
    pub profile_root: Option<PathBuf>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_sessions: harvest_core::DEFAULT_MAX_CONCURRENT_SESSIONS,
            max_lifetime: Duration::from_secs(600),
            acquire_timeout: None,
            profile_root: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub leased: usize,
    pub peak_leased: usize,
    pub launched: usize,
    pub released: usize,
}

#[derive(Debug, Default)]
struct PoolCounters {
    leased: AtomicUsize,
    peak_leased: AtomicUsize,
    launched: AtomicUsize,
    released: AtomicUsize,
}

impl PoolCounters {
    fn on_lease(&self) {
        self.launched.fetch_add(1, Ordering::SeqCst);
        let now = self.leased.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_leased.fetch_max(now, Ordering::SeqCst);
    }

    fn on_release(&self) {
        self.leased.fetch_sub(1, Ordering::SeqCst);
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

struct PoolInner {
    factory: Arc<dyn SessionFactory>,
    slots: Arc<Semaphore>,
    config: PoolConfig,
    counters: PoolCounters,
}

/// Bounded set of rendering sessions. Cloning shares the same slots.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, config: PoolConfig) -> Self {
        let max_sessions = config.max_sessions.max(1);
        Self {
            inner: Arc::new(PoolInner {
                factory,
                slots: Arc::new(Semaphore::new(max_sessions)),
                config: PoolConfig {
                    max_sessions,
                    ..config
                },
                counters: PoolCounters::default(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> PoolStats {
        let c = &self.inner.counters;
        PoolStats {
            leased: c.leased.load(Ordering::SeqCst),
            peak_leased: c.peak_leased.load(Ordering::SeqCst),
            launched: c.launched.load(Ordering::SeqCst),
            released: c.released.load(Ordering::SeqCst),
        }
    }

    /// Wait for a free slot, then launch a fresh session with its own profile.
    pub async fn acquire(&self) -> Result<SessionLease, PoolError> {
        let slots = self.inner.slots.clone();
        let permit = match self.inner.config.acquire_timeout {
            Some(limit) => tokio::time::timeout(limit, slots.acquire_owned())
                .await
                .map_err(|_| PoolError::Exhausted(limit))?,
            None => slots.acquire_owned().await,
        }
        .map_err(|_| PoolError::Closed)?;

        let mut builder = tempfile::Builder::new();
        builder.prefix("harvest-profile-");
        let profile = match &self.inner.config.profile_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(PoolError::Profile)?;

        let session = self.inner.factory.launch(profile.path()).await?;
        self.inner.counters.on_lease();

        let lease = SessionLease {
            id: Uuid::new_v4(),
            session,
            profile: Some(profile),
            permit: Some(permit),
            pool: self.inner.clone(),
            deadline: Instant::now() + self.inner.config.max_lifetime,
            released: false,
        };
        debug!(lease_id = %lease.id, "rendering session leased");
        Ok(lease)
    }

    /// Tear the session down and free its slot.
    pub async fn release(&self, lease: SessionLease) {
        lease.shutdown().await;
    }
}

/// Exclusive loan of one rendering session.
///
/// Dropping a lease without releasing it still closes the session, on a
/// background task of the current runtime.
pub struct SessionLease {
    id: Uuid,
    session: Box<dyn RenderingSession>,
    profile: Option<tempfile::TempDir>,
    permit: Option<OwnedSemaphorePermit>,
    pool: Arc<PoolInner>,
    deadline: Instant,
    released: bool,
}

impl SessionLease {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Moment the watchdog force-terminates this lease.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn profile_dir(&self) -> Option<&Path> {
        self.profile.as_ref().map(|p| p.path())
    }

    pub fn session(&mut self) -> &mut dyn RenderingSession {
        self.session.as_mut()
    }

    async fn shutdown(mut self) {
        if let Err(err) = self.session.close().await {
            warn!(lease_id = %self.id, %err, "closing rendering session failed");
        }
        self.released = true;
        self.profile.take();
        self.pool.counters.on_release();
        self.permit.take();
        debug!(lease_id = %self.id, "rendering session released");
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        let mut session = std::mem::replace(&mut self.session, Box::new(ReleasedSession));
        let profile = self.profile.take();
        let permit = self.permit.take();
        let pool = self.pool.clone();
        let lease_id = self.id;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(%lease_id, "lease dropped without release, tearing session down");
                handle.spawn(async move {
                    if let Err(err) = session.close().await {
                        warn!(%lease_id, %err, "closing abandoned session failed");
                    }
                    drop(profile);
                    pool.counters.on_release();
                    drop(permit);
                });
            }
            Err(_) => {
                warn!(%lease_id, "lease dropped outside a runtime, session not closed");
                drop(profile);
                pool.counters.on_release();
                drop(permit);
            }
        }
    }
}

/// Placeholder left behind once a lease's session has been handed off for teardown.
struct ReleasedSession;

#[async_trait]
impl RenderingSession for ReleasedSession {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        Err(SessionError::Navigation {
            url: url.to_string(),
            message: "session released".to_string(),
        })
    }

    async fn wait_for(&mut self, _selector: &str, _timeout: Duration) -> Result<(), SessionError> {
        Err(SessionError::Transport("session released".to_string()))
    }

    async fn click(&mut self, _selector: &str, _timeout: Duration) -> Result<(), SessionError> {
        Err(SessionError::Transport("session released".to_string()))
    }

    async fn read_text(&mut self, _selector: &str) -> Result<Option<String>, SessionError> {
        Err(SessionError::Transport("session released".to_string()))
    }

    async fn read_attribute(
        &mut self,
        _selector: &str,
        _name: &str,
    ) -> Result<Option<String>, SessionError> {
        Err(SessionError::Transport("session released".to_string()))
    }

    async fn enter_frame(&mut self, _selector: &str, _timeout: Duration) -> Result<(), SessionError> {
        Err(SessionError::Transport("session released".to_string()))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::CountingFactory;
    use harvest_listing::testing::MockWeb;
    use harvest_listing::ListingLayout;

    fn pool(factory: &CountingFactory, config: PoolConfig) -> SessionPool {
        SessionPool::new(Arc::new(factory.clone()), config)
    }

    fn factory() -> CountingFactory {
        CountingFactory::new(MockWeb::new(ListingLayout::default()))
    }

    #[tokio::test]
    async fn never_exceeds_max_sessions() {
        let factory = factory();
        let pool = pool(
            &factory,
            PoolConfig {
                max_sessions: 2,
                ..PoolConfig::default()
            },
        );

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let lease = pool.acquire().await.expect("acquire");
                tokio::time::sleep(Duration::from_millis(5)).await;
                pool.release(lease).await;
            }));
        }
        for handle in handles {
            handle.await.expect("task");
        }

        let stats = pool.stats();
        assert_eq!(stats.launched, 8);
        assert_eq!(stats.released, 8);
        assert_eq!(stats.leased, 0);
        assert!(stats.peak_leased <= 2, "{stats:?}");
        assert!(factory.peak_live() <= 2);
        assert_eq!(factory.live(), 0);
    }

    #[tokio::test]
    async fn acquire_deadline_reports_exhaustion() {
        let factory = factory();
        let pool = pool(
            &factory,
            PoolConfig {
                max_sessions: 1,
                acquire_timeout: Some(Duration::from_millis(20)),
                ..PoolConfig::default()
            },
        );

        let held = pool.acquire().await.expect("first lease");
        let err = pool.acquire().await.err().expect("second acquire must fail");
        assert!(matches!(err, PoolError::Exhausted(_)));

        pool.release(held).await;
        let again = pool.acquire().await.expect("slot freed");
        pool.release(again).await;
    }

    #[tokio::test]
    async fn each_lease_gets_its_own_profile_which_is_removed() {
        let factory = factory();
        let root = tempfile::tempdir().expect("tempdir");
        let pool = pool(
            &factory,
            PoolConfig {
                profile_root: Some(root.path().to_path_buf()),
                ..PoolConfig::default()
            },
        );

        let a = pool.acquire().await.expect("a");
        let b = pool.acquire().await.expect("b");
        let dir_a = a.profile_dir().expect("profile a").to_path_buf();
        let dir_b = b.profile_dir().expect("profile b").to_path_buf();
        assert_ne!(dir_a, dir_b);
        assert_ne!(a.id(), b.id());
        assert!(dir_a.starts_with(root.path()));

        pool.release(a).await;
        pool.release(b).await;
        assert!(!dir_a.exists());
        assert!(!dir_b.exists());
        assert_eq!(factory.closes(), 2);
    }

    #[tokio::test]
    async fn dropped_lease_is_still_torn_down() {
        let factory = factory();
        let pool = pool(
            &factory,
            PoolConfig {
                max_sessions: 1,
                ..PoolConfig::default()
            },
        );

        let lease = pool.acquire().await.expect("lease");
        drop(lease);

        let next = tokio::time::timeout(Duration::from_secs(1), pool.acquire())
            .await
            .expect("slot comes back")
            .expect("lease");
        pool.release(next).await;
        assert_eq!(factory.closes(), 2);
        assert_eq!(pool.stats().leased, 0);
    }

    #[tokio::test]
    async fn failed_launch_frees_the_slot() {
        let factory = factory().failing_launches(1);
        let pool = pool(
            &factory,
            PoolConfig {
                max_sessions: 1,
                acquire_timeout: Some(Duration::from_millis(50)),
                ..PoolConfig::default()
            },
        );

        let err = pool.acquire().await.err().expect("launch fails");
        assert!(matches!(err, PoolError::Launch(_)));
        let lease = pool.acquire().await.expect("second launch succeeds");
        pool.release(lease).await;
        assert_eq!(pool.stats().launched, 1);
    }
}
