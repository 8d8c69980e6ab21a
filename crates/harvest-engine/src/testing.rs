//! Session factory backed by [`MockWeb`] that counts what the pool does with it.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use harvest_listing::testing::{MockSession, MockWeb};
use harvest_listing::{RenderingSession, SessionError};

use crate::pool::SessionFactory;

#[derive(Debug, Default)]
struct Counters {
    launches: AtomicUsize,
    closes: AtomicUsize,
    live: AtomicUsize,
    peak_live: AtomicUsize,
    failures_left: AtomicUsize,
    profiles: Mutex<Vec<PathBuf>>,
}

#[derive(Debug, Clone)]
pub struct CountingFactory {
    web: MockWeb,
    counters: Arc<Counters>,
}

impl CountingFactory {
    pub fn new(web: MockWeb) -> Self {
        Self {
            web,
            counters: Arc::new(Counters::default()),
        }
    }

    /// The next `count` launches fail.
    pub fn failing_launches(self, count: usize) -> Self {
        self.counters.failures_left.store(count, Ordering::SeqCst);
        self
    }

    pub fn launches(&self) -> usize {
        self.counters.launches.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.counters.closes.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.counters.live.load(Ordering::SeqCst)
    }

    pub fn peak_live(&self) -> usize {
        self.counters.peak_live.load(Ordering::SeqCst)
    }

    pub fn profiles(&self) -> Vec<PathBuf> {
        self.counters
            .profiles
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionFactory for CountingFactory {
    async fn launch(&self, profile_dir: &Path) -> Result<Box<dyn RenderingSession>, SessionError> {
        let failing = self
            .counters
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SessionError::Launch("browser binary not found".to_string()));
        }

        tokio::time::sleep(Duration::from_millis(1)).await;
        if let Ok(mut profiles) = self.counters.profiles.lock() {
            profiles.push(profile_dir.to_path_buf());
        }
        self.counters.launches.fetch_add(1, Ordering::SeqCst);
        let live = self.counters.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_live.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(CountingSession {
            inner: self.web.session(),
            counters: self.counters.clone(),
            closed: false,
        }))
    }
}

struct CountingSession {
    inner: MockSession,
    counters: Arc<Counters>,
    closed: bool,
}

#[async_trait]
impl RenderingSession for CountingSession {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        self.inner.navigate(url).await
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), SessionError> {
        self.inner.wait_for(selector, timeout).await
    }

    async fn click(&mut self, selector: &str, timeout: Duration) -> Result<(), SessionError> {
        self.inner.click(selector, timeout).await
    }

    async fn read_text(&mut self, selector: &str) -> Result<Option<String>, SessionError> {
        self.inner.read_text(selector).await
    }

    async fn read_attribute(
        &mut self,
        selector: &str,
        name: &str,
    ) -> Result<Option<String>, SessionError> {
        self.inner.read_attribute(selector, name).await
    }

    async fn enter_frame(&mut self, selector: &str, timeout: Duration) -> Result<(), SessionError> {
        self.inner.enter_frame(selector, timeout).await
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if !self.closed {
            self.closed = true;
            self.counters.live.fetch_sub(1, Ordering::SeqCst);
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.close().await
    }
}
