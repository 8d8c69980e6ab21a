//! In-memory rendering sessions for exercising crawls without a browser.
//!
//! A [`MockWeb`] holds scripted listing sites keyed by source id. Each
//! [`MockSession`] it hands out behaves like a browser pointed at those sites:
//! it only answers selectors from the configured [`ListingLayout`], flips the
//! full-list toggle on click, and pages through the scripted tables.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::layout::ListingLayout;
use crate::session::{RenderingSession, SessionError};

/// One scripted source listing.
#[derive(Debug, Clone, Default)]
pub struct MockListing {
    /// Table markup per page; `None` means the table never renders on that page.
    pages: Vec<Option<String>>,
    posts_tab: bool,
    frame: bool,
    /// `Some(collapsed)` when the listing has a category panel.
    category_panel: Option<bool>,
    /// `Some(open)` when the listing has a full-list toggle.
    list_toggle: Option<bool>,
    navigation_fails: bool,
    latency: Duration,
    /// How long after navigation the interactive controls render.
    control_delay: Duration,
    hangs: bool,
}

impl MockListing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(mut self, table_html: impl Into<String>) -> Self {
        self.pages.push(Some(table_html.into()));
        self
    }

    pub fn with_missing_page(mut self) -> Self {
        self.pages.push(None);
        self
    }

    pub fn with_posts_tab(mut self) -> Self {
        self.posts_tab = true;
        self
    }

    pub fn with_frame(mut self) -> Self {
        self.frame = true;
        self
    }

    pub fn with_category_panel(mut self, collapsed: bool) -> Self {
        self.category_panel = Some(collapsed);
        self
    }

    /// Table only renders once the full list is open.
    pub fn with_list_toggle(mut self, initially_open: bool) -> Self {
        self.list_toggle = Some(initially_open);
        self
    }

    pub fn failing_navigation(mut self) -> Self {
        self.navigation_fails = true;
        self
    }

    /// Delay applied to every navigation.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Tabs and toggles only render `delay` after the listing opens.
    pub fn with_control_delay(mut self, delay: Duration) -> Self {
        self.control_delay = delay;
        self
    }

    /// Waiting for the listing table never returns.
    pub fn hanging(mut self) -> Self {
        self.hangs = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Navigate(String),
    WaitFor(String),
    Click(String),
    ReadText(String),
    ReadAttribute(String, String),
    EnterFrame(String),
    Close,
}

/// Collection of scripted sites sharing one layout and one call log.
#[derive(Debug, Clone)]
pub struct MockWeb {
    layout: Arc<ListingLayout>,
    sites: Arc<HashMap<String, MockListing>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
}

impl MockWeb {
    pub fn new(layout: ListingLayout) -> Self {
        Self {
            layout: Arc::new(layout),
            sites: Arc::new(HashMap::new()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_site(mut self, source_id: &str, listing: MockListing) -> Self {
        let url = self.layout.listing_url(source_id);
        Arc::make_mut(&mut self.sites).insert(url, listing);
        self
    }

    pub fn session(&self) -> MockSession {
        MockSession {
            layout: self.layout.clone(),
            sites: self.sites.clone(),
            calls: self.calls.clone(),
            site: None,
            opened_at: None,
            page: 0,
            in_frame: false,
            list_open: false,
            category_collapsed: false,
            closed: false,
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn clicks_on(&self, selector: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, MockCall::Click(s) if s == selector))
            .count()
    }
}

#[derive(Debug)]
pub struct MockSession {
    layout: Arc<ListingLayout>,
    sites: Arc<HashMap<String, MockListing>>,
    calls: Arc<Mutex<Vec<MockCall>>>,
    site: Option<MockListing>,
    opened_at: Option<Instant>,
    page: usize,
    in_frame: bool,
    list_open: bool,
    category_collapsed: bool,
    closed: bool,
}

impl MockSession {
    fn record(&self, call: MockCall) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(call);
        }
    }

    fn timeout(selector: &str, timeout: Duration) -> SessionError {
        SessionError::ElementTimeout {
            selector: selector.to_string(),
            timeout,
        }
    }

    fn current_table(&self) -> Option<&String> {
        let site = self.site.as_ref()?;
        if site.list_toggle.is_some() && !self.list_open {
            return None;
        }
        if site.frame && !self.in_frame {
            return None;
        }
        site.pages.get(self.page.checked_sub(1)?)?.as_ref()
    }

    fn is(&self, selector: &str, candidate: &Option<String>) -> bool {
        candidate.as_deref() == Some(selector)
    }

    /// Time until `selector` names a rendered control, `None` when the site has no such control.
    fn control_appears_in(&self, selector: &str) -> Option<Duration> {
        let site = self.site.as_ref()?;
        let present = (self.is(selector, &self.layout.posts_tab_selector) && site.posts_tab)
            || (self.is(selector, &self.layout.category_toggle_selector)
                && site.category_panel.is_some())
            || (self.is(selector, &self.layout.show_all_categories_selector)
                && site.category_panel.is_some())
            || (self.is(selector, &self.layout.list_toggle_selector) && site.list_toggle.is_some());
        if !present {
            return None;
        }
        let elapsed = self.opened_at.map(|at| at.elapsed()).unwrap_or_default();
        Some(site.control_delay.saturating_sub(elapsed))
    }

    fn control_visible(&self, selector: &str) -> bool {
        self.control_appears_in(selector) == Some(Duration::ZERO)
    }

    fn page_for_selector(&self, selector: &str) -> Option<usize> {
        let site = self.site.as_ref()?;
        (1..=site.pages.len() + 1).find(|page| self.layout.next_page_selector(*page as u32) == selector)
    }
}

#[async_trait]
impl RenderingSession for MockSession {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        self.record(MockCall::Navigate(url.to_string()));
        let Some(site) = self.sites.get(url).cloned() else {
            return Err(SessionError::Navigation {
                url: url.to_string(),
                message: "unknown site".to_string(),
            });
        };
        if !site.latency.is_zero() {
            tokio::time::sleep(site.latency).await;
        }
        if site.navigation_fails {
            return Err(SessionError::Navigation {
                url: url.to_string(),
                message: "connection reset".to_string(),
            });
        }
        self.list_open = site.list_toggle.unwrap_or(true);
        self.category_collapsed = site.category_panel.unwrap_or(false);
        self.page = 1;
        self.in_frame = false;
        self.opened_at = Some(Instant::now());
        self.site = Some(site);
        Ok(())
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> Result<(), SessionError> {
        self.record(MockCall::WaitFor(selector.to_string()));
        let hangs = self.site.as_ref().is_some_and(|s| s.hangs);
        if selector == self.layout.table_selector {
            if hangs {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.current_table().is_some() {
                return Ok(());
            }
        } else if let Some(appears_in) = self.control_appears_in(selector) {
            if appears_in <= timeout {
                tokio::time::sleep(appears_in).await;
                return Ok(());
            }
            tokio::time::sleep(timeout).await;
        }
        Err(Self::timeout(selector, timeout))
    }

    async fn click(&mut self, selector: &str, timeout: Duration) -> Result<(), SessionError> {
        self.record(MockCall::Click(selector.to_string()));
        let Some(site) = self.site.clone() else {
            return Err(Self::timeout(selector, timeout));
        };
        if self.control_appears_in(selector).is_some() && !self.control_visible(selector) {
            return Err(Self::timeout(selector, timeout));
        }

        if self.is(selector, &self.layout.posts_tab_selector) && site.posts_tab {
            return Ok(());
        }
        if self.is(selector, &self.layout.category_toggle_selector) && site.category_panel.is_some() {
            self.category_collapsed = !self.category_collapsed;
            return Ok(());
        }
        if self.is(selector, &self.layout.show_all_categories_selector)
            && site.category_panel.is_some()
            && !self.category_collapsed
        {
            return Ok(());
        }
        if self.is(selector, &self.layout.list_toggle_selector) && site.list_toggle.is_some() {
            self.list_open = !self.list_open;
            return Ok(());
        }
        if let Some(target) = self.page_for_selector(selector) {
            if target == self.page + 1 && target <= site.pages.len() {
                self.page = target;
                return Ok(());
            }
        }
        Err(Self::timeout(selector, timeout))
    }

    async fn read_text(&mut self, selector: &str) -> Result<Option<String>, SessionError> {
        self.record(MockCall::ReadText(selector.to_string()));
        if self.is(selector, &self.layout.list_toggle_selector) && self.control_visible(selector) {
            let label = if self.list_open {
                "목록닫기".to_string()
            } else {
                self.layout.list_toggle_closed_label.clone()
            };
            return Ok(Some(label));
        }
        Ok(None)
    }

    async fn read_attribute(
        &mut self,
        selector: &str,
        name: &str,
    ) -> Result<Option<String>, SessionError> {
        self.record(MockCall::ReadAttribute(selector.to_string(), name.to_string()));
        if selector == self.layout.table_selector && name == "outerHTML" {
            return Ok(self.current_table().cloned());
        }
        if self.is(selector, &self.layout.category_toggle_selector)
            && name == self.layout.category_expanded_attribute
            && self.control_visible(selector)
        {
            return Ok(Some((!self.category_collapsed).to_string()));
        }
        Ok(None)
    }

    async fn enter_frame(&mut self, selector: &str, timeout: Duration) -> Result<(), SessionError> {
        self.record(MockCall::EnterFrame(selector.to_string()));
        if self.site.as_ref().is_some_and(|s| s.frame) {
            self.in_frame = true;
            return Ok(());
        }
        Err(Self::timeout(selector, timeout))
    }

    async fn close(&mut self) -> Result<(), SessionError> {
        if !self.closed {
            self.closed = true;
            self.record(MockCall::Close);
        }
        Ok(())
    }
}

/// Table markup in the default layout's shape; rows are `(title, href, date text)`.
pub fn listing_table<T: AsRef<str>>(rows: &[(T, T, T)]) -> String {
    let mut html = String::from(r#"<table class="blog2_list blog2_categorylist"><tbody>"#);
    for (title, href, date) in rows {
        let (title, href, date) = (title.as_ref(), href.as_ref(), date.as_ref());
        html.push_str(&format!(
            r#"<tr><td class="title"><a href="{href}">{title}</a></td><td class="date"><span class="date">{date}</span></td></tr>"#
        ));
    }
    html.push_str("</tbody></table>");
    html
}
