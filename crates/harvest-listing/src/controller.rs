use std::collections::HashSet;

use chrono::{DateTime, Utc};
use harvest_core::PostRecord;
use tracing::{debug, info, warn};

use crate::extract::{PageExtraction, PostExtractor};
use crate::layout::{CrawlSettings, ListingLayout};
use crate::session::RenderingSession;

/// Where a listing crawl currently stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlState {
    Start,
    TabSelected,
    FrameEntered,
    CategoryExpanded,
    ListOpened,
    PageLoaded(u32),
    Done,
    Aborted(String),
}

impl CrawlState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CrawlState::Done | CrawlState::Aborted(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlOutcome {
    Completed,
    Aborted(String),
}

/// Everything a crawl has collected so far.
///
/// Lives outside the controller so the caller keeps partial results when the
/// crawl future is cut short.
#[derive(Debug, Clone, Default)]
pub struct CrawlProgress {
    pub records: Vec<PostRecord>,
    pub pages_read: u32,
    pub rows_seen: usize,
    pub rows_skipped: usize,
    pub trace: Vec<CrawlState>,
    seen_urls: HashSet<String>,
}

impl CrawlProgress {
    pub fn distinct_urls(&self) -> usize {
        self.seen_urls.len()
    }

    fn absorb(&mut self, page: PageExtraction) {
        self.pages_read += 1;
        self.rows_seen += page.rows_seen;
        self.rows_skipped += page.skipped;
        for record in page.records {
            self.seen_urls.insert(record.url.clone());
            self.records.push(record);
        }
    }
}

pub fn pages_needed(post_limit: usize, rows_per_page: usize) -> u32 {
    let pages = post_limit.div_ceil(rows_per_page.max(1)).max(1);
    u32::try_from(pages).unwrap_or(u32::MAX)
}

/// Drives one rendering session through a source's listing UI.
pub struct ListingController<'a> {
    session: &'a mut dyn RenderingSession,
    layout: &'a ListingLayout,
    settings: &'a CrawlSettings,
    extractor: &'a PostExtractor,
    source_id: &'a str,
    post_limit: usize,
    now: DateTime<Utc>,
    page_budget: u32,
}

impl<'a> ListingController<'a> {
    pub fn new(
        session: &'a mut dyn RenderingSession,
        layout: &'a ListingLayout,
        settings: &'a CrawlSettings,
        extractor: &'a PostExtractor,
        source_id: &'a str,
        post_limit: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let page_budget = pages_needed(post_limit, layout.rows_per_page)
            .saturating_add(settings.overscan_pages);
        Self {
            session,
            layout,
            settings,
            extractor,
            source_id,
            post_limit,
            now,
            page_budget,
        }
    }

    pub async fn run(mut self, progress: &mut CrawlProgress) -> CrawlOutcome {
        let mut state = CrawlState::Start;
        loop {
            progress.trace.push(state.clone());
            if state.is_terminal() {
                break;
            }
            state = self.step(state, progress).await;
        }

        info!(
            source_id = self.source_id,
            pages = progress.pages_read,
            records = progress.records.len(),
            skipped = progress.rows_skipped,
            "listing crawl finished"
        );
        match state {
            CrawlState::Aborted(reason) => CrawlOutcome::Aborted(reason),
            _ => CrawlOutcome::Completed,
        }
    }

    async fn step(&mut self, state: CrawlState, progress: &mut CrawlProgress) -> CrawlState {
        match state {
            CrawlState::Start => self.open_listing().await,
            CrawlState::TabSelected => {
                if self.enter_frame().await {
                    CrawlState::FrameEntered
                } else {
                    self.expand_categories().await
                }
            }
            CrawlState::FrameEntered => self.expand_categories().await,
            CrawlState::CategoryExpanded => self.open_full_list().await,
            CrawlState::ListOpened => self.read_page(1, progress).await,
            CrawlState::PageLoaded(page) => self.advance(page, progress).await,
            terminal => terminal,
        }
    }

    async fn open_listing(&mut self) -> CrawlState {
        let url = self.layout.listing_url(self.source_id);
        if let Err(err) = self.session.navigate(&url).await {
            warn!(source_id = self.source_id, %err, "could not open listing");
            return CrawlState::Aborted(format!("navigation failed: {err}"));
        }

        if let Some(tab) = &self.layout.posts_tab_selector {
            match self.session.click(tab, self.settings.control_timeout).await {
                Ok(()) => self.settle().await,
                Err(err) => debug!(source_id = self.source_id, %err, "no posts tab, assuming default view"),
            }
        }
        CrawlState::TabSelected
    }

    async fn enter_frame(&mut self) -> bool {
        let Some(frame) = &self.layout.frame_selector else {
            return false;
        };
        match self
            .session
            .enter_frame(frame, self.settings.control_timeout)
            .await
        {
            Ok(()) => true,
            Err(err) => {
                debug!(source_id = self.source_id, %err, "listing frame not entered, staying in top document");
                false
            }
        }
    }

    async fn expand_categories(&mut self) -> CrawlState {
        let toggle = match &self.layout.category_toggle_selector {
            Some(toggle) => match self
                .session
                .wait_for(toggle, self.settings.control_timeout)
                .await
            {
                Ok(()) => Some(toggle),
                Err(err) => {
                    debug!(source_id = self.source_id, %err, "no category panel");
                    None
                }
            },
            None => None,
        };
        if let Some(toggle) = toggle {
            match self
                .session
                .read_attribute(toggle, &self.layout.category_expanded_attribute)
                .await
            {
                Ok(Some(expanded)) if expanded.trim().eq_ignore_ascii_case("false") => {
                    if let Err(err) = self.session.click(toggle, self.settings.control_timeout).await {
                        debug!(source_id = self.source_id, %err, "category panel did not expand");
                    }
                }
                Ok(_) => {}
                Err(err) => debug!(source_id = self.source_id, %err, "category panel state unreadable"),
            }
        }

        if let Some(show_all) = &self.layout.show_all_categories_selector {
            match self.session.click(show_all, self.settings.control_timeout).await {
                Ok(()) => self.settle().await,
                Err(err) => debug!(source_id = self.source_id, %err, "show-all categories unavailable"),
            }
        }
        CrawlState::CategoryExpanded
    }

    async fn open_full_list(&mut self) -> CrawlState {
        let Some(toggle) = &self.layout.list_toggle_selector else {
            return CrawlState::ListOpened;
        };
        if let Err(err) = self
            .session
            .wait_for(toggle, self.settings.control_timeout)
            .await
        {
            debug!(source_id = self.source_id, %err, "no full list toggle");
            return CrawlState::ListOpened;
        }

        match self.session.read_text(toggle).await {
            Ok(Some(label)) if label.contains(&self.layout.list_toggle_closed_label) => {
                match self.session.click(toggle, self.settings.control_timeout).await {
                    Ok(()) => self.settle().await,
                    Err(err) => warn!(source_id = self.source_id, %err, "full list toggle failed"),
                }
            }
            Ok(Some(_)) => debug!(source_id = self.source_id, "full list already open"),
            Ok(None) => debug!(source_id = self.source_id, "full list toggle has no label"),
            Err(err) => debug!(source_id = self.source_id, %err, "full list toggle unreadable"),
        }
        CrawlState::ListOpened
    }

    async fn read_page(&mut self, page: u32, progress: &mut CrawlProgress) -> CrawlState {
        let table = &self.layout.table_selector;
        if let Err(err) = self
            .session
            .wait_for(table, self.settings.element_timeout)
            .await
        {
            warn!(source_id = self.source_id, page, %err, "listing table never rendered");
            return CrawlState::Aborted(format!("listing table missing on page {page}: {err}"));
        }

        let markup = match self.session.read_attribute(table, "outerHTML").await {
            Ok(Some(markup)) => markup,
            Ok(None) => {
                return CrawlState::Aborted(format!("listing table on page {page} had no markup"))
            }
            Err(err) => {
                return CrawlState::Aborted(format!("listing table on page {page} unreadable: {err}"))
            }
        };

        let extraction = self.extractor.extract(&markup, self.source_id, self.now);
        // Separator and other non-post rows do not count towards the page size.
        let post_rows = extraction.records.len() + extraction.skipped;
        if page == 1 && post_rows > 0 && post_rows != self.layout.rows_per_page {
            self.page_budget = pages_needed(self.post_limit, post_rows)
                .saturating_add(self.settings.overscan_pages);
            debug!(
                source_id = self.source_id,
                rows_per_page = post_rows,
                page_budget = self.page_budget,
                "page size differs from layout default"
            );
        }
        progress.absorb(extraction);
        CrawlState::PageLoaded(page)
    }

    async fn advance(&mut self, page: u32, progress: &mut CrawlProgress) -> CrawlState {
        if progress.distinct_urls() >= self.post_limit {
            return CrawlState::Done;
        }
        if page >= self.page_budget {
            debug!(source_id = self.source_id, page, "page budget exhausted");
            return CrawlState::Done;
        }

        let next = page + 1;
        let selector = self.layout.next_page_selector(next);
        match self
            .session
            .click(&selector, self.settings.control_timeout)
            .await
        {
            Ok(()) => {
                self.settle().await;
                self.read_page(next, progress).await
            }
            Err(err) => {
                debug!(source_id = self.source_id, next, %err, "no further pages");
                CrawlState::Done
            }
        }
    }

    async fn settle(&self) {
        if !self.settings.settle_delay.is_zero() {
            tokio::time::sleep(self.settings.settle_delay).await;
        }
    }
}
