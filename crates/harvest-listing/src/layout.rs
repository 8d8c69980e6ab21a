use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("invalid selector `{selector}`: {message}")]
    InvalidSelector { selector: String, message: String },
    #[error("invalid base url `{0}`")]
    InvalidBaseUrl(String),
}

/// Where the interactive controls of a source listing live.
///
/// Defaults describe the reference blog platform; every selector can be
/// overridden from a config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingLayout {
    /// Listing URL with an `{id}` placeholder for the source id.
    pub listing_url_template: String,
    /// Used to absolutize relative post links.
    pub base_url: String,
    pub posts_tab_selector: Option<String>,
    pub frame_selector: Option<String>,
    pub category_toggle_selector: Option<String>,
    pub category_expanded_attribute: String,
    pub show_all_categories_selector: Option<String>,
    pub list_toggle_selector: Option<String>,
    /// Label the list toggle shows while the full list is still closed.
    pub list_toggle_closed_label: String,
    pub table_selector: String,
    pub row_selector: String,
    pub title_selector: String,
    pub date_selector: String,
    /// Next-page control with a `{page}` placeholder for the 1-based page number.
    pub next_page_selector_template: String,
    /// Everything from this marker on is cut off post links.
    pub link_strip_marker: String,
    pub rows_per_page: usize,
}

impl Default for ListingLayout {
    fn default() -> Self {
        Self {
            listing_url_template: "https://blog.naver.com/PostList.naver?blogId={id}".to_string(),
            base_url: "https://blog.naver.com/".to_string(),
            posts_tab_selector: Some("a.menu_post, #blog-menu a[href*='PostList']".to_string()),
            frame_selector: None,
            category_toggle_selector: Some("#category-name .btn_category_toggle".to_string()),
            category_expanded_attribute: "aria-expanded".to_string(),
            show_all_categories_selector: Some("#category-name a.btn_category_all".to_string()),
            list_toggle_selector: Some("a.btn_openlist".to_string()),
            list_toggle_closed_label: "목록열기".to_string(),
            table_selector: "table.blog2_list.blog2_categorylist".to_string(),
            row_selector: "tbody tr".to_string(),
            title_selector: "td.title a".to_string(),
            date_selector: "td.date span.date".to_string(),
            next_page_selector_template: "div.blog2_paginate a[data-page='{page}']".to_string(),
            link_strip_marker: "&category".to_string(),
            rows_per_page: 5,
        }
    }
}

impl ListingLayout {
    pub fn listing_url(&self, source_id: &str) -> String {
        self.listing_url_template.replace("{id}", source_id)
    }

    pub fn next_page_selector(&self, page: u32) -> String {
        self.next_page_selector_template
            .replace("{page}", &page.to_string())
    }
}

/// Timeouts and pacing for one listing crawl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrawlSettings {
    /// Wait for required elements such as the listing table.
    pub element_timeout: Duration,
    /// Wait for optional controls (tabs, toggles, pagination).
    pub control_timeout: Duration,
    /// Pause after an interaction that re-renders the listing.
    pub settle_delay: Duration,
    /// Extra pages beyond `ceil(limit / rows_per_page)` to make up for skipped rows.
    pub overscan_pages: u32,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            element_timeout: Duration::from_secs(15),
            control_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_millis(1500),
            overscan_pages: 2,
        }
    }
}
