use chrono::{DateTime, Utc};
use harvest_core::PostRecord;
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use crate::layout::{LayoutError, ListingLayout};
use crate::timestamp::normalize;

/// Result of parsing one rendered listing page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageExtraction {
    pub records: Vec<PostRecord>,
    /// Rows the table contained, including skipped ones.
    pub rows_seen: usize,
    /// Rows that looked like posts but had no usable date.
    pub skipped: usize,
}

/// Parses listing table markup into post records, one row at a time.
#[derive(Debug, Clone)]
pub struct PostExtractor {
    row: Selector,
    title: Selector,
    date: Selector,
    base_url: Url,
    strip_marker: String,
}

impl PostExtractor {
    pub fn new(layout: &ListingLayout) -> Result<Self, LayoutError> {
        let base_url = Url::parse(&layout.base_url)
            .map_err(|_| LayoutError::InvalidBaseUrl(layout.base_url.clone()))?;
        Ok(Self {
            row: parse_selector(&layout.row_selector)?,
            title: parse_selector(&layout.title_selector)?,
            date: parse_selector(&layout.date_selector)?,
            base_url,
            strip_marker: layout.link_strip_marker.clone(),
        })
    }

    pub fn extract(&self, page_html: &str, source_id: &str, now: DateTime<Utc>) -> PageExtraction {
        let fragment = Html::parse_fragment(page_html);
        let mut page = PageExtraction::default();

        for row in fragment.select(&self.row) {
            page.rows_seen += 1;
            match self.extract_row(row, source_id, now) {
                RowOutcome::Post(record) => page.records.push(record),
                RowOutcome::NotAPost => {}
                RowOutcome::Skipped(reason) => {
                    debug!(source_id, reason, "skipping listing row");
                    page.skipped += 1;
                }
            }
        }
        page
    }

    fn extract_row(&self, row: ElementRef<'_>, source_id: &str, now: DateTime<Utc>) -> RowOutcome {
        let Some(link) = row.select(&self.title).next() else {
            return RowOutcome::NotAPost;
        };
        let Some(href) = link.value().attr("href").map(str::trim).filter(|h| !h.is_empty()) else {
            return RowOutcome::NotAPost;
        };

        let title = collapse_whitespace(&link.text().collect::<String>());
        let url = self.clean_link(href);

        let date_text = row
            .select(&self.date)
            .next()
            .map(|el| collapse_whitespace(&el.text().collect::<String>()))
            .unwrap_or_default();
        if date_text.is_empty() {
            return RowOutcome::Skipped("empty date text");
        }

        match normalize(&date_text, now) {
            Ok(published_at) => RowOutcome::Post(PostRecord {
                source_id: source_id.to_string(),
                published_at,
                title,
                url,
            }),
            Err(_) => RowOutcome::Skipped("unparseable date text"),
        }
    }

    fn clean_link(&self, href: &str) -> String {
        let absolute = self
            .base_url
            .join(href)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| href.to_string());
        match absolute.find(&self.strip_marker) {
            Some(idx) if !self.strip_marker.is_empty() => absolute[..idx].to_string(),
            _ => absolute,
        }
    }
}

enum RowOutcome {
    Post(PostRecord),
    NotAPost,
    Skipped(&'static str),
}

fn parse_selector(selector: &str) -> Result<Selector, LayoutError> {
    Selector::parse(selector).map_err(|err| LayoutError::InvalidSelector {
        selector: selector.to_string(),
        message: err.to_string(),
    })
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0)
            .single()
            .expect("fixed now")
    }

    fn extractor() -> PostExtractor {
        PostExtractor::new(&ListingLayout::default()).expect("default layout")
    }

    const PAGE: &str = r#"
        <table class="blog2_list blog2_categorylist">
          <tbody>
            <tr>
              <td class="title"><a href="/PostView.naver?blogId=moon&amp;logNo=101&amp;categoryNo=0">  First   post </a></td>
              <td class="date"><span class="date">3시간 전</span></td>
            </tr>
            <tr><td colspan="2" class="separator"></td></tr>
            <tr>
              <td class="title"><a href="https://blog.naver.com/PostView.naver?blogId=moon&amp;logNo=100">Second</a></td>
              <td class="date"><span class="date">2026. 3. 1.</span></td>
            </tr>
            <tr>
              <td class="title"><a href="/PostView.naver?blogId=moon&amp;logNo=99">No date</a></td>
              <td class="date"><span class="date">  </span></td>
            </tr>
            <tr>
              <td class="title"><a href="/PostView.naver?blogId=moon&amp;logNo=98">Odd date</a></td>
              <td class="date"><span class="date">last spring</span></td>
            </tr>
          </tbody>
        </table>
    "#;

    #[test]
    fn extracts_posts_and_isolates_bad_rows() {
        let page = extractor().extract(PAGE, "moon", now());

        assert_eq!(page.rows_seen, 5);
        assert_eq!(page.skipped, 2);
        assert_eq!(page.records.len(), 2);

        let first = &page.records[0];
        assert_eq!(first.source_id, "moon");
        assert_eq!(first.title, "First post");
        assert_eq!(
            first.url,
            "https://blog.naver.com/PostView.naver?blogId=moon&logNo=101"
        );
        assert_eq!(first.published_at, now() - Duration::hours(3));

        let second = &page.records[1];
        assert_eq!(second.title, "Second");
        assert_eq!(
            second.published_at,
            Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().expect("date")
        );
    }

    #[test]
    fn empty_markup_yields_nothing() {
        let page = extractor().extract("<table><tbody></tbody></table>", "moon", now());
        assert_eq!(page, PageExtraction::default());
    }

    #[test]
    fn invalid_selector_is_reported() {
        let layout = ListingLayout {
            row_selector: "tr[".to_string(),
            ..ListingLayout::default()
        };
        let err = PostExtractor::new(&layout).unwrap_err();
        assert!(matches!(err, LayoutError::InvalidSelector { .. }));
    }
}
