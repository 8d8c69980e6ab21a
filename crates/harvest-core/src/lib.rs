//! Core domain model for the listing post harvester.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "harvest-core";

/// Hard ceiling on simultaneously leased rendering sessions when nothing else is configured.
pub const DEFAULT_MAX_CONCURRENT_SESSIONS: usize = 3;

/// A remote content feed tracked by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub display_name: String,
}

impl Source {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("harvest request names no sources")]
    EmptySources,
    #[error("post limit must be at least 1, got {0}")]
    InvalidPostLimit(usize),
}

/// One harvest invocation: which sources, how many posts per source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarvestRequest {
    sources: Vec<Source>,
    post_limit: usize,
    max_age: Option<Duration>,
}

impl HarvestRequest {
    pub fn new(sources: Vec<Source>, post_limit: usize) -> Result<Self, RequestError> {
        if sources.is_empty() {
            return Err(RequestError::EmptySources);
        }
        if post_limit == 0 {
            return Err(RequestError::InvalidPostLimit(post_limit));
        }
        Ok(Self {
            sources,
            post_limit,
            max_age: None,
        })
    }

    /// Only keep posts published within `max_age` of the harvest start.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn post_limit(&self) -> usize {
        self.post_limit
    }

    pub fn max_age(&self) -> Option<Duration> {
        self.max_age
    }
}

/// One harvested item. Unique within a source by `url`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostRecord {
    pub source_id: String,
    pub published_at: DateTime<Utc>,
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum HarvestStatus {
    Ok,
    PartialFailure(String),
    Failure(String),
}

impl HarvestStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, HarvestStatus::Ok)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            HarvestStatus::Ok => None,
            HarvestStatus::PartialFailure(reason) | HarvestStatus::Failure(reason) => {
                Some(reason.as_str())
            }
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            HarvestStatus::Ok => "ok",
            HarvestStatus::PartialFailure(_) => "partial_failure",
            HarvestStatus::Failure(_) => "failure",
        }
    }
}

impl fmt::Display for HarvestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.reason() {
            Some(reason) => write!(f, "{}: {}", self.label(), reason),
            None => f.write_str(self.label()),
        }
    }
}

/// Per-source outcome. Posts are most-recent-first and url-unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceResult {
    pub source_id: String,
    pub posts: Vec<PostRecord>,
    pub status: HarvestStatus,
}

impl SourceResult {
    pub fn failed(source_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            posts: Vec::new(),
            status: HarvestStatus::Failure(reason.into()),
        }
    }
}

/// Aggregated output of one harvest, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarvestResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub results: Vec<SourceResult>,
}

impl HarvestResult {
    pub fn total_posts(&self) -> usize {
        self.results.iter().map(|r| r.posts.len()).sum()
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for result in &self.results {
            match result.status {
                HarvestStatus::Ok => counts.ok += 1,
                HarvestStatus::PartialFailure(_) => counts.partial += 1,
                HarvestStatus::Failure(_) => counts.failed += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub ok: usize,
    pub partial: usize,
    pub failed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_rejects_empty_sources() {
        assert_eq!(
            HarvestRequest::new(vec![], 5).unwrap_err(),
            RequestError::EmptySources
        );
    }

    #[test]
    fn request_rejects_zero_post_limit() {
        let sources = vec![Source::new("alpha", "Alpha")];
        assert_eq!(
            HarvestRequest::new(sources, 0).unwrap_err(),
            RequestError::InvalidPostLimit(0)
        );
    }

    #[test]
    fn status_display_includes_reason() {
        let status = HarvestStatus::PartialFailure("table missing".into());
        assert_eq!(status.to_string(), "partial_failure: table missing");
        assert_eq!(status.reason(), Some("table missing"));
        assert_eq!(HarvestStatus::Ok.to_string(), "ok");
    }

    #[test]
    fn status_counts_cover_every_variant() {
        let now = Utc::now();
        let result = HarvestResult {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            results: vec![
                SourceResult {
                    source_id: "a".into(),
                    posts: vec![],
                    status: HarvestStatus::Ok,
                },
                SourceResult::failed("b", "no table"),
                SourceResult {
                    source_id: "c".into(),
                    posts: vec![],
                    status: HarvestStatus::PartialFailure("page 2".into()),
                },
            ],
        };
        assert_eq!(
            result.status_counts(),
            StatusCounts {
                ok: 1,
                partial: 1,
                failed: 1
            }
        );
    }
}
