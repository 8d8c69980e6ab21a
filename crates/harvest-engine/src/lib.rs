//! Harvest orchestration: session pool, per-source crawls and report assembly.

use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use harvest_core::{HarvestRequest, HarvestResult, Source, StatusCounts};
use harvest_listing::{canonical_date, CrawlSettings, ListingLayout};
use harvest_storage::{
    CsvReport, ReportError, ReportSink, SourceRegistry, WebDriverConfig, WebDriverLauncher,
};
use serde::Serialize;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

mod orchestrator;
mod pool;
pub mod testing;

pub use orchestrator::{finalize_posts, Harvester};
pub use pool::{PoolConfig, PoolError, PoolStats, SessionFactory, SessionLease, SessionPool};

pub const CRATE_NAME: &str = "harvest-engine";

pub const REPORT_HEADER: [&str; 4] = ["name", "date", "title", "link"];

/// Recency window applied by the CLI and web form unless overridden.
pub const DEFAULT_MAX_AGE_DAYS: i64 = 10;

#[derive(Debug, Clone)]
pub struct HarvestConfig {
    pub webdriver_url: String,
    pub headless: bool,
    pub max_sessions: usize,
    pub session_max_lifetime: Duration,
    pub acquire_timeout: Option<Duration>,
    pub element_timeout: Duration,
    pub settle_delay: Duration,
    pub layout_path: Option<PathBuf>,
    pub registry_path: PathBuf,
    pub reports_dir: PathBuf,
    /// Posts older than this many days are dropped; 0 or less disables the window.
    pub max_age_days: i64,
    pub web_port: u16,
}

impl HarvestConfig {
    pub fn from_env() -> Self {
        Self {
            webdriver_url: std::env::var("HARVEST_WEBDRIVER_URL")
                .unwrap_or_else(|_| "http://localhost:9515".to_string()),
            headless: std::env::var("HARVEST_HEADLESS")
                .map(|v| !matches!(v.as_str(), "0" | "false" | "FALSE" | "False"))
                .unwrap_or(true),
            max_sessions: env_parse("HARVEST_MAX_SESSIONS")
                .unwrap_or(harvest_core::DEFAULT_MAX_CONCURRENT_SESSIONS),
            session_max_lifetime: Duration::from_secs(
                env_parse("HARVEST_SESSION_MAX_LIFETIME_SECS").unwrap_or(600),
            ),
            acquire_timeout: env_parse("HARVEST_ACQUIRE_TIMEOUT_SECS").map(Duration::from_secs),
            element_timeout: Duration::from_secs(
                env_parse("HARVEST_ELEMENT_TIMEOUT_SECS").unwrap_or(15),
            ),
            settle_delay: Duration::from_millis(env_parse("HARVEST_SETTLE_MILLIS").unwrap_or(1500)),
            layout_path: std::env::var("HARVEST_LAYOUT_PATH").ok().map(PathBuf::from),
            registry_path: std::env::var("HARVEST_REGISTRY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/sources.yaml")),
            reports_dir: std::env::var("HARVEST_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("reports")),
            max_age_days: env_parse("HARVEST_MAX_AGE_DAYS").unwrap_or(DEFAULT_MAX_AGE_DAYS),
            web_port: env_parse("HARVEST_WEB_PORT").unwrap_or(5001),
        }
    }

    pub fn registry(&self) -> SourceRegistry {
        SourceRegistry::new(&self.registry_path)
    }

    pub fn crawl_settings(&self) -> CrawlSettings {
        CrawlSettings {
            element_timeout: self.element_timeout,
            settle_delay: self.settle_delay,
            ..CrawlSettings::default()
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_sessions: self.max_sessions,
            max_lifetime: self.session_max_lifetime,
            acquire_timeout: self.acquire_timeout,
            profile_root: None,
        }
    }

    pub fn max_age(&self) -> Option<chrono::Duration> {
        if self.max_age_days <= 0 {
            return None;
        }
        chrono::Duration::try_days(self.max_age_days)
    }

    /// Default selectors unless `HARVEST_LAYOUT_PATH` points at a YAML override.
    pub async fn load_layout(&self) -> Result<ListingLayout> {
        let Some(path) = &self.layout_path else {
            return Ok(ListingLayout::default());
        };
        let yaml = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&yaml).with_context(|| format!("parsing {}", path.display()))
    }

    /// Harvester talking to the configured WebDriver endpoint.
    pub async fn build_harvester(&self) -> Result<Harvester> {
        let launcher = WebDriverLauncher::new(WebDriverConfig {
            endpoint: self.webdriver_url.clone(),
            headless: self.headless,
            ..WebDriverConfig::default()
        })?;
        let pool = SessionPool::new(Arc::new(launcher), self.pool_config());
        let layout = self.load_layout().await?;
        Harvester::new(pool, layout, self.crawl_settings()).context("compiling listing selectors")
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Report date cell, e.g. `*(03.07)`.
pub fn report_date(at: DateTime<Utc>) -> String {
    format!("*({})", at.format("%m.%d"))
}

/// Write the header, then one row per post in per-source order. Returns the
/// number of post rows.
pub fn write_report(
    result: &HarvestResult,
    sources: &[Source],
    sink: &mut dyn ReportSink,
) -> Result<usize, ReportError> {
    sink.append_row(&REPORT_HEADER.map(String::from))?;
    let mut rows = 0;
    for source_result in &result.results {
        let name = sources
            .iter()
            .find(|s| s.id == source_result.source_id)
            .map(|s| s.display_name.as_str())
            .unwrap_or(source_result.source_id.as_str());
        for post in &source_result.posts {
            sink.append_row(&[
                name.to_string(),
                report_date(post.published_at),
                post.title.clone(),
                post.url.clone(),
            ])?;
            rows += 1;
        }
    }
    Ok(rows)
}

/// CSV bytes of the report, ready to hand out as a download.
pub fn render_csv_report(result: &HarvestResult, sources: &[Source]) -> Result<Vec<u8>, ReportError> {
    let mut report = CsvReport::in_memory();
    write_report(result, sources, &mut report)?;
    report.finish()
}

/// Write the CSV report to `path`. Returns the number of post rows.
pub fn write_report_file(path: &Path, result: &HarvestResult, sources: &[Source]) -> Result<usize> {
    let file = std::fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut report = CsvReport::new(BufWriter::new(file))?;
    let rows = write_report(result, sources, &mut report)?;
    let mut writer = report.finish()?;
    std::io::Write::flush(&mut writer).with_context(|| format!("writing {}", path.display()))?;
    Ok(rows)
}

pub fn report_file_name(result: &HarvestResult) -> String {
    format!("{}.csv", result.run_id)
}

#[derive(Debug, Clone, Serialize)]
pub struct HarvestRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: usize,
    pub posts: usize,
    pub counts: StatusCounts,
    pub report_path: String,
    /// Most recent post date across all sources, `YYYY.MM.DD`.
    pub newest_post: Option<String>,
}

impl HarvestRunSummary {
    fn new(result: &HarvestResult, report_path: PathBuf) -> Self {
        let newest_post = result
            .results
            .iter()
            .flat_map(|r| r.posts.iter())
            .map(|p| p.published_at)
            .max()
            .map(canonical_date);
        Self {
            run_id: result.run_id,
            started_at: result.started_at,
            finished_at: result.finished_at,
            sources: result.results.len(),
            posts: result.total_posts(),
            counts: result.status_counts(),
            report_path: report_path.display().to_string(),
            newest_post,
        }
    }
}

/// Resolve `source_ids` against the registry (all registered sources when
/// empty), harvest them and write the CSV report to `out` or
/// `<reports_dir>/<run_id>.csv`.
pub async fn run_harvest_once_from_env(
    source_ids: &[String],
    post_limit: usize,
    out: Option<PathBuf>,
) -> Result<HarvestRunSummary> {
    let config = HarvestConfig::from_env();
    let registry = config.registry();
    let sources = if source_ids.is_empty() {
        registry.load().await?
    } else {
        registry.resolve(source_ids).await?
    };
    if sources.is_empty() {
        bail!(
            "no registered sources to harvest (registry: {})",
            registry.path().display()
        );
    }

    let mut request = HarvestRequest::new(sources.clone(), post_limit)?;
    if let Some(max_age) = config.max_age() {
        request = request.with_max_age(max_age);
    }

    let harvester = config.build_harvester().await?;
    let result = harvester.harvest(&request).await;

    let report_path = out.unwrap_or_else(|| config.reports_dir.join(report_file_name(&result)));
    if let Some(parent) = report_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let rows = write_report_file(&report_path, &result, &sources)?;
    info!(rows, path = %report_path.display(), "report written");

    Ok(HarvestRunSummary::new(&result, report_path))
}
