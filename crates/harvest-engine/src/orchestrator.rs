use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use harvest_core::{HarvestRequest, HarvestResult, HarvestStatus, PostRecord, Source, SourceResult};
use harvest_listing::{
    CrawlOutcome, CrawlProgress, CrawlSettings, LayoutError, ListingController, ListingLayout,
    PostExtractor,
};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::pool::SessionPool;

/// Runs one harvest across many sources, one pooled session per source.
#[derive(Clone)]
pub struct Harvester {
    pool: SessionPool,
    layout: Arc<ListingLayout>,
    settings: Arc<CrawlSettings>,
    extractor: Arc<PostExtractor>,
}

impl Harvester {
    pub fn new(
        pool: SessionPool,
        layout: ListingLayout,
        settings: CrawlSettings,
    ) -> Result<Self, LayoutError> {
        let extractor = PostExtractor::new(&layout)?;
        Ok(Self {
            pool,
            layout: Arc::new(layout),
            settings: Arc::new(settings),
            extractor: Arc::new(extractor),
        })
    }

    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    pub async fn harvest(&self, request: &HarvestRequest) -> HarvestResult {
        self.harvest_at(request, Utc::now()).await
    }

    /// Harvest with relative dates resolved against `now`.
    ///
    /// Per-source failures land in that source's status; the overall call
    /// always returns one result per requested source, in request order.
    /// Dropping the returned future tears down every session it holds.
    pub async fn harvest_at(&self, request: &HarvestRequest, now: DateTime<Utc>) -> HarvestResult {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!(
            "harvest",
            %run_id,
            sources = request.sources().len(),
            post_limit = request.post_limit()
        );

        let results = async {
            info!("harvest started");
            let units = request
                .sources()
                .iter()
                .map(|source| self.harvest_source(source, request, now));
            join_all(units).await
        }
        .instrument(span)
        .await;

        let result = HarvestResult {
            run_id,
            started_at,
            finished_at: Utc::now(),
            results,
        };
        let counts = result.status_counts();
        info!(
            %run_id,
            posts = result.total_posts(),
            ok = counts.ok,
            partial = counts.partial,
            failed = counts.failed,
            "harvest finished"
        );
        result
    }

    async fn harvest_source(
        &self,
        source: &Source,
        request: &HarvestRequest,
        now: DateTime<Utc>,
    ) -> SourceResult {
        let span = info_span!("source", source_id = %source.id);
        async {
            let mut lease = match self.pool.acquire().await {
                Ok(lease) => lease,
                Err(err) => {
                    warn!(%err, "no rendering session for source");
                    return SourceResult::failed(&source.id, err.to_string());
                }
            };

            let lease_id = lease.id();
            let deadline = lease.deadline();
            let mut progress = CrawlProgress::default();
            let controller = ListingController::new(
                lease.session(),
                &self.layout,
                &self.settings,
                &self.extractor,
                &source.id,
                request.post_limit(),
                now,
            );
            let crawled = tokio::time::timeout_at(deadline, controller.run(&mut progress)).await;
            let outcome = match crawled {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(
                        %lease_id,
                        records = progress.records.len(),
                        "session lifetime exceeded, terminating crawl"
                    );
                    CrawlOutcome::Aborted(format!(
                        "session exceeded its {}s lifetime",
                        self.pool.config().max_lifetime.as_secs_f32()
                    ))
                }
            };
            self.pool.release(lease).await;

            let status = status_for(&outcome, progress.records.is_empty());
            let cutoff = request.max_age().and_then(|age| now.checked_sub_signed(age));
            SourceResult {
                source_id: source.id.clone(),
                posts: finalize_posts(progress.records, request.post_limit(), cutoff),
                status,
            }
        }
        .instrument(span)
        .await
    }
}

fn status_for(outcome: &CrawlOutcome, nothing_collected: bool) -> HarvestStatus {
    match outcome {
        CrawlOutcome::Completed => HarvestStatus::Ok,
        CrawlOutcome::Aborted(reason) if nothing_collected => HarvestStatus::Failure(reason.clone()),
        CrawlOutcome::Aborted(reason) => HarvestStatus::PartialFailure(reason.clone()),
    }
}

/// Dedup by url (first occurrence wins), drop posts older than `cutoff`, keep
/// the first `post_limit` in listing order, then order newest first.
pub fn finalize_posts(
    records: Vec<PostRecord>,
    post_limit: usize,
    cutoff: Option<DateTime<Utc>>,
) -> Vec<PostRecord> {
    let mut seen = HashSet::new();
    let mut posts: Vec<PostRecord> = records
        .into_iter()
        .filter(|record| seen.insert(record.url.clone()))
        .filter(|record| cutoff.map_or(true, |cutoff| record.published_at >= cutoff))
        .take(post_limit)
        .collect();
    posts.sort_by(|a, b| b.published_at.cmp(&a.published_at));
    posts
}
