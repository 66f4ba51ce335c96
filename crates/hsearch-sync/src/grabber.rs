//! Crawl cycle: enumerate every site, keep unknown candidates, fetch their details
//! and persist the parsed listings.

use std::sync::Arc;

use hsearch_adapters::{AdapterError, SourceAdapter};
use hsearch_core::ExternalId;
use hsearch_storage::{FetchError, ListingStore, PageFetcher, StorageError};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

use crate::fanout::DetailFanout;
use crate::report::{report, Cycle, Reporter};

/// Pinned forum topic that is never an apartment ad.
pub const NEGATIVE_TOPIC_ID: ExternalId = 2477961;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("crawl page fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("crawl page enumeration failed: {0}")]
    Enumerate(#[from] AdapterError),
    #[error("storage failed: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SitePassSummary {
    pub site: String,
    pub enumerated: usize,
    pub new_candidates: usize,
    pub failed: usize,
    pub persisted: usize,
    pub cancelled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GrabberTickSummary {
    pub passes: Vec<SitePassSummary>,
    pub failed_sites: Vec<String>,
}

impl GrabberTickSummary {
    pub fn persisted(&self) -> usize {
        self.passes.iter().map(|pass| pass.persisted).sum()
    }
}

pub struct Grabber {
    store: Arc<dyn ListingStore>,
    fetcher: Arc<dyn PageFetcher>,
    reporter: Arc<dyn Reporter>,
    adapters: Vec<Arc<dyn SourceAdapter>>,
    fanout: DetailFanout,
}

impl Grabber {
    pub fn new(
        store: Arc<dyn ListingStore>,
        fetcher: Arc<dyn PageFetcher>,
        reporter: Arc<dyn Reporter>,
        adapters: Vec<Arc<dyn SourceAdapter>>,
        fanout_concurrency: usize,
    ) -> Self {
        let fanout = DetailFanout::new(Arc::clone(&fetcher), fanout_concurrency);
        Self {
            store,
            fetcher,
            reporter,
            adapters,
            fanout,
        }
    }

    pub fn adapters(&self) -> &[Arc<dyn SourceAdapter>] {
        &self.adapters
    }

    /// Runs one pass per site concurrently. A failing or panicking site is reported
    /// and never affects the others.
    pub async fn tick(self: &Arc<Self>, cancel: &CancellationToken) -> GrabberTickSummary {
        let mut passes = JoinSet::new();
        for adapter in &self.adapters {
            let this = Arc::clone(self);
            let adapter = Arc::clone(adapter);
            let cancel = cancel.child_token();
            passes.spawn(
                async move {
                    let site = adapter.name().to_string();
                    let result = this.crawl_site(adapter, &cancel).await;
                    (site, result)
                }
                .in_current_span(),
            );
        }

        let mut summary = GrabberTickSummary::default();
        while let Some(joined) = passes.join_next().await {
            match joined {
                Ok((_, Ok(pass))) => summary.passes.push(pass),
                Ok((site, Err(err))) => {
                    report(self.reporter.as_ref(), Cycle::Grabber, site.as_str(), &err);
                    summary.failed_sites.push(site);
                }
                Err(err) => {
                    report(self.reporter.as_ref(), Cycle::Grabber, "site pass", &err);
                }
            }
        }
        summary.passes.sort_by(|a, b| a.site.cmp(&b.site));
        summary
    }

    pub async fn crawl_site(
        &self,
        adapter: Arc<dyn SourceAdapter>,
        cancel: &CancellationToken,
    ) -> Result<SitePassSummary, CrawlError> {
        let site = adapter.name().to_string();
        let page = self
            .fetcher
            .get(adapter.crawl_url(), adapter.requires_proxy())
            .await?;

        let mut candidates = adapter.enumerate(&page)?;
        candidates.remove(&NEGATIVE_TOPIC_ID);
        let enumerated = candidates.len();

        self.store.filter_unknown(&mut candidates, &site).await?;
        let mut summary = SitePassSummary {
            site,
            enumerated,
            new_candidates: candidates.len(),
            ..SitePassSummary::default()
        };
        if candidates.is_empty() {
            debug!(site = %summary.site, enumerated, "no new listings");
            return Ok(summary);
        }

        let outcome = self.fanout.run(adapter, candidates, cancel).await;
        summary.failed = outcome.failed;
        summary.cancelled = outcome.cancelled;
        if outcome.cancelled || outcome.listings.is_empty() {
            return Ok(summary);
        }

        summary.persisted = self.store.persist_listings(outcome.listings).await?;
        info!(
            site = %summary.site,
            enumerated,
            new = summary.new_candidates,
            failed = summary.failed,
            persisted = summary.persisted,
            "site pass finished"
        );
        Ok(summary)
    }
}
