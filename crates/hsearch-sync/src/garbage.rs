//! Cleanup cycle: probe every stored listing and delete the ones whose page is gone.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use hsearch_core::{Listing, ListingKey};
use hsearch_storage::{ListingStore, PageFetcher, ProbeOutcome, StorageError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::report::{report, Cycle, Reporter};
use crate::scheduler::Dispatch;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GarbageSummary {
    pub checked: usize,
    pub alive: usize,
    pub inconclusive: usize,
    pub deleted: usize,
    pub delete_failures: usize,
    pub cancelled: bool,
}

pub struct GarbageCollector {
    store: Arc<dyn ListingStore>,
    fetcher: Arc<dyn PageFetcher>,
    reporter: Arc<dyn Reporter>,
    proxy_sites: BTreeSet<String>,
    /// Shared by every sweep so overlapping ticks stay within one request budget.
    permits: Arc<Semaphore>,
    /// Listings owned by a sweep that has not finished yet.
    claimed: Mutex<BTreeSet<ListingKey>>,
}

/// Releases a sweep's listings once its consumer is done with them.
struct SweepClaim {
    collector: Arc<GarbageCollector>,
    keys: Vec<ListingKey>,
}

impl Drop for SweepClaim {
    fn drop(&mut self) {
        let mut claimed = self
            .collector
            .claimed
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for key in &self.keys {
            claimed.remove(key);
        }
    }
}

impl GarbageCollector {
    pub fn new(
        store: Arc<dyn ListingStore>,
        fetcher: Arc<dyn PageFetcher>,
        reporter: Arc<dyn Reporter>,
        proxy_sites: BTreeSet<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            fetcher,
            reporter,
            proxy_sites,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            claimed: Mutex::new(BTreeSet::new()),
        }
    }

    /// Claims the listings no running sweep owns yet.
    fn claim(self: &Arc<Self>, listings: Vec<Listing>) -> (SweepClaim, Vec<Listing>) {
        let mut claimed = self.claimed.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys = Vec::new();
        let mut owned = Vec::new();
        for listing in listings.into_iter().filter(|listing| !listing.is_deleted) {
            let key = listing.key();
            if claimed.insert(key.clone()) {
                keys.push(key);
                owned.push(listing);
            } else {
                debug!(listing = %key, "listing already being checked");
            }
        }
        let claim = SweepClaim {
            collector: Arc::clone(self),
            keys,
        };
        (claim, owned)
    }

    /// Probes every non-deleted listing and deletes each one as soon as its probe says
    /// the page is gone. Network errors and unexpected statuses leave the listing alone.
    /// Listings still owned by an earlier, unfinished sweep are skipped.
    pub async fn dispatch(self: &Arc<Self>, cancel: CancellationToken) -> Dispatch<GarbageSummary> {
        let listings = match self.store.all_listings().await {
            Ok(listings) => listings,
            Err(err) => {
                report(self.reporter.as_ref(), Cycle::Garbage, "listings", &err);
                return Dispatch::spawn(async { GarbageSummary::default() });
            }
        };

        let (claim, listings) = self.claim(listings);
        let mut probes = JoinSet::new();
        for listing in listings {
            let fetcher = Arc::clone(&self.fetcher);
            let permits = Arc::clone(&self.permits);
            let use_proxy = self.proxy_sites.contains(&listing.site);
            probes.spawn(
                async move {
                    let outcome = match permits.acquire().await {
                        Ok(_permit) => fetcher.probe(&listing.url, use_proxy).await,
                        Err(_) => ProbeOutcome::Inconclusive("probe limiter closed".to_string()),
                    };
                    (listing, outcome)
                }
                .in_current_span(),
            );
        }

        let this = Arc::clone(self);
        Dispatch::spawn(async move {
            let _claim = claim;
            let mut summary = GarbageSummary::default();
            loop {
                let joined = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        probes.abort_all();
                        summary.cancelled = true;
                        break;
                    }
                    joined = probes.join_next() => joined,
                };
                let (mut listing, outcome) = match joined {
                    None => break,
                    Some(Ok(probed)) => probed,
                    Some(Err(err)) => {
                        warn!(error = %err, "probe task did not complete");
                        continue;
                    }
                };

                summary.checked += 1;
                match outcome {
                    ProbeOutcome::Alive => summary.alive += 1,
                    ProbeOutcome::Inconclusive(reason) => {
                        summary.inconclusive += 1;
                        debug!(listing = %listing.key(), reason = %reason, "probe inconclusive");
                    }
                    ProbeOutcome::NotFound => {
                        listing.is_deleted = true;
                        match this.store.delete_listing(&listing).await {
                            Ok(()) => {
                                summary.deleted += 1;
                                debug!(listing = %listing.key(), "listing removed");
                            }
                            Err(StorageError::ListingNotFound(key)) => {
                                debug!(listing = %key, "listing already removed");
                            }
                            Err(err) => {
                                summary.delete_failures += 1;
                                report(this.reporter.as_ref(), Cycle::Garbage, listing.key().to_string(), &err);
                            }
                        }
                    }
                }
            }
            info!(
                checked = summary.checked,
                deleted = summary.deleted,
                inconclusive = summary.inconclusive,
                "garbage tick finished"
            );
            summary
        })
    }
}
