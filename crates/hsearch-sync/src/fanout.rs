//! Concurrent detail fetching for one site pass.
//!
//! Every candidate gets its own task. Tasks push parsed listings into an mpsc queue
//! and the pass ends once every task has been joined, so nothing that finished is
//! left behind in the queue.

use std::sync::Arc;

use hsearch_adapters::{AdapterError, SourceAdapter};
use hsearch_core::{CandidateMap, ExternalId, Listing};
use hsearch_storage::{FetchError, PageFetcher};
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

pub const DEFAULT_FANOUT_CONCURRENCY: usize = 16;

#[derive(Debug, Error)]
enum DetailError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] AdapterError),
    #[error("result queue closed")]
    Closed,
}

#[derive(Debug, Default)]
pub struct FanoutOutcome {
    pub listings: Vec<Listing>,
    pub attempted: usize,
    pub failed: usize,
    /// The pass was cancelled; `listings` is empty and nothing may be persisted.
    pub cancelled: bool,
}

pub struct DetailFanout {
    fetcher: Arc<dyn PageFetcher>,
    concurrency: usize,
}

impl DetailFanout {
    pub fn new(fetcher: Arc<dyn PageFetcher>, concurrency: usize) -> Self {
        Self {
            fetcher,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(
        &self,
        adapter: Arc<dyn SourceAdapter>,
        candidates: CandidateMap,
        cancel: &CancellationToken,
    ) -> FanoutOutcome {
        let attempted = candidates.len();
        if attempted == 0 {
            return FanoutOutcome::default();
        }

        let (tx, mut rx) = mpsc::channel::<Listing>(attempted);
        let collector = tokio::spawn(async move {
            let mut listings = Vec::new();
            while let Some(listing) = rx.recv().await {
                listings.push(listing);
            }
            listings
        });

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for (id, url) in candidates {
            let tx = tx.clone();
            let permits = Arc::clone(&permits);
            let fetcher = Arc::clone(&self.fetcher);
            let adapter = Arc::clone(&adapter);
            tasks.spawn(
                async move {
                    let result = fetch_detail(&*fetcher, &*adapter, &permits, id, &url, tx).await;
                    (id, url, result)
                }
                .in_current_span(),
            );
        }
        // Only the tasks hold senders now; the collector ends when the last one finishes.
        drop(tx);

        let mut failed = 0;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    collector.abort();
                    debug!(site = adapter.name(), attempted, "detail fan-out cancelled");
                    return FanoutOutcome {
                        listings: Vec::new(),
                        attempted,
                        failed,
                        cancelled: true,
                    };
                }
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((_, _, Ok(())))) => {}
                    Some(Ok((id, url, Err(err)))) => {
                        failed += 1;
                        warn!(site = adapter.name(), id, url = %url, error = %err, "detail fetch failed");
                    }
                    Some(Err(err)) => {
                        failed += 1;
                        warn!(site = adapter.name(), error = %err, "detail task did not complete");
                    }
                },
            }
        }

        let listings = match collector.await {
            Ok(listings) => listings,
            Err(err) => {
                warn!(site = adapter.name(), error = %err, "detail collector did not complete");
                Vec::new()
            }
        };

        FanoutOutcome {
            listings,
            attempted,
            failed,
            cancelled: false,
        }
    }
}

async fn fetch_detail(
    fetcher: &dyn PageFetcher,
    adapter: &dyn SourceAdapter,
    permits: &Semaphore,
    id: ExternalId,
    url: &str,
    results: mpsc::Sender<Listing>,
) -> Result<(), DetailError> {
    let _permit = permits.acquire().await.map_err(|_| DetailError::Closed)?;
    let page = fetcher.get(url, adapter.requires_proxy()).await?;
    let listing = adapter.parse_detail(url, id, &page)?;
    results.send(listing).await.map_err(|_| DetailError::Closed)
}
