//! Crawl, match and cleanup cycles for hsearch, plus the scheduler that drives them.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hsearch_adapters::adapter_for_site;
use hsearch_core::SiteDescriptor;
use hsearch_storage::{HttpClientConfig, HttpFetcher, ListingStore, PageFetcher};
use serde::Deserialize;
use tokio::fs;

mod config;
mod fanout;
mod garbage;
mod grabber;
mod matcher;
mod notify;
mod report;
mod scheduler;
#[cfg(test)]
mod testing;

pub use config::{parse_duration, ConfigError, SyncConfig};
pub use fanout::{DetailFanout, FanoutOutcome, DEFAULT_FANOUT_CONCURRENCY};
pub use garbage::{GarbageCollector, GarbageSummary};
pub use grabber::{CrawlError, Grabber, GrabberTickSummary, SitePassSummary, NEGATIVE_TOPIC_ID};
pub use matcher::{Matcher, MatcherSummary, SubscriberOutcome};
pub use notify::{DeliveryError, LogNotifier, Notifier};
pub use report::{Cycle, ErrorEvent, Reporter, TracingReporter};
pub use scheduler::{run_periodic, Dispatch, Schedule, Scheduler, SchedulerHandle, WARMUP};

pub const CRATE_NAME: &str = "hsearch-sync";

#[derive(Debug, Clone, Deserialize)]
pub struct SiteRegistry {
    pub sites: Vec<SiteDescriptor>,
}

impl SiteRegistry {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing site registry")
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Loads the registry named by the config and applies the per-site environment flags.
pub async fn load_sites(config: &SyncConfig) -> Result<Vec<SiteDescriptor>> {
    let registry = SiteRegistry::load(&config.sites_file).await?;
    Ok(config.effective_sites(registry.sites))
}

pub fn http_fetcher(config: &SyncConfig) -> Result<HttpFetcher> {
    let mut http = HttpClientConfig {
        timeout: Duration::from_secs(config.http_timeout_secs),
        proxy: config.proxy.clone(),
        ..HttpClientConfig::default()
    };
    if let Some(agent) = &config.user_agent {
        http.user_agents = vec![agent.clone()];
    }
    HttpFetcher::new(http)
}

/// The three cycles wired to shared collaborators.
pub struct Engine {
    config: SyncConfig,
    grabber: Arc<Grabber>,
    matcher: Arc<Matcher>,
    garbage: Arc<GarbageCollector>,
}

impl Engine {
    pub fn new(
        config: SyncConfig,
        sites: &[SiteDescriptor],
        store: Arc<dyn ListingStore>,
        fetcher: Arc<dyn PageFetcher>,
        notifier: Arc<dyn Notifier>,
        reporter: Arc<dyn Reporter>,
    ) -> Result<Self> {
        let adapters = sites
            .iter()
            .map(|site| adapter_for_site(site).with_context(|| format!("building adapter for {}", site.name)))
            .collect::<Result<Vec<_>>>()?;
        let proxy_sites: BTreeSet<String> = sites
            .iter()
            .filter(|site| site.use_proxy)
            .map(|site| site.name.clone())
            .collect();

        let grabber = Arc::new(Grabber::new(
            Arc::clone(&store),
            Arc::clone(&fetcher),
            Arc::clone(&reporter),
            adapters,
            config.fanout_concurrency,
        ));
        let matcher = Arc::new(Matcher::new(
            Arc::clone(&store),
            notifier,
            Arc::clone(&reporter),
        ));
        let garbage = Arc::new(GarbageCollector::new(
            store,
            fetcher,
            reporter,
            proxy_sites,
            config.probe_concurrency,
        ));

        Ok(Self {
            config,
            grabber,
            matcher,
            garbage,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn grabber(&self) -> &Arc<Grabber> {
        &self.grabber
    }

    pub fn matcher(&self) -> &Arc<Matcher> {
        &self.matcher
    }

    pub fn garbage(&self) -> &Arc<GarbageCollector> {
        &self.garbage
    }

    /// Scheduler with every cycle the config leaves enabled.
    pub fn scheduler(&self) -> Scheduler {
        let mut scheduler = Scheduler::new(Schedule {
            warmup: WARMUP,
            crawl_every: self.config.crawl_every,
            match_every: self.config.match_every,
            garbage_every: self.config.garbage_every,
        });
        if self.config.grabber_enabled {
            scheduler = scheduler.with_grabber(Arc::clone(&self.grabber));
        }
        if self.config.matcher_enabled {
            scheduler = scheduler.with_matcher(Arc::clone(&self.matcher));
        }
        if self.config.garbage_enabled {
            scheduler = scheduler.with_garbage(Arc::clone(&self.garbage));
        }
        scheduler
    }
}
