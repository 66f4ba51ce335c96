//! Fetch client, storage contract and the in-memory reference store for hsearch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use hsearch_core::{CandidateMap, Listing, Subscriber};
use reqwest::header::{CONNECTION, USER_AGENT};
use reqwest::StatusCode;
use scraper::Html;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

mod memory;

pub use memory::{MemorySnapshot, MemoryStore, SeenEntry};

pub const CRATE_NAME: &str = "hsearch-storage";

pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Linux; Android 10; K) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (Linux; Android 10; K) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36",
];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("listing {0} not found")]
    ListingNotFound(hsearch_core::ListingKey),
    #[error("subscriber {0} not found")]
    SubscriberNotFound(i64),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Persistence contract the cycles read and write through.
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Inserts listings whose (site, external id) is unknown and returns how many were inserted.
    /// Known keys are ignored, never overwritten.
    async fn persist_listings(&self, listings: Vec<Listing>) -> Result<usize, StorageError>;

    /// Removes every candidate already known for `site`.
    async fn filter_unknown(
        &self,
        candidates: &mut CandidateMap,
        site: &str,
    ) -> Result<(), StorageError>;

    async fn enabled_subscribers(&self) -> Result<Vec<Subscriber>, StorageError>;

    async fn next_unseen_listing(
        &self,
        subscriber: &Subscriber,
    ) -> Result<Option<Listing>, StorageError>;

    async fn all_listings(&self) -> Result<Vec<Listing>, StorageError>;

    async fn delete_listing(&self, listing: &Listing) -> Result<(), StorageError>;

    async fn update_subscriber(&self, subscriber: &Subscriber) -> Result<(), StorageError>;
}

/// A fetched HTML page. Parsing into a DOM happens on demand since `Html` is not `Send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub url: String,
    pub status: u16,
    pub body: String,
}

impl Page {
    pub fn new(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status: 200,
            body: body.into(),
        }
    }

    pub fn document(&self) -> Html {
        Html::parse_document(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("proxy requested for {url} but no proxy is configured")]
    ProxyNotConfigured { url: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Verdict of a liveness probe against a stored listing URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Alive,
    NotFound,
    Inconclusive(String),
}

/// Page access used by the cycles; `HttpFetcher` is the production implementation.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn get(&self, url: &str, use_proxy: bool) -> Result<Page, FetchError>;

    async fn probe(&self, url: &str, use_proxy: bool) -> ProbeOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT
        | StatusCode::TOO_MANY_REQUESTS => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Upstream proxy for sites that block direct crawling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn url(&self) -> String {
        if self.host.contains("://") {
            self.host.clone()
        } else {
            format!("http://{}", self.host)
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agents: Vec<String>,
    pub proxy: Option<ProxyConfig>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            proxy: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// HTTP client that opens a fresh connection for every request.
#[derive(Debug)]
pub struct HttpFetcher {
    direct: reqwest::Client,
    proxied: Option<reqwest::Client>,
    user_agents: Vec<String>,
    next_agent: AtomicUsize,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let direct = client_builder(config.timeout)
            .no_proxy()
            .build()
            .context("building direct reqwest client")?;

        let proxied = match &config.proxy {
            Some(proxy) => {
                let mut upstream = reqwest::Proxy::all(proxy.url())
                    .with_context(|| format!("parsing proxy url {}", proxy.host))?;
                if let Some(user) = &proxy.user {
                    upstream = upstream.basic_auth(user, proxy.password.as_deref().unwrap_or(""));
                }
                Some(
                    client_builder(config.timeout)
                        .proxy(upstream)
                        .build()
                        .context("building proxied reqwest client")?,
                )
            }
            None => None,
        };

        Ok(Self {
            direct,
            proxied,
            user_agents: config.user_agents,
            next_agent: AtomicUsize::new(0),
            backoff: config.backoff,
        })
    }

    pub fn has_proxy(&self) -> bool {
        self.proxied.is_some()
    }

    fn client_for(&self, url: &str, use_proxy: bool) -> Result<&reqwest::Client, FetchError> {
        if !use_proxy {
            return Ok(&self.direct);
        }
        self.proxied
            .as_ref()
            .ok_or_else(|| FetchError::ProxyNotConfigured {
                url: url.to_string(),
            })
    }

    fn user_agent(&self) -> Option<&str> {
        if self.user_agents.is_empty() {
            return None;
        }
        let index = self.next_agent.fetch_add(1, Ordering::Relaxed) % self.user_agents.len();
        Some(self.user_agents[index].as_str())
    }

    fn request(&self, client: &reqwest::Client, url: &str) -> reqwest::RequestBuilder {
        let request = client.get(url).header(CONNECTION, "close");
        match self.user_agent() {
            Some(agent) => request.header(USER_AGENT, agent),
            None => request,
        }
    }

    async fn get_with_retries(&self, url: &str, use_proxy: bool) -> Result<Page, FetchError> {
        let client = self.client_for(url, use_proxy)?;

        let mut attempt = 0;
        loop {
            match self.request(client, url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(Page {
                            url: final_url,
                            status: status.as_u16(),
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    debug!(%status, attempt, "retrying after transient status");
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || attempt >= self.backoff.max_retries
                    {
                        return Err(FetchError::Request(err));
                    }
                    debug!(error = %err, attempt, "retrying after transient request error");
                }
            }

            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

fn client_builder(timeout: Duration) -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(timeout)
        .pool_max_idle_per_host(0)
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn get(&self, url: &str, use_proxy: bool) -> Result<Page, FetchError> {
        let span = info_span!("http_fetch", url, use_proxy);
        self.get_with_retries(url, use_proxy).instrument(span).await
    }

    async fn probe(&self, url: &str, use_proxy: bool) -> ProbeOutcome {
        let client = match self.client_for(url, use_proxy) {
            Ok(client) => client,
            Err(err) => return ProbeOutcome::Inconclusive(err.to_string()),
        };

        let span = info_span!("http_probe", url, use_proxy);
        match self.request(client, url).send().instrument(span).await {
            Ok(resp) if resp.status() == StatusCode::NOT_FOUND => ProbeOutcome::NotFound,
            Ok(resp) if resp.status().is_success() => ProbeOutcome::Alive,
            Ok(resp) => ProbeOutcome::Inconclusive(format!("http status {}", resp.status())),
            Err(err) => ProbeOutcome::Inconclusive(err.to_string()),
        }
    }
}
