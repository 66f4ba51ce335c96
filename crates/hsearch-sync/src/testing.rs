//! In-process fakes shared by the unit tests of this crate.

use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use hsearch_adapters::{AdapterError, SourceAdapter};
use hsearch_core::{CandidateMap, DeliveryKind, DeliveryRecord, ExternalId, Listing, ListingKey, Subscriber};
use hsearch_storage::{FetchError, Page, PageFetcher, ProbeOutcome};

use crate::notify::{DeliveryError, Notifier};
use crate::report::{ErrorEvent, Reporter};

pub fn candidates(site: &str, ids: RangeInclusive<u64>) -> CandidateMap {
    ids.map(|id| (id, format!("https://{site}.test/{id}"))).collect()
}

pub fn listing(site: &str, id: ExternalId) -> Listing {
    Listing {
        external_id: id,
        site: site.to_string(),
        url: format!("https://{site}.test/{id}"),
        topic: format!("listing {id}"),
        price: String::new(),
        rooms: String::new(),
        phone: String::new(),
        body: String::new(),
        images_count: 0,
        is_deleted: false,
        created_at: Utc::now(),
    }
}

/// Scripted fetcher: pages, failures and probe verdicts keyed by URL.
#[derive(Default)]
pub struct FakeFetcher {
    pages: Mutex<HashMap<String, Result<String, u16>>>,
    probes: Mutex<HashMap<String, ProbeOutcome>>,
    requests: Mutex<Vec<(String, bool)>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn page(&self, url: impl Into<String>, body: impl Into<String>) {
        self.pages
            .lock()
            .unwrap()
            .insert(url.into(), Ok(body.into()));
    }

    pub fn fail(&self, url: impl Into<String>, status: u16) {
        self.pages.lock().unwrap().insert(url.into(), Err(status));
    }

    pub fn probe_outcome(&self, url: impl Into<String>, outcome: ProbeOutcome) {
        self.probes.lock().unwrap().insert(url.into(), outcome);
    }

    pub fn requests(&self) -> Vec<(String, bool)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Records the request and holds an in-flight slot through the configured delay.
    async fn occupy(&self, url: &str, use_proxy: bool) -> InFlight<'_> {
        self.requests
            .lock()
            .unwrap()
            .push((url.to_string(), use_proxy));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = InFlight(&self.in_flight);
        self.peak.fetch_max(now, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        guard
    }
}

#[async_trait]
impl PageFetcher for FakeFetcher {
    async fn get(&self, url: &str, use_proxy: bool) -> Result<Page, FetchError> {
        let _slot = self.occupy(url, use_proxy).await;
        let scripted = self.pages.lock().unwrap().get(url).cloned();
        match scripted {
            Some(Ok(body)) => Ok(Page::new(url, body)),
            Some(Err(status)) => Err(FetchError::HttpStatus {
                status,
                url: url.to_string(),
            }),
            None => Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            }),
        }
    }

    async fn probe(&self, url: &str, use_proxy: bool) -> ProbeOutcome {
        let _slot = self.occupy(url, use_proxy).await;
        self.probes
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or(ProbeOutcome::Alive)
    }
}

/// Adapter over plain-text pages: the crawl page lists ids separated by whitespace,
/// a detail page's text becomes the topic and an empty detail page fails to parse.
pub struct FakeAdapter {
    name: String,
    host: String,
    crawl_url: String,
    proxy: bool,
}

impl FakeAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            host: format!("https://{name}.test"),
            crawl_url: format!("https://{name}.test/"),
            proxy: false,
        }
    }

    pub fn with_proxy(mut self) -> Self {
        self.proxy = true;
        self
    }
}

impl SourceAdapter for FakeAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn requires_proxy(&self) -> bool {
        self.proxy
    }

    fn origin_host(&self) -> &str {
        &self.host
    }

    fn crawl_url(&self) -> &str {
        &self.crawl_url
    }

    fn enumerate(&self, page: &Page) -> Result<CandidateMap, AdapterError> {
        Ok(page
            .body
            .split_whitespace()
            .filter_map(|token| token.parse::<ExternalId>().ok())
            .map(|id| (id, format!("{}/{id}", self.host)))
            .collect())
    }

    fn id_from_url(&self, url: &str) -> Result<ExternalId, AdapterError> {
        url.rsplit('/')
            .next()
            .and_then(|segment| segment.parse().ok())
            .ok_or_else(|| AdapterError::MissingId {
                url: url.to_string(),
            })
    }

    fn parse_detail(&self, url: &str, id: ExternalId, page: &Page) -> Result<Listing, AdapterError> {
        let topic = page.body.trim();
        if topic.is_empty() {
            return Err(AdapterError::MissingField {
                field: "title",
                url: url.to_string(),
            });
        }
        let mut parsed = listing(&self.name, id);
        parsed.url = url.to_string();
        parsed.topic = topic.to_string();
        Ok(parsed)
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    events: Mutex<Vec<ErrorEvent>>,
}

impl RecordingReporter {
    pub fn events(&self) -> Vec<ErrorEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Reporter for RecordingReporter {
    fn capture(&self, event: ErrorEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Notifier that fails chats with a scripted transport message and records every attempt.
#[derive(Default)]
pub struct RecordingNotifier {
    failures: Mutex<BTreeMap<i64, String>>,
    attempts: Mutex<Vec<(i64, ListingKey)>>,
    delivered: Mutex<Vec<(i64, ListingKey)>>,
    delay: Option<Duration>,
}

impl RecordingNotifier {
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_chat(&self, chat_id: i64, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .insert(chat_id, message.to_string());
    }

    pub fn attempts_for(&self, chat_id: i64) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .filter(|(chat, _)| *chat == chat_id)
            .count()
    }

    pub fn delivered(&self) -> Vec<(i64, ListingKey)> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(
        &self,
        listing: &Listing,
        subscriber: &Subscriber,
    ) -> Result<Vec<DeliveryRecord>, DeliveryError> {
        self.attempts
            .lock()
            .unwrap()
            .push((subscriber.chat_id, listing.key()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().unwrap().get(&subscriber.chat_id).cloned();
        if let Some(message) = failure {
            return Err(DeliveryError::classify(message));
        }
        self.delivered
            .lock()
            .unwrap()
            .push((subscriber.chat_id, listing.key()));
        Ok(vec![DeliveryRecord {
            message_id: 1,
            chat_id: subscriber.chat_id,
            listing: listing.key(),
            kind: DeliveryKind::Apartment,
            created_at: Utc::now(),
        }])
    }
}
