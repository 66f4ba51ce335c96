//! In-memory `ListingStore` with JSON snapshots.
//!
//! Selection rule for [`ListingStore::next_unseen_listing`]: the oldest eligible listing
//! (creation time, then insertion order) among non-deleted listings of sites the subscriber
//! opted into, optionally restricted to a relevance window. A listing counts as seen by a
//! subscriber as soon as it has been selected for them.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use hsearch_core::{CandidateMap, Listing, ListingKey, Subscriber};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{ListingStore, StorageError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenEntry {
    pub chat_id: i64,
    pub listing: ListingKey,
}

/// Serializable image of a [`MemoryStore`]. Listings are kept in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    #[serde(default)]
    pub listings: Vec<Listing>,
    #[serde(default)]
    pub subscribers: Vec<Subscriber>,
    #[serde(default)]
    pub seen: Vec<SeenEntry>,
    #[serde(default)]
    pub tombstones: Vec<ListingKey>,
}

#[derive(Debug, Clone)]
struct StoredListing {
    seq: u64,
    listing: Listing,
}

#[derive(Debug, Default)]
struct Inner {
    next_seq: u64,
    listings: BTreeMap<ListingKey, StoredListing>,
    subscribers: BTreeMap<i64, Subscriber>,
    seen: BTreeSet<(i64, ListingKey)>,
    tombstones: BTreeSet<ListingKey>,
}

impl Inner {
    fn is_known(&self, key: &ListingKey) -> bool {
        self.listings.contains_key(key) || self.tombstones.contains(key)
    }

    fn insert(&mut self, listing: Listing) -> bool {
        let key = listing.key();
        if self.is_known(&key) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.listings.insert(key, StoredListing { seq, listing });
        true
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    relevance: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only listings created within `window` are offered by `next_unseen_listing`.
    pub fn with_relevance_window(mut self, window: Duration) -> Self {
        self.relevance = Some(window);
        self
    }

    pub fn from_snapshot(snapshot: MemorySnapshot) -> Self {
        let mut inner = Inner::default();
        for listing in snapshot.listings {
            inner.insert(listing);
        }
        for subscriber in snapshot.subscribers {
            inner.subscribers.insert(subscriber.chat_id, subscriber);
        }
        inner.seen = snapshot
            .seen
            .into_iter()
            .map(|entry| (entry.chat_id, entry.listing))
            .collect();
        inner.tombstones = snapshot.tombstones.into_iter().collect();

        Self {
            inner: Mutex::new(inner),
            relevance: None,
        }
    }

    pub async fn snapshot(&self) -> MemorySnapshot {
        let inner = self.inner.lock().await;
        let mut listings: Vec<&StoredListing> = inner.listings.values().collect();
        listings.sort_by_key(|stored| stored.seq);

        MemorySnapshot {
            listings: listings.into_iter().map(|s| s.listing.clone()).collect(),
            subscribers: inner.subscribers.values().cloned().collect(),
            seen: inner
                .seen
                .iter()
                .map(|(chat_id, listing)| SeenEntry {
                    chat_id: *chat_id,
                    listing: listing.clone(),
                })
                .collect(),
            tombstones: inner.tombstones.iter().cloned().collect(),
        }
    }

    /// Loads a snapshot file; a missing file yields an empty store.
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !fs::try_exists(path)
            .await
            .with_context(|| format!("checking state file {}", path.display()))?
        {
            return Ok(Self::new());
        }
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let snapshot: MemorySnapshot =
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Writes the snapshot through a temp file and an atomic rename.
    pub async fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let snapshot = self.snapshot().await;
        let bytes = serde_json::to_vec_pretty(&snapshot).context("serializing store snapshot")?;

        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating state directory {}", parent.display()))?;

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp state file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp state file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp state file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming state {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            });
        }
        Ok(())
    }

    pub async fn insert_subscriber(&self, subscriber: Subscriber) {
        let mut inner = self.inner.lock().await;
        inner.subscribers.insert(subscriber.chat_id, subscriber);
    }

    pub async fn subscriber(&self, chat_id: i64) -> Option<Subscriber> {
        self.inner.lock().await.subscribers.get(&chat_id).cloned()
    }

    pub async fn listing(&self, key: &ListingKey) -> Option<Listing> {
        self.inner
            .lock()
            .await
            .listings
            .get(key)
            .map(|stored| stored.listing.clone())
    }

    pub async fn listing_count(&self) -> usize {
        self.inner.lock().await.listings.len()
    }

    /// Drops every trace of `key`, so the grabber may discover it again.
    pub async fn forget(&self, key: &ListingKey) {
        let mut inner = self.inner.lock().await;
        inner.listings.remove(key);
        inner.tombstones.remove(key);
        inner.seen.retain(|(_, seen)| seen != key);
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn persist_listings(&self, listings: Vec<Listing>) -> Result<usize, StorageError> {
        let mut inner = self.inner.lock().await;
        Ok(listings
            .into_iter()
            .map(|listing| inner.insert(listing))
            .filter(|inserted| *inserted)
            .count())
    }

    async fn filter_unknown(
        &self,
        candidates: &mut CandidateMap,
        site: &str,
    ) -> Result<(), StorageError> {
        if candidates.is_empty() {
            return Ok(());
        }
        let inner = self.inner.lock().await;
        candidates.retain(|id, _| !inner.is_known(&ListingKey::new(site, *id)));
        Ok(())
    }

    async fn enabled_subscribers(&self) -> Result<Vec<Subscriber>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .subscribers
            .values()
            .filter(|s| s.enable)
            .cloned()
            .collect())
    }

    async fn next_unseen_listing(
        &self,
        subscriber: &Subscriber,
    ) -> Result<Option<Listing>, StorageError> {
        let cutoff = self
            .relevance
            .and_then(|window| chrono::Duration::from_std(window).ok())
            .map(|window| Utc::now() - window);

        let mut inner = self.inner.lock().await;
        let next = inner
            .listings
            .iter()
            .filter(|(key, stored)| {
                !stored.listing.is_deleted
                    && subscriber.wants_site(&key.site)
                    && cutoff.map_or(true, |c| stored.listing.created_at >= c)
                    && !inner.seen.contains(&(subscriber.chat_id, (*key).clone()))
            })
            .min_by_key(|(_, stored)| (stored.listing.created_at, stored.seq))
            .map(|(key, stored)| (key.clone(), stored.listing.clone()));

        Ok(next.map(|(key, listing)| {
            inner.seen.insert((subscriber.chat_id, key));
            listing
        }))
    }

    async fn all_listings(&self) -> Result<Vec<Listing>, StorageError> {
        let inner = self.inner.lock().await;
        Ok(inner.listings.values().map(|s| s.listing.clone()).collect())
    }

    async fn delete_listing(&self, listing: &Listing) -> Result<(), StorageError> {
        let key = listing.key();
        let mut inner = self.inner.lock().await;
        if inner.listings.remove(&key).is_none() {
            return Err(StorageError::ListingNotFound(key));
        }
        inner.seen.retain(|(_, seen)| seen != &key);
        inner.tombstones.insert(key);
        Ok(())
    }

    async fn update_subscriber(&self, subscriber: &Subscriber) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().await;
        match inner.subscribers.get_mut(&subscriber.chat_id) {
            Some(stored) => {
                *stored = subscriber.clone();
                Ok(())
            }
            None => Err(StorageError::SubscriberNotFound(subscriber.chat_id)),
        }
    }
}
