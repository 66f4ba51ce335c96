//! Core domain model for hsearch: listings, subscribers, delivery records and site descriptors.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "hsearch-core";

/// Identifier of a listing on its origin site. Only unique within one site.
pub type ExternalId = u64;

/// Enumerated candidates of one crawl page: external id -> canonical URL.
pub type CandidateMap = BTreeMap<ExternalId, String>;

/// Dedup key of a listing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ListingKey {
    pub site: String,
    pub external_id: ExternalId,
}

impl ListingKey {
    pub fn new(site: impl Into<String>, external_id: ExternalId) -> Self {
        Self {
            site: site.into(),
            external_id,
        }
    }
}

impl fmt::Display for ListingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.site, self.external_id)
    }
}

/// A single apartment ad discovered on a source site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub external_id: ExternalId,
    pub site: String,
    pub url: String,
    pub topic: String,
    #[serde(default)]
    pub price: String,
    #[serde(default)]
    pub rooms: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub images_count: u32,
    #[serde(default)]
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl Listing {
    pub fn key(&self) -> ListingKey {
        ListingKey::new(self.site.clone(), self.external_id)
    }
}

/// A chat that receives new listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscriber {
    pub chat_id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Per-site opt-in flags. A site missing from the map is opted in.
    #[serde(default)]
    pub sites: BTreeMap<String, bool>,
    #[serde(default = "default_true")]
    pub photo: bool,
    #[serde(default = "default_price_range")]
    pub usd: String,
    #[serde(default = "default_price_range")]
    pub kgs: String,
}

impl Subscriber {
    pub fn new(chat_id: i64, title: impl Into<String>) -> Self {
        Self {
            chat_id,
            username: String::new(),
            title: title.into(),
            enable: true,
            sites: BTreeMap::new(),
            photo: true,
            usd: default_price_range(),
            kgs: default_price_range(),
        }
    }

    pub fn wants_site(&self, site: &str) -> bool {
        self.sites.get(site).copied().unwrap_or(true)
    }

    pub fn display_name(&self) -> &str {
        if self.title.is_empty() {
            &self.username
        } else {
            &self.title
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_price_range() -> String {
    "0:0".to_string()
}

/// What a delivered message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    Apartment,
    Description,
    Photo,
}

/// Association between a sent message and the listing/subscriber it concerns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub message_id: i64,
    pub chat_id: i64,
    pub listing: ListingKey,
    pub kind: DeliveryKind,
    pub created_at: DateTime<Utc>,
}

/// CSS selectors used to pull listing fields out of a detail page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailSelectors {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub price: Option<String>,
    #[serde(default)]
    pub rooms: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub images: Option<String>,
}

/// Static per-site crawl configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteDescriptor {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub use_proxy: bool,
    pub crawl_url: String,
    /// Prefix every canonical detail URL starts with.
    pub host: String,
    /// Selector matching the listing links on the crawl page.
    pub selector: String,
    /// Query parameter carrying the external id, when the site puts it there.
    #[serde(default)]
    pub id_param: Option<String>,
    #[serde(default)]
    pub detail: DetailSelectors,
}
