//! Source adapter contract + the selector-driven adapter configured from `sites.yaml`.

use std::sync::Arc;

use chrono::Utc;
use hsearch_core::{CandidateMap, ExternalId, Listing, SiteDescriptor};
use hsearch_storage::Page;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const CRATE_NAME: &str = "hsearch-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector '{selector}': {error}")]
    InvalidSelector { selector: String, error: String },
    #[error("invalid url '{url}': {error}")]
    InvalidUrl { url: String, error: String },
    #[error("no external id in '{url}'")]
    MissingId { url: String },
    #[error("required field '{field}' not found on {url}")]
    MissingField { field: &'static str, url: String },
}

/// One listings site: how to find listing links on its crawl page and how to read a detail page.
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn requires_proxy(&self) -> bool;
    fn origin_host(&self) -> &str;
    fn crawl_url(&self) -> &str;

    /// Maps every listing linked from the crawl page to its canonical URL.
    fn enumerate(&self, page: &Page) -> Result<CandidateMap, AdapterError>;

    fn id_from_url(&self, url: &str) -> Result<ExternalId, AdapterError>;

    fn parse_detail(&self, url: &str, id: ExternalId, page: &Page) -> Result<Listing, AdapterError>;
}

#[derive(Debug)]
struct DetailSelectorSet {
    title: Option<Selector>,
    price: Option<Selector>,
    rooms: Option<Selector>,
    phone: Option<Selector>,
    body: Option<Selector>,
    images: Option<Selector>,
}

/// Adapter whose every selector comes from the site's descriptor.
#[derive(Debug)]
pub struct SelectorSiteAdapter {
    site: SiteDescriptor,
    host: Url,
    listing_selector: Selector,
    anchor_selector: Selector,
    page_title_selector: Selector,
    detail: DetailSelectorSet,
}

fn parse_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::InvalidSelector {
        selector: selector.to_string(),
        error: e.to_string(),
    })
}

fn parse_optional_selector(selector: &Option<String>) -> Result<Option<Selector>, AdapterError> {
    selector.as_deref().map(parse_selector).transpose()
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn multiline_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn select_first_text(document: &Html, selector: Option<&Selector>) -> Option<String> {
    document
        .select(selector?)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn last_digit_run(text: &str) -> Option<&str> {
    let end = text.rfind(|c: char| c.is_ascii_digit())? + 1;
    let start = text[..end]
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    Some(&text[start..end])
}

impl SelectorSiteAdapter {
    pub fn new(site: SiteDescriptor) -> Result<Self, AdapterError> {
        let host = Url::parse(&site.host).map_err(|e| AdapterError::InvalidUrl {
            url: site.host.clone(),
            error: e.to_string(),
        })?;
        let detail = DetailSelectorSet {
            title: parse_optional_selector(&site.detail.title)?,
            price: parse_optional_selector(&site.detail.price)?,
            rooms: parse_optional_selector(&site.detail.rooms)?,
            phone: parse_optional_selector(&site.detail.phone)?,
            body: parse_optional_selector(&site.detail.body)?,
            images: parse_optional_selector(&site.detail.images)?,
        };

        Ok(Self {
            listing_selector: parse_selector(&site.selector)?,
            anchor_selector: parse_selector("a[href]")?,
            page_title_selector: parse_selector("title")?,
            host,
            site,
            detail,
        })
    }

    pub fn descriptor(&self) -> &SiteDescriptor {
        &self.site
    }

    fn resolve(&self, href: &str) -> Result<Url, AdapterError> {
        self.host.join(href).map_err(|e| AdapterError::InvalidUrl {
            url: href.to_string(),
            error: e.to_string(),
        })
    }

    /// Rebuilds `href` on the site's own origin, keeping only the id parameter when one is configured.
    fn canonical_url(&self, href: &str) -> Result<(ExternalId, String), AdapterError> {
        let resolved = self.resolve(href)?;
        let id = self.id_from_resolved(&resolved)?;
        let origin = self.host.origin().ascii_serialization();

        let url = match &self.site.id_param {
            Some(param) => format!("{origin}{}?{param}={id}", resolved.path()),
            None => match resolved.query() {
                Some(query) => format!("{origin}{}?{query}", resolved.path()),
                None => format!("{origin}{}", resolved.path()),
            },
        };
        Ok((id, url))
    }

    fn id_from_resolved(&self, url: &Url) -> Result<ExternalId, AdapterError> {
        let missing = || AdapterError::MissingId {
            url: url.to_string(),
        };
        let raw = match &self.site.id_param {
            Some(param) => url
                .query_pairs()
                .find(|(key, _)| key == param.as_str())
                .map(|(_, value)| value.into_owned())
                .ok_or_else(missing)?,
            None => last_digit_run(url.path()).ok_or_else(missing)?.to_string(),
        };
        raw.trim().parse().map_err(|_| missing())
    }
}

impl SourceAdapter for SelectorSiteAdapter {
    fn name(&self) -> &str {
        &self.site.name
    }

    fn requires_proxy(&self) -> bool {
        self.site.use_proxy
    }

    fn origin_host(&self) -> &str {
        &self.site.host
    }

    fn crawl_url(&self) -> &str {
        &self.site.crawl_url
    }

    fn enumerate(&self, page: &Page) -> Result<CandidateMap, AdapterError> {
        let document = page.document();
        let mut candidates = CandidateMap::new();

        for element in document.select(&self.listing_selector) {
            let href = element
                .value()
                .attr("href")
                .or_else(|| element.value().attr("content"))
                .or_else(|| {
                    element
                        .select(&self.anchor_selector)
                        .next()
                        .and_then(|a| a.value().attr("href"))
                });
            let Some(href) = href else {
                debug!(site = %self.site.name, "listing element without href");
                continue;
            };
            match self.canonical_url(href) {
                Ok((id, url)) => {
                    candidates.insert(id, url);
                }
                Err(err) => debug!(site = %self.site.name, href, error = %err, "skipping listing link"),
            }
        }

        Ok(candidates)
    }

    fn id_from_url(&self, url: &str) -> Result<ExternalId, AdapterError> {
        self.id_from_resolved(&self.resolve(url)?)
    }

    fn parse_detail(&self, url: &str, id: ExternalId, page: &Page) -> Result<Listing, AdapterError> {
        let document = page.document();
        let text = |selector: &Option<Selector>| {
            select_first_text(&document, selector.as_ref()).unwrap_or_default()
        };

        let topic = select_first_text(&document, self.detail.title.as_ref())
            .or_else(|| select_first_text(&document, Some(&self.page_title_selector)))
            .ok_or_else(|| AdapterError::MissingField {
                field: "title",
                url: url.to_string(),
            })?;
        let body = self
            .detail
            .body
            .as_ref()
            .and_then(|selector| document.select(selector).next())
            .map(multiline_text)
            .unwrap_or_default();
        let images_count = self
            .detail
            .images
            .as_ref()
            .map_or(0, |selector| document.select(selector).count() as u32);

        Ok(Listing {
            external_id: id,
            site: self.site.name.clone(),
            url: url.to_string(),
            topic,
            price: text(&self.detail.price),
            rooms: text(&self.detail.rooms),
            phone: text(&self.detail.phone),
            body,
            images_count,
            is_deleted: false,
            created_at: Utc::now(),
        })
    }
}

/// Builds the adapter for a configured site.
pub fn adapter_for_site(site: &SiteDescriptor) -> Result<Arc<dyn SourceAdapter>, AdapterError> {
    Ok(Arc::new(SelectorSiteAdapter::new(site.clone())?))
}
