//! Process configuration read from the environment.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use hsearch_core::SiteDescriptor;
use hsearch_storage::ProxyConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration '{value}' for {key}")]
    InvalidDuration { key: String, value: String },
    #[error("{key} must be greater than zero")]
    ZeroDuration { key: String },
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub sites_file: PathBuf,
    pub state_file: PathBuf,
    pub crawl_every: Duration,
    pub match_every: Duration,
    pub garbage_every: Duration,
    /// Window limiting which listings are still offered to subscribers.
    pub relevance: Option<Duration>,
    pub proxy: Option<ProxyConfig>,
    pub grabber_enabled: bool,
    pub matcher_enabled: bool,
    pub garbage_enabled: bool,
    /// Lower-cased site names turned off through `DISABLED_PARSE_<SITE>`.
    pub disabled_sites: BTreeSet<String>,
    /// Lower-cased site name -> `<SITE>_USE_PROXY` value.
    pub proxy_overrides: BTreeMap<String, bool>,
    pub user_agent: Option<String>,
    pub http_timeout_secs: u64,
    pub fanout_concurrency: usize,
    pub probe_concurrency: usize,
}

fn is_truthy(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True" | "yes")
}

/// Parses Go-style durations such as `90s`, `1m`, `1h30m` or `500ms`.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    let mut rest = input;
    while !rest.is_empty() {
        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let value: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value.checked_mul(60)?),
            "h" => Duration::from_secs(value.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(part)?;
        rest = &rest[unit_len..];
    }
    Some(total)
}

fn env_key(site: &str) -> String {
    site.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars(vars: impl IntoIterator<Item = (String, String)>) -> Result<Self, ConfigError> {
        let vars: BTreeMap<String, String> = vars.into_iter().collect();
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let interval = |key: &str, default: &str| -> Result<Duration, ConfigError> {
            let raw = get(key).unwrap_or(default);
            let value = parse_duration(raw).ok_or_else(|| ConfigError::InvalidDuration {
                key: key.to_string(),
                value: raw.to_string(),
            })?;
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration {
                    key: key.to_string(),
                });
            }
            Ok(value)
        };

        let relevance = match get("ORDER_RELEVANCE") {
            Some(raw) => Some(parse_duration(raw).ok_or_else(|| ConfigError::InvalidDuration {
                key: "ORDER_RELEVANCE".to_string(),
                value: raw.to_string(),
            })?),
            None => None,
        };

        let proxy = get("PROXY_HOST").map(|host| ProxyConfig {
            host: host.to_string(),
            user: get("PROXY_USER").map(str::to_string),
            password: get("PROXY_PASSWORD").map(str::to_string),
        });

        let mut disabled_sites = BTreeSet::new();
        let mut proxy_overrides = BTreeMap::new();
        for (key, value) in &vars {
            if let Some(site) = key.strip_prefix("DISABLED_PARSE_") {
                if is_truthy(value.trim()) {
                    disabled_sites.insert(site.to_ascii_lowercase());
                }
            } else if let Some(site) = key.strip_suffix("_USE_PROXY") {
                proxy_overrides.insert(site.to_ascii_lowercase(), is_truthy(value.trim()));
            }
        }

        let number = |key: &str, default: u64| -> u64 {
            get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
        };

        Ok(Self {
            sites_file: get("HSEARCH_SITES_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./sites.yaml")),
            state_file: get("HSEARCH_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./hsearch-state.json")),
            crawl_every: interval("PARSER_FREQUENCY", "1m")?,
            match_every: interval("MATCHER_FREQUENCY", "1m")?,
            garbage_every: interval("GARBAGE_INTERVAL", "1h")?,
            relevance,
            proxy,
            grabber_enabled: !get("DISABLED_GRABBER").is_some_and(is_truthy),
            matcher_enabled: !get("DISABLED_MATCHER").is_some_and(is_truthy),
            garbage_enabled: !get("DISABLED_GARBAGE").is_some_and(is_truthy),
            disabled_sites,
            proxy_overrides,
            user_agent: get("HSEARCH_USER_AGENT").map(str::to_string),
            http_timeout_secs: number("HSEARCH_HTTP_TIMEOUT_SECS", 20),
            fanout_concurrency: number("HSEARCH_FANOUT_CONCURRENCY", 16).max(1) as usize,
            probe_concurrency: number("HSEARCH_PROBE_CONCURRENCY", 16).max(1) as usize,
        })
    }

    /// Applies the per-site environment flags and drops disabled sites.
    pub fn effective_sites(&self, sites: Vec<SiteDescriptor>) -> Vec<SiteDescriptor> {
        sites
            .into_iter()
            .filter(|site| {
                site.enabled
                    && !self
                        .disabled_sites
                        .contains(&env_key(&site.name).to_ascii_lowercase())
            })
            .map(|mut site| {
                if let Some(use_proxy) = self
                    .proxy_overrides
                    .get(&env_key(&site.name).to_ascii_lowercase())
                {
                    site.use_proxy = *use_proxy;
                }
                site
            })
            .collect()
    }
}
