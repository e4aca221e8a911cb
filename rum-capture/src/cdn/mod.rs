//! CDN provider detection for resource domains.
//!
//! A domain is resolved to its canonical name, which is then matched against
//! a table of known CDN domains. Resolutions are kept in a bounded LRU cache
//! and refreshed lazily once older than the TTL.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_resolver::proto::rr::RData;
use hickory_resolver::TokioAsyncResolver;
use lru::LruCache;
use metrics::{counter, gauge};
use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

const BUILTIN_PROVIDERS: &str = include_str!("providers.json");

#[derive(Error, Debug)]
pub enum CdnError {
    #[error("CNAME lookup for {domain} failed: {reason}")]
    Dns { domain: String, reason: String },
    #[error("invalid CDN table: {0}")]
    InvalidTable(#[from] serde_json::Error),
    #[error("invalid CDN domain pattern {0}")]
    InvalidPattern(String),
    #[error("CDN table is empty")]
    EmptyTable,
}

#[async_trait]
pub trait CnameLookup {
    /// Returns the canonical name of `domain`, the domain itself when it has no CNAME.
    async fn lookup_cname(&self, domain: &str) -> Result<String, CdnError>;
}

pub struct DnsCnameLookup {
    resolver: TokioAsyncResolver,
}

impl DnsCnameLookup {
    pub fn from_system_conf() -> Result<Self, CdnError> {
        let resolver =
            TokioAsyncResolver::tokio_from_system_conf().map_err(|e| CdnError::Dns {
                domain: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { resolver })
    }
}

#[async_trait]
impl CnameLookup for DnsCnameLookup {
    async fn lookup_cname(&self, domain: &str) -> Result<String, CdnError> {
        let lookup = self
            .resolver
            .lookup_ip(domain)
            .await
            .map_err(|e| CdnError::Dns {
                domain: domain.to_string(),
                reason: e.to_string(),
            })?;

        // the last CNAME of the chain is the canonical name
        let cname = lookup
            .as_lookup()
            .iter()
            .filter_map(|rdata| match rdata {
                RData::CNAME(cname) => Some(cname.0.to_utf8()),
                _ => None,
            })
            .last()
            .unwrap_or_else(|| domain.to_string());

        Ok(cname.trim_end_matches('.').to_lowercase())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct CdnProvider {
    pub domain: String,
    pub name: String,
    #[serde(default)]
    pub website: String,
}

/// Known CDN domains. Literal domains match exactly on the last two labels
/// of a CNAME, or as a substring of it. Domains holding `*` are globs, `*`
/// never crosses a dot except in the leading `*.`.
pub struct ProviderTable {
    literal: HashMap<String, CdnProvider>,
    // literal domains in table order, for the substring pass
    literal_order: Vec<String>,
    globs: Vec<(Regex, CdnProvider)>,
}

fn glob_to_regex(pattern: &str) -> Result<Regex, CdnError> {
    let pattern = pattern.to_lowercase();
    let pattern = if pattern.starts_with('*') {
        pattern
    } else if pattern.starts_with('.') {
        format!("*{pattern}")
    } else {
        format!("*.{pattern}")
    };

    let (prefix, rest) = match pattern.strip_prefix("*.") {
        Some(rest) => (r"^.+\.", rest),
        None => ("^", pattern.as_str()),
    };
    let body = rest
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(r"[^.]*");

    Regex::new(&format!("{prefix}{body}$")).map_err(|_| CdnError::InvalidPattern(pattern.clone()))
}

fn last_two_labels(cname: &str) -> &str {
    match cname.rmatch_indices('.').nth(1) {
        Some((idx, _)) => &cname[idx + 1..],
        None => cname,
    }
}

impl ProviderTable {
    pub fn builtin() -> Result<Self, CdnError> {
        Self::from_json(BUILTIN_PROVIDERS)
    }

    /// Parses a `[{"domain", "name", "website"}]` table.
    pub fn from_json(raw: &str) -> Result<Self, CdnError> {
        let providers: Vec<CdnProvider> = serde_json::from_str(raw)?;
        Self::from_providers(providers)
    }

    pub fn from_providers(providers: Vec<CdnProvider>) -> Result<Self, CdnError> {
        let mut table = Self {
            literal: HashMap::with_capacity(providers.len()),
            literal_order: Vec::with_capacity(providers.len()),
            globs: Vec::new(),
        };
        for mut provider in providers {
            provider.domain = provider.domain.trim().to_string();
            if provider.domain.is_empty() {
                continue;
            }
            if provider.domain.contains('*') {
                table.globs.push((glob_to_regex(&provider.domain)?, provider));
                continue;
            }
            let domain = provider.domain.to_lowercase();
            if table.literal.insert(domain.clone(), provider).is_none() {
                table.literal_order.push(domain);
            }
        }
        if table.literal.is_empty() && table.globs.is_empty() {
            return Err(CdnError::EmptyTable);
        }
        Ok(table)
    }

    pub fn match_cname(&self, cname: &str) -> Option<&CdnProvider> {
        let cname = cname.to_lowercase();
        if let Some(provider) = self.literal.get(last_two_labels(&cname)) {
            return Some(provider);
        }
        self.literal_order
            .iter()
            .find(|domain| cname.contains(domain.as_str()))
            .and_then(|domain| self.literal.get(domain))
            .or_else(|| {
                self.globs
                    .iter()
                    .find(|(glob, _)| glob.is_match(&cname))
                    .map(|(_, provider)| provider)
            })
    }

    pub fn len(&self) -> usize {
        self.literal.len() + self.globs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub cname: String,
    pub cdn_name: Option<String>,
}

struct CacheEntry {
    resolution: Resolution,
    created_at: Instant,
}

pub struct CdnResolver {
    lookup: Box<dyn CnameLookup + Send + Sync>,
    providers: ProviderTable,
    cache: Mutex<LruCache<String, CacheEntry>>,
    ttl: Duration,
}

impl CdnResolver {
    pub fn new(
        lookup: Box<dyn CnameLookup + Send + Sync>,
        providers: ProviderTable,
        capacity: usize,
        ttl: Duration,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            lookup,
            providers,
            cache: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    fn cache(&self) -> MutexGuard<'_, LruCache<String, CacheEntry>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Resolves the CNAME and CDN provider of `domain`. Failed lookups are
    /// returned to the caller and never cached.
    pub async fn resolve(&self, domain: &str) -> Result<Resolution, CdnError> {
        let expired = match self.cache().get(domain) {
            Some(entry) if entry.created_at.elapsed() < self.ttl => {
                counter!("rum_cdn_lookups_total", "result" => "hit").increment(1);
                return Ok(entry.resolution.clone());
            }
            Some(_) => true,
            None => false,
        };

        let cname = match self.lookup.lookup_cname(domain).await {
            Ok(cname) => cname,
            Err(err) => {
                counter!("rum_cdn_lookups_total", "result" => "error").increment(1);
                warn!("unable to lookup CDN for domain {}: {}", domain, err);
                return Err(err);
            }
        };
        let resolution = Resolution {
            cdn_name: self
                .providers
                .match_cname(&cname)
                .map(|provider| provider.name.clone()),
            cname,
        };
        debug!("resolved domain {} to {:?}", domain, resolution);

        let result = if expired { "expired" } else { "miss" };
        counter!("rum_cdn_lookups_total", "result" => result).increment(1);

        let mut cache = self.cache();
        cache.put(
            domain.to_string(),
            CacheEntry {
                resolution: resolution.clone(),
                created_at: Instant::now(),
            },
        );
        gauge!("rum_cdn_cache_entries").set(cache.len() as f64);

        Ok(resolution)
    }
}

/// Checks `s` is a presentation format domain name (RFC 1035 with the
/// usual relaxations: underscores, leading digits).
pub fn is_domain_name(s: &str) -> bool {
    if s == "." {
        return true;
    }
    let bytes = s.as_bytes();
    let len = bytes.len();
    if len == 0 || len > 254 || (len == 254 && bytes[len - 1] != b'.') {
        return false;
    }

    let mut last = b'.';
    let mut non_numeric = false;
    let mut part_len = 0;
    for &c in bytes {
        match c {
            b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                non_numeric = true;
                part_len += 1;
            }
            b'0'..=b'9' => part_len += 1,
            b'-' => {
                if last == b'.' {
                    return false;
                }
                part_len += 1;
                non_numeric = true;
            }
            b'.' => {
                if last == b'.' || last == b'-' || part_len > 63 || part_len == 0 {
                    return false;
                }
                part_len = 0;
            }
            _ => return false,
        }
        last = c;
    }
    if last == b'-' || part_len > 63 {
        return false;
    }
    non_numeric
}
