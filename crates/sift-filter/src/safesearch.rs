//! Safe-search enforcement.
//!
//! Well-known search engine hosts are answered with the address of their
//! enforced safe-search endpoint. Targets are either literal IPs or hostnames
//! resolved to their first IPv4 address; results are cached per queried host.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hashbrown::HashMap;
use once_cell::sync::Lazy;
use sift_cache::{CacheConfig, ExpiringCache};
use tracing::{debug, trace};

use crate::reputation::{LookupCounters, LookupStats};
use crate::{FilterError, FilterResult, Reason, Result};

const GOOGLE_SAFE: &str = "forcesafesearch.google.com";
const YANDEX_SAFE: &str = "213.180.193.56";
const YOUTUBE_SAFE: &str = "restrictmoderate.youtube.com";

const DOMAINS: &[(&str, &str)] = &[
    ("yandex.com", YANDEX_SAFE),
    ("yandex.ru", YANDEX_SAFE),
    ("yandex.ua", YANDEX_SAFE),
    ("yandex.by", YANDEX_SAFE),
    ("yandex.kz", YANDEX_SAFE),
    ("www.yandex.com", YANDEX_SAFE),
    ("www.yandex.ru", YANDEX_SAFE),
    ("www.yandex.ua", YANDEX_SAFE),
    ("www.yandex.by", YANDEX_SAFE),
    ("www.yandex.kz", YANDEX_SAFE),
    ("www.bing.com", "strict.bing.com"),
    ("duckduckgo.com", "safe.duckduckgo.com"),
    ("www.duckduckgo.com", "safe.duckduckgo.com"),
    ("start.duckduckgo.com", "safe.duckduckgo.com"),
    ("www.youtube.com", YOUTUBE_SAFE),
    ("m.youtube.com", YOUTUBE_SAFE),
    ("youtubei.googleapis.com", YOUTUBE_SAFE),
    ("youtube.googleapis.com", YOUTUBE_SAFE),
    ("www.youtube-nocookie.com", YOUTUBE_SAFE),
    ("pixabay.com", "safesearch.pixabay.com"),
];

/// Country domains served as `www.google.<suffix>`.
const GOOGLE_SUFFIXES: &[&str] = &[
    "com", "ad", "ae", "com.af", "com.ag", "com.ai", "al", "am", "co.ao", "com.ar", "as",
    "at", "com.au", "az", "ba", "com.bd", "be", "bf", "bg", "com.bh", "bi", "bj", "com.bn",
    "com.bo", "com.br", "bs", "bt", "co.bw", "by", "com.bz", "ca", "cd", "cf", "cg", "ch",
    "ci", "co.ck", "cl", "cm", "cn", "com.co", "co.cr", "com.cu", "cv", "com.cy", "cz",
    "de", "dj", "dk", "dm", "com.do", "dz", "com.ec", "ee", "com.eg", "es", "com.et", "fi",
    "com.fj", "fm", "fr", "ga", "ge", "gg", "com.gh", "com.gi", "gl", "gm", "gp", "gr",
    "com.gt", "gy", "com.hk", "hn", "hr", "ht", "hu", "co.id", "ie", "co.il", "im", "co.in",
    "iq", "is", "it", "je", "com.jm", "jo", "co.jp", "co.ke", "com.kh", "ki", "kg", "co.kr",
    "com.kw", "kz", "la", "com.lb", "li", "lk", "co.ls", "lt", "lu", "lv", "com.ly",
    "co.ma", "md", "me", "mg", "mk", "ml", "com.mm", "mn", "ms", "com.mt", "mu", "mv", "mw",
    "com.mx", "com.my", "co.mz", "com.na", "com.nf", "com.ng", "com.ni", "ne", "nl", "no",
    "com.np", "nr", "nu", "co.nz", "com.om", "com.pa", "com.pe", "com.pg", "com.ph",
    "com.pk", "pl", "pn", "com.pr", "ps", "pt", "com.py", "com.qa", "ro", "ru", "rw",
    "com.sa", "com.sb", "sc", "se", "com.sg", "sh", "si", "sk", "com.sl", "sn", "so", "sm",
    "sr", "st", "com.sv", "td", "tg", "co.th", "com.tj", "tk", "tl", "tm", "tn", "to",
    "com.tr", "tt", "com.tw", "co.tz", "com.ua", "co.ug", "co.uk", "com.uy", "co.uz",
    "com.vc", "co.ve", "vg", "co.vi", "com.vn", "vu", "ws", "rs",
];

static TABLE: Lazy<HashMap<String, &'static str>> = Lazy::new(|| {
    let mut table: HashMap<String, &'static str> = DOMAINS
        .iter()
        .map(|&(host, target)| (host.to_string(), target))
        .collect();
    for suffix in GOOGLE_SUFFIXES {
        table.insert(format!("www.google.{suffix}"), GOOGLE_SAFE);
    }
    table
});

/// Returns the safe-search target for a normalized host.
pub fn safe_search_target(host: &str) -> Option<&'static str> {
    TABLE.get(host).copied()
}

/// Resolves hostnames to IPv4 addresses.
#[async_trait]
pub trait HostResolver: Send + Sync {
    /// Returns the IPv4 addresses of `host`.
    async fn lookup_ipv4(&self, host: &str) -> Result<Vec<Ipv4Addr>>;
}

/// Resolver backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl HostResolver for SystemResolver {
    async fn lookup_ipv4(&self, host: &str) -> Result<Vec<Ipv4Addr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs
            .filter_map(|addr| match addr.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect())
    }
}

/// Safe-search resolver with a per-host cache.
pub struct SafeSearch {
    resolver: Arc<dyn HostResolver>,
    cache: ExpiringCache<String, IpAddr>,
    counters: LookupCounters,
    timeout: Duration,
}

impl SafeSearch {
    /// Creates a resolver.
    pub fn new(resolver: Arc<dyn HostResolver>, cache: CacheConfig, timeout: Duration) -> Self {
        Self {
            resolver,
            cache: ExpiringCache::new(cache),
            counters: LookupCounters::default(),
            timeout,
        }
    }

    /// Counter snapshot.
    pub fn stats(&self) -> LookupStats {
        self.counters.snapshot()
    }

    /// Resolves a normalized host.
    ///
    /// Hosts outside the table are not matched and never touch the cache. A
    /// target hostname without IPv4 addresses is an error and is not cached.
    pub async fn resolve(&self, host: &str) -> Result<FilterResult> {
        let Some(target) = safe_search_target(host) else {
            return Ok(FilterResult::not_found());
        };

        let key = host.to_string();
        if let Some(ip) = self.cache.get(&key) {
            self.counters.record_cache_hit();
            trace!(host, %ip, "Safe search answer cached");
            return Ok(Self::redirected(ip));
        }

        let ip = match target.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => IpAddr::V4(self.lookup(target).await?),
        };

        self.cache.insert(key, ip);
        debug!(host, target, %ip, "Safe search answer stored");
        Ok(Self::redirected(ip))
    }

    async fn lookup(&self, target: &str) -> Result<Ipv4Addr> {
        let _pending = self.counters.begin_request();
        let addrs = tokio::time::timeout(self.timeout, self.resolver.lookup_ipv4(target))
            .await
            .map_err(|_| FilterError::Timeout)??;
        addrs
            .first()
            .copied()
            .ok_or_else(|| FilterError::NoIpv4(target.to_string()))
    }

    fn redirected(ip: IpAddr) -> FilterResult {
        let mut result = FilterResult::with_reason(Reason::FilteredSafeSearch);
        result.ip = Some(ip);
        result
    }
}

impl std::fmt::Debug for SafeSearch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeSearch")
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}
