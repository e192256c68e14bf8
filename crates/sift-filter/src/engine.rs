//! The filtering orchestrator.
//!
//! [`DnsFilter::check_host`] runs a single linear pass and returns at the
//! first stage that matches:
//!
//! 1. rewrites
//! 2. filter rules (important, whitelist, blacklist)
//! 3. blocked services
//! 4. safe search
//! 5. safe browsing
//! 6. parental control
//!
//! Failures of the last three stages are logged and treated as "not matched".

use std::net::IpAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use hickory_proto::rr::RecordType;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sift_cache::CacheConfig;
use sift_config::{FilteringConfig, RewriteEntry};
use sift_metrics::{CheckTimer, FilterMetrics};
use tracing::{debug, info, instrument};

use crate::lists::{resolve_lists, FilterList, ListLoader};
use crate::reputation::{LookupStats, ReputationChecker, ReputationService};
use crate::rewrite::RewriteTable;
use crate::safesearch::{HostResolver, SafeSearch, SystemResolver};
use crate::services::{catalog, ServiceSet};
use crate::storage::RuleStorage;
use crate::upstream::{upstream_from_url, Upstream};
use crate::{normalize_host, FilterResult, Result};

/// Which checks run for a query.
#[derive(Debug, Clone)]
pub struct FilteringSettings {
    /// Apply filter rules.
    pub filtering_enabled: bool,
    /// Enforce safe search.
    pub safesearch_enabled: bool,
    /// Query safe browsing.
    pub safebrowsing_enabled: bool,
    /// Query parental control.
    pub parental_enabled: bool,
    /// Blocked services, in match order.
    pub services: Arc<ServiceSet>,
}

/// Per-client adjustment of [`FilteringSettings`].
pub trait ClientPolicy: Send + Sync {
    /// Adjusts `settings` for queries from `client`.
    fn apply(&self, client: IpAddr, settings: &mut FilteringSettings);
}

/// Applies the global settings to every client.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoClientPolicy;

impl ClientPolicy for NoClientPolicy {
    fn apply(&self, _client: IpAddr, _settings: &mut FilteringSettings) {}
}

/// Called with the new configuration after every control-plane change.
pub type ConfigModifiedHook = Box<dyn Fn(&FilteringConfig) + Send + Sync>;

/// Engine counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FilterStats {
    /// Rules in the active rule set.
    pub rules: usize,
    /// Rule sets installed so far.
    pub rules_generation: u64,
    /// Safe browsing lookups.
    pub safebrowsing: LookupStats,
    /// Parental lookups.
    pub parental: LookupStats,
    /// Safe search lookups.
    pub safesearch: LookupStats,
}

/// Builder for [`DnsFilter`].
///
/// Upstreams and the resolver default to the configured addresses and the
/// system resolver.
pub struct DnsFilterBuilder {
    config: FilteringConfig,
    safebrowsing_upstream: Option<Arc<dyn Upstream>>,
    parental_upstream: Option<Arc<dyn Upstream>>,
    resolver: Option<Arc<dyn HostResolver>>,
    client_policy: Arc<dyn ClientPolicy>,
    metrics: FilterMetrics,
}

impl DnsFilterBuilder {
    /// Uses `upstream` for safe browsing lookups.
    #[must_use]
    pub fn safebrowsing_upstream(mut self, upstream: Arc<dyn Upstream>) -> Self {
        self.safebrowsing_upstream = Some(upstream);
        self
    }

    /// Uses `upstream` for parental lookups.
    #[must_use]
    pub fn parental_upstream(mut self, upstream: Arc<dyn Upstream>) -> Self {
        self.parental_upstream = Some(upstream);
        self
    }

    /// Uses `resolver` for safe-search targets.
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<dyn HostResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Installs a per-client policy.
    #[must_use]
    pub fn client_policy(mut self, policy: Arc<dyn ClientPolicy>) -> Self {
        self.client_policy = policy;
        self
    }

    /// Uses the given metrics handle.
    #[must_use]
    pub fn metrics(mut self, metrics: FilterMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Builds the engine with an empty rule set.
    pub fn build(self) -> Result<DnsFilter> {
        let config = self.config;
        let timeout = config.upstream_timeout();

        let safebrowsing_upstream = match self.safebrowsing_upstream {
            Some(upstream) => upstream,
            None => upstream_from_url(&config.safebrowsing_upstream, timeout)?,
        };
        let parental_upstream = match self.parental_upstream {
            Some(upstream) => upstream,
            None => upstream_from_url(&config.parental_upstream, timeout)?,
        };
        let resolver = self
            .resolver
            .unwrap_or_else(|| Arc::new(SystemResolver));

        let safebrowsing = ReputationChecker::new(
            ReputationService::SafeBrowsing,
            safebrowsing_upstream,
            CacheConfig::from_minutes(config.safebrowsing_cache_size, config.cache_time),
            timeout,
            self.metrics.clone(),
        );
        let parental = ReputationChecker::new(
            ReputationService::Parental,
            parental_upstream,
            CacheConfig::from_minutes(config.parental_cache_size, config.cache_time),
            timeout,
            self.metrics.clone(),
        );
        let safesearch = SafeSearch::new(
            resolver,
            CacheConfig::from_minutes(config.safesearch_cache_size, config.cache_time),
            timeout,
        );

        info!(
            safebrowsing = safebrowsing.upstream().address(),
            parental = parental.upstream().address(),
            rewrites = config.rewrites.len(),
            services = config.blocked_services.len(),
            "Filtering engine created"
        );

        Ok(DnsFilter {
            rewrites: ArcSwap::from_pointee(RewriteTable::new(&config.rewrites)),
            services: ArcSwap::from_pointee(catalog().select(&config.blocked_services)),
            storage: Arc::new(RuleStorage::new(self.metrics.clone())),
            config: RwLock::new(config),
            safebrowsing,
            parental,
            safesearch,
            client_policy: self.client_policy,
            on_modified: RwLock::new(None),
            modify_lock: Mutex::new(()),
            metrics: self.metrics,
        })
    }
}

/// The DNS filtering engine.
pub struct DnsFilter {
    config: RwLock<FilteringConfig>,
    rewrites: ArcSwap<RewriteTable>,
    services: ArcSwap<ServiceSet>,
    storage: Arc<RuleStorage>,
    safebrowsing: ReputationChecker,
    parental: ReputationChecker,
    safesearch: SafeSearch,
    client_policy: Arc<dyn ClientPolicy>,
    on_modified: RwLock<Option<ConfigModifiedHook>>,
    /// Held from a change until its hook returns, so hooks see changes in order.
    modify_lock: Mutex<()>,
    metrics: FilterMetrics,
}

impl DnsFilter {
    /// Creates an engine with default collaborators.
    pub fn new(config: FilteringConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Starts a builder.
    pub fn builder(config: FilteringConfig) -> DnsFilterBuilder {
        DnsFilterBuilder {
            config,
            safebrowsing_upstream: None,
            parental_upstream: None,
            resolver: None,
            client_policy: Arc::new(NoClientPolicy),
            metrics: FilterMetrics::new(),
        }
    }

    /// Returns a copy of the current configuration.
    pub fn config(&self) -> FilteringConfig {
        self.config.read().clone()
    }

    /// Global settings.
    pub fn settings(&self) -> FilteringSettings {
        let services = self.services.load_full();
        let config = self.config.read();
        FilteringSettings {
            filtering_enabled: config.enabled,
            safesearch_enabled: config.safesearch_enabled,
            safebrowsing_enabled: config.safebrowsing_enabled,
            parental_enabled: config.parental_enabled,
            services,
        }
    }

    /// Settings for a client, after the client policy.
    pub fn settings_for(&self, client: IpAddr) -> FilteringSettings {
        let mut settings = self.settings();
        self.client_policy.apply(client, &mut settings);
        settings
    }

    /// Decides how to answer a query for `host`.
    ///
    /// Never fails: lookup errors in the reputation and safe-search stages
    /// are logged and skipped.
    #[instrument(skip(self, settings), level = "trace")]
    pub async fn check_host(
        &self,
        host: &str,
        qtype: RecordType,
        settings: &FilteringSettings,
    ) -> FilterResult {
        let timer = CheckTimer::start();
        let result = self.run_checks(host, qtype, settings).await;
        timer.finish(&self.metrics, result.reason.as_str());
        result
    }

    async fn run_checks(
        &self,
        host: &str,
        qtype: RecordType,
        settings: &FilteringSettings,
    ) -> FilterResult {
        let host = normalize_host(host);
        // Root server queries.
        if host.is_empty() {
            return FilterResult::not_found();
        }

        let result = self.rewrites.load().resolve(&host, qtype);
        if result.matched() {
            return result;
        }

        if settings.filtering_enabled {
            let result = self.storage.snapshot().check(&host, qtype);
            if result.matched() {
                return result;
            }
        }

        if !settings.services.is_empty() {
            let result = settings.services.check(&host);
            if result.matched() {
                return result;
            }
        }

        if settings.safesearch_enabled {
            match self.safesearch.resolve(&host).await {
                Ok(result) if result.matched() => return result,
                Ok(_) => {}
                Err(e) => info!(host = %host, error = %e, "Safe search lookup failed"),
            }
        }

        if settings.safebrowsing_enabled {
            match self.safebrowsing.check(&host).await {
                Ok(result) if result.matched() => return result,
                Ok(_) => {}
                Err(e) => info!(host = %host, error = %e, "Safe browsing lookup failed"),
            }
        }

        if settings.parental_enabled {
            match self.parental.check(&host).await {
                Ok(result) if result.matched() => return result,
                Ok(_) => {}
                Err(e) => info!(host = %host, error = %e, "Parental lookup failed"),
            }
        }

        FilterResult::not_found()
    }

    /// Replaces the filter lists.
    ///
    /// With `background` set the rebuild is queued and lookups keep using the
    /// previous rules until it finishes; otherwise this waits for the new set.
    pub async fn set_filters(&self, lists: Vec<FilterList>, background: bool) -> Result<()> {
        if background {
            self.storage.request_rebuild(lists)
        } else {
            let rules = self.storage.rebuild(Arc::new(lists)).await?;
            debug!(rules, "Filters replaced");
            Ok(())
        }
    }

    /// Resolves the configured lists and user rules, then rebuilds.
    pub async fn load_configured_lists(
        &self,
        remote: &dyn ListLoader,
        background: bool,
    ) -> Result<()> {
        let (user_rules, filters) = {
            let config = self.config.read();
            (config.user_rules.clone(), config.filters.clone())
        };
        let lists = resolve_lists(&user_rules, &filters, remote).await;
        self.set_filters(lists, background).await
    }

    /// The rule storage.
    pub fn storage(&self) -> &Arc<RuleStorage> {
        &self.storage
    }

    /// Counter snapshot.
    pub fn stats(&self) -> FilterStats {
        FilterStats {
            rules: self.storage.snapshot().len(),
            rules_generation: self.storage.generation(),
            safebrowsing: self.safebrowsing.stats(),
            parental: self.parental.stats(),
            safesearch: self.safesearch.stats(),
        }
    }

    /// Installs the hook run after every configuration change.
    pub fn set_on_config_modified(&self, hook: ConfigModifiedHook) {
        *self.on_modified.write() = Some(hook);
    }

    /// Turns safe browsing on or off.
    pub fn set_safebrowsing_enabled(&self, enabled: bool) {
        self.modify(|config| {
            config.safebrowsing_enabled = enabled;
            true
        });
    }

    /// Turns parental control on or off, optionally changing the sensitivity.
    pub fn set_parental(&self, enabled: bool, sensitivity: Option<u8>) {
        self.modify(|config| {
            config.parental_enabled = enabled;
            if let Some(sensitivity) = sensitivity {
                config.parental_sensitivity = sensitivity;
            }
            true
        });
    }

    /// Turns safe search on or off.
    pub fn set_safesearch_enabled(&self, enabled: bool) {
        self.modify(|config| {
            config.safesearch_enabled = enabled;
            true
        });
    }

    /// Turns rule filtering on or off.
    pub fn set_filtering_enabled(&self, enabled: bool) {
        self.modify(|config| {
            config.enabled = enabled;
            true
        });
    }

    /// Configured blocked service names.
    pub fn blocked_services(&self) -> Vec<String> {
        self.config.read().blocked_services.clone()
    }

    /// Replaces the blocked services.
    ///
    /// Unknown names are kept in the configuration but match nothing.
    pub fn set_blocked_services(&self, names: Vec<String>) {
        self.modify(|config| {
            self.services.store(Arc::new(catalog().select(&names)));
            config.blocked_services = names;
            true
        });
    }

    /// Configured rewrites.
    pub fn rewrites(&self) -> Vec<RewriteEntry> {
        self.config.read().rewrites.clone()
    }

    /// Appends a rewrite.
    pub fn add_rewrite(&self, entry: RewriteEntry) {
        info!(domain = %entry.domain, answer = %entry.answer, "Added rewrite");
        self.modify(|config| {
            config.rewrites.push(entry);
            self.refresh_rewrites(config);
            true
        });
    }

    /// Removes every rewrite equal to `entry`; returns true if any was removed.
    pub fn delete_rewrite(&self, entry: &RewriteEntry) -> bool {
        let removed = self.modify(|config| {
            let before = config.rewrites.len();
            config.rewrites.retain(|e| e != entry);
            if config.rewrites.len() == before {
                return false;
            }
            self.refresh_rewrites(config);
            true
        });
        if removed {
            info!(domain = %entry.domain, answer = %entry.answer, "Removed rewrite");
        }
        removed
    }

    /// Replaces the whole configuration.
    ///
    /// Upstreams and cache sizes keep the values the engine was built with.
    pub fn update_config(&self, config: FilteringConfig) {
        let _order = self.modify_lock.lock();
        self.services
            .store(Arc::new(catalog().select(&config.blocked_services)));
        self.rewrites
            .store(Arc::new(RewriteTable::new(&config.rewrites)));
        *self.config.write() = config;
    }

    fn refresh_rewrites(&self, config: &FilteringConfig) {
        self.rewrites
            .store(Arc::new(RewriteTable::new(&config.rewrites)));
    }

    /// Applies `change` and, if it reports a change, runs the hook on the
    /// result before the next change can start.
    fn modify(&self, change: impl FnOnce(&mut FilteringConfig) -> bool) -> bool {
        let _order = self.modify_lock.lock();
        let snapshot = {
            let mut config = self.config.write();
            if !change(&mut config) {
                return false;
            }
            config.clone()
        };
        if let Some(hook) = self.on_modified.read().as_ref() {
            hook(&snapshot);
        }
        true
    }
}

impl std::fmt::Debug for DnsFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DnsFilter")
            .field("storage", &self.storage)
            .field("safebrowsing", &self.safebrowsing)
            .field("parental", &self.parental)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FilterError, Reason};
    use async_trait::async_trait;
    use data_encoding::HEXLOWER;
    use hickory_proto::op::{Message, MessageType};
    use hickory_proto::rr::rdata::TXT;
    use hickory_proto::rr::{RData, Record};
    use sha2::{Digest, Sha256};
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Lists every hash it was built with under any requested prefix.
    struct ListedUpstream {
        listed: Vec<[u8; 32]>,
        requests: AtomicUsize,
        fail: AtomicBool,
    }

    impl ListedUpstream {
        fn new(names: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                listed: names
                    .iter()
                    .map(|n| Sha256::digest(n.as_bytes()).into())
                    .collect(),
                requests: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl Upstream for ListedUpstream {
        async fn exchange(&self, request: &Message) -> Result<Message> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(FilterError::Timeout);
            }
            let query = request.queries()[0].clone();
            let mut response = Message::new();
            response
                .set_id(request.id())
                .set_message_type(MessageType::Response);
            let answers: Vec<String> = self.listed.iter().map(|h| HEXLOWER.encode(h)).collect();
            response.add_answer(Record::from_rdata(
                query.name().clone(),
                60,
                RData::TXT(TXT::new(answers)),
            ));
            Ok(response)
        }

        fn address(&self) -> &str {
            "mock"
        }
    }

    struct FixedResolver;

    #[async_trait]
    impl HostResolver for FixedResolver {
        async fn lookup_ipv4(&self, _host: &str) -> Result<Vec<Ipv4Addr>> {
            Ok(vec![Ipv4Addr::new(216, 239, 38, 120)])
        }
    }

    /// Disables everything but rule filtering for 10.0.0.0/8 clients.
    struct KidsOnly;

    impl ClientPolicy for KidsOnly {
        fn apply(&self, client: IpAddr, settings: &mut FilteringSettings) {
            if let IpAddr::V4(v4) = client {
                if v4.octets()[0] == 10 {
                    settings.parental_enabled = true;
                    settings.safesearch_enabled = true;
                } else {
                    settings.filtering_enabled = false;
                }
            }
        }
    }

    fn filter_with(config: FilteringConfig, upstream: Arc<ListedUpstream>) -> DnsFilter {
        DnsFilter::builder(config)
            .safebrowsing_upstream(upstream.clone())
            .parental_upstream(upstream)
            .resolver(Arc::new(FixedResolver))
            .client_policy(Arc::new(KidsOnly))
            .build()
            .unwrap()
    }

    fn all_enabled() -> FilteringConfig {
        FilteringConfig {
            safebrowsing_enabled: true,
            parental_enabled: true,
            safesearch_enabled: true,
            ..FilteringConfig::default()
        }
    }

    #[tokio::test]
    async fn test_empty_host() {
        let filter = filter_with(all_enabled(), ListedUpstream::new(&[]));
        let result = filter.check_host("", RecordType::A, &filter.settings()).await;
        assert!(!result.matched());
    }

    #[tokio::test]
    async fn test_rewrite_beats_rules() {
        let mut config = all_enabled();
        config.rewrites = vec![RewriteEntry::new("example.org", "1.2.3.4")];
        let filter = filter_with(config, ListedUpstream::new(&["example.org"]));
        filter
            .set_filters(vec![FilterList::text(1, "||example.org^")], false)
            .await
            .unwrap();

        let result = filter
            .check_host("EXAMPLE.ORG.", RecordType::A, &filter.settings())
            .await;
        assert_eq!(result.reason, Reason::Rewrite);
        assert_eq!(result.ip_list, vec![IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))]);
    }

    #[tokio::test]
    async fn test_rules_then_reputation() {
        let upstream = ListedUpstream::new(&["malware.example"]);
        let filter = filter_with(all_enabled(), upstream.clone());
        filter
            .set_filters(
                vec![FilterList::text(3, "||ads.example^\n@@||malware.example^")],
                false,
            )
            .await
            .unwrap();
        let settings = filter.settings();

        let result = filter.check_host("ads.example", RecordType::A, &settings).await;
        assert_eq!(result.reason, Reason::FilteredBlackList);
        assert_eq!(result.filter_id, Some(3));

        // The whitelist match stops the pass before any reputation lookup.
        let result = filter.check_host("malware.example", RecordType::A, &settings).await;
        assert_eq!(result.reason, Reason::NotFilteredWhiteList);
        assert_eq!(upstream.requests.load(Ordering::SeqCst), 0);

        filter.set_filtering_enabled(false);
        let result = filter
            .check_host("malware.example", RecordType::A, &filter.settings())
            .await;
        assert_eq!(result.reason, Reason::FilteredSafeBrowsing);
    }

    #[tokio::test]
    async fn test_blocked_services_before_safe_search() {
        let mut config = all_enabled();
        config.blocked_services = vec!["youtube".to_string()];
        let filter = filter_with(config, ListedUpstream::new(&[]));

        let result = filter
            .check_host("www.youtube.com", RecordType::A, &filter.settings())
            .await;
        assert_eq!(result.reason, Reason::FilteredBlockedService);
        assert_eq!(result.service_name.as_deref(), Some("youtube"));

        filter.set_blocked_services(Vec::new());
        let result = filter
            .check_host("www.youtube.com", RecordType::A, &filter.settings())
            .await;
        assert_eq!(result.reason, Reason::FilteredSafeSearch);
    }

    #[tokio::test]
    async fn test_safe_search_toggle() {
        let filter = filter_with(FilteringConfig::default(), ListedUpstream::new(&[]));

        let off = filter
            .check_host("www.google.com", RecordType::A, &filter.settings())
            .await;
        assert!(!off.is_filtered);

        filter.set_safesearch_enabled(true);
        let on = filter
            .check_host("www.google.com", RecordType::A, &filter.settings())
            .await;
        assert!(on.is_filtered);
        assert_eq!(on.ip, Some(IpAddr::V4(Ipv4Addr::new(216, 239, 38, 120))));
    }

    #[tokio::test]
    async fn test_fail_open() {
        let upstream = ListedUpstream::new(&["malware.example"]);
        upstream.fail.store(true, Ordering::SeqCst);
        let filter = filter_with(all_enabled(), upstream.clone());

        let result = filter
            .check_host("malware.example", RecordType::A, &filter.settings())
            .await;
        assert!(!result.is_filtered);
        assert_eq!(result.reason, Reason::NotFilteredNotFound);
        // Safe browsing and parental each tried once.
        assert_eq!(upstream.requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_parental_after_safe_browsing() {
        let mut config = FilteringConfig::default();
        config.parental_enabled = true;
        let filter = filter_with(config, ListedUpstream::new(&["adult.example"]));

        let result = filter
            .check_host("adult.example", RecordType::A, &filter.settings())
            .await;
        assert_eq!(result.reason, Reason::FilteredParental);
        assert_eq!(filter.stats().parental.requests, 1);
        assert_eq!(filter.stats().safebrowsing.requests, 0);
    }

    #[tokio::test]
    async fn test_client_policy() {
        let filter = filter_with(FilteringConfig::default(), ListedUpstream::new(&["adult.example"]));
        filter
            .set_filters(vec![FilterList::text(1, "||ads.example^")], false)
            .await
            .unwrap();

        let kid = filter.settings_for("10.1.2.3".parse().unwrap());
        assert!(kid.parental_enabled);
        let result = filter.check_host("adult.example", RecordType::A, &kid).await;
        assert_eq!(result.reason, Reason::FilteredParental);

        let other = filter.settings_for("192.168.1.1".parse().unwrap());
        assert!(!other.filtering_enabled);
        let result = filter.check_host("ads.example", RecordType::A, &other).await;
        assert!(!result.matched());
    }

    #[tokio::test]
    async fn test_config_modified_hook() {
        let filter = filter_with(FilteringConfig::default(), ListedUpstream::new(&[]));
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        filter.set_on_config_modified(Box::new(move |config| {
            seen.fetch_add(1, Ordering::SeqCst);
            assert!(config.safebrowsing_enabled);
        }));

        filter.set_safebrowsing_enabled(true);
        filter.add_rewrite(RewriteEntry::new("a.example", "1.1.1.1"));
        assert!(filter.delete_rewrite(&RewriteEntry::new("a.example", "1.1.1.1")));
        assert!(!filter.delete_rewrite(&RewriteEntry::new("a.example", "1.1.1.1")));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_concurrent_changes_persist_in_order() {
        let filter = Arc::new(filter_with(FilteringConfig::default(), ListedUpstream::new(&[])));
        let saved: Arc<parking_lot::Mutex<Option<FilteringConfig>>> = Arc::default();
        let first = Arc::new(AtomicBool::new(true));

        let sink = Arc::clone(&saved);
        filter.set_on_config_modified(Box::new(move |config| {
            if first.swap(false, Ordering::SeqCst) {
                std::thread::sleep(std::time::Duration::from_millis(200));
            }
            *sink.lock() = Some(config.clone());
        }));

        let slow = {
            let filter = Arc::clone(&filter);
            std::thread::spawn(move || filter.set_safebrowsing_enabled(true))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        filter.set_safesearch_enabled(true);
        slow.join().unwrap();

        let last = saved.lock().clone().unwrap();
        assert!(last.safebrowsing_enabled);
        assert!(last.safesearch_enabled);
        assert_eq!(filter.config().safesearch_enabled, last.safesearch_enabled);
    }

    #[tokio::test]
    async fn test_root_query_is_not_filtered() {
        let filter = filter_with(all_enabled(), ListedUpstream::new(&[""]));
        filter
            .set_filters(vec![FilterList::text(1, "/^$/")], false)
            .await
            .unwrap();

        for host in ["", "."] {
            let result = filter.check_host(host, RecordType::A, &filter.settings()).await;
            assert_eq!(result.reason, Reason::NotFilteredNotFound, "{host:?}");
            assert!(result.rule.is_none());
        }
        assert_eq!(filter.stats().safebrowsing.requests, 0);
    }

    #[tokio::test]
    async fn test_rewrite_edits_apply() {
        let filter = filter_with(FilteringConfig::default(), ListedUpstream::new(&[]));
        let entry = RewriteEntry::new("*.lan.example", "192.168.0.10");

        filter.add_rewrite(entry.clone());
        let result = filter
            .check_host("nas.lan.example", RecordType::A, &filter.settings())
            .await;
        assert_eq!(result.reason, Reason::Rewrite);

        filter.delete_rewrite(&entry);
        assert!(filter.rewrites().is_empty());
        let result = filter
            .check_host("nas.lan.example", RecordType::A, &filter.settings())
            .await;
        assert!(!result.matched());
    }

    #[tokio::test]
    async fn test_background_set_filters() {
        let filter = filter_with(FilteringConfig::default(), ListedUpstream::new(&[]));
        let mut installed = filter.storage().subscribe();

        filter
            .set_filters(vec![FilterList::text(1, "||late.example^")], true)
            .await
            .unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(5), installed.wait_for(|g| *g >= 1))
            .await
            .unwrap()
            .unwrap();

        let result = filter
            .check_host("late.example", RecordType::A, &filter.settings())
            .await;
        assert!(result.is_filtered);
        assert_eq!(filter.stats().rules, 1);
    }
}
