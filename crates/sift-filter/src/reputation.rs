//! Hash-prefix reputation lookups (safe browsing and parental control).
//!
//! The queried host is never sent upstream. Each of its parent names (down to,
//! but not including, the public suffix) is hashed with SHA-256 and only the
//! first two bytes of every hash travel in a TXT question:
//!
//! ```text
//! 4f1a.9c03.sb.dns.adguard.com. TXT
//! ```
//!
//! The server answers with every full hash it knows under those prefixes. The
//! host is listed when one of them equals one of our hashes. Answers are cached
//! per prefix; an empty bucket is a negative entry.

use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use hashbrown::HashMap;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sift_cache::{CacheConfig, ExpiringCache};
use sift_metrics::FilterMetrics;
use tracing::{debug, instrument, trace};

use crate::upstream::Upstream;
use crate::{FilterError, FilterResult, Reason, Result};

/// Maximum number of labels hashed, counted from the right.
const MAX_LABELS: usize = 4;

type Prefix = [u8; 2];
type Hash = [u8; 32];

/// Which reputation category a checker serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReputationService {
    /// Malware and phishing.
    SafeBrowsing,
    /// Adult content.
    Parental,
}

impl ReputationService {
    /// Short name used in logs and metrics.
    pub const fn name(self) -> &'static str {
        match self {
            Self::SafeBrowsing => "safebrowsing",
            Self::Parental => "parental",
        }
    }

    /// Zone the hash prefixes are queried under.
    pub const fn txt_suffix(self) -> &'static str {
        match self {
            Self::SafeBrowsing => "sb.dns.adguard.com.",
            Self::Parental => "pc.dns.adguard.com.",
        }
    }

    /// Rule text reported for a listed host.
    pub const fn rule(self) -> &'static str {
        match self {
            Self::SafeBrowsing => "adguard-malware-shavar",
            Self::Parental => "parental CATEGORY_BLACKLISTED",
        }
    }

    /// Verdict reason for a listed host.
    pub const fn reason(self) -> Reason {
        match self {
            Self::SafeBrowsing => Reason::FilteredSafeBrowsing,
            Self::Parental => Reason::FilteredParental,
        }
    }
}

/// Snapshot of lookup counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LookupStats {
    /// Upstream requests sent.
    pub requests: u64,
    /// Lookups answered from the cache.
    pub cache_hits: u64,
    /// Requests currently in flight.
    pub pending: i64,
    /// Highest in-flight count seen.
    pub pending_max: i64,
}

/// Lock-free lookup counters.
#[derive(Debug, Default)]
pub(crate) struct LookupCounters {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    pending: AtomicI64,
    pending_max: AtomicI64,
}

impl LookupCounters {
    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a request and marks it pending until the guard drops.
    pub(crate) fn begin_request(&self) -> PendingGuard<'_> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let pending = self.pending.fetch_add(1, Ordering::Relaxed) + 1;
        self.pending_max.fetch_max(pending, Ordering::Relaxed);
        PendingGuard { counters: self }
    }

    pub(crate) fn pending(&self) -> i64 {
        self.pending.load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(&self) -> LookupStats {
        LookupStats {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            pending: self.pending.load(Ordering::Relaxed),
            pending_max: self.pending_max.load(Ordering::Relaxed),
        }
    }
}

pub(crate) struct PendingGuard<'a> {
    counters: &'a LookupCounters,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.counters.pending.fetch_sub(1, Ordering::Relaxed);
    }
}

/// One hashed parent name of the queried host.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Candidate {
    hash: Hash,
    name: String,
}

impl Candidate {
    fn prefix(&self) -> Prefix {
        [self.hash[0], self.hash[1]]
    }
}

enum CacheVerdict {
    Listed,
    Clean,
    Missing(Vec<Prefix>),
}

/// Checks hosts against one reputation category.
pub struct ReputationChecker {
    service: ReputationService,
    upstream: Arc<dyn Upstream>,
    cache: ExpiringCache<Prefix, Vec<Hash>>,
    counters: LookupCounters,
    timeout: Duration,
    metrics: FilterMetrics,
}

impl ReputationChecker {
    /// Creates a checker.
    pub fn new(
        service: ReputationService,
        upstream: Arc<dyn Upstream>,
        cache: CacheConfig,
        timeout: Duration,
        metrics: FilterMetrics,
    ) -> Self {
        Self {
            service,
            upstream,
            cache: ExpiringCache::new(cache),
            counters: LookupCounters::default(),
            timeout,
            metrics,
        }
    }

    /// Category served by this checker.
    pub fn service(&self) -> ReputationService {
        self.service
    }

    /// The upstream queried on cache misses.
    pub fn upstream(&self) -> &dyn Upstream {
        self.upstream.as_ref()
    }

    /// Counter snapshot.
    pub fn stats(&self) -> LookupStats {
        self.counters.snapshot()
    }

    /// Checks a normalized host.
    ///
    /// Network and protocol failures are returned as errors and leave the
    /// cache untouched.
    #[instrument(skip(self), fields(service = self.service.name()), level = "trace")]
    pub async fn check(&self, host: &str) -> Result<FilterResult> {
        if self
            .upstream
            .host()
            .is_some_and(|own| own.eq_ignore_ascii_case(host))
        {
            trace!("Skipping check of the reputation server itself");
            return Ok(FilterResult::not_found());
        }

        let candidates = hostname_hashes(host);
        if candidates.is_empty() {
            return Ok(FilterResult::not_found());
        }

        let missing = match self.cached(&candidates) {
            CacheVerdict::Listed => {
                self.record_cache_hit();
                debug!(service = self.service.name(), host, "Listed (cached)");
                return Ok(self.listed());
            }
            CacheVerdict::Clean => {
                self.record_cache_hit();
                debug!(service = self.service.name(), host, "Not listed (cached)");
                return Ok(FilterResult::not_found());
            }
            CacheVerdict::Missing(prefixes) => prefixes,
        };

        let received = match self.request(&missing).await {
            Ok(received) => received,
            Err(e) => {
                self.metrics.record_reputation_failure(self.service.name());
                return Err(e);
            }
        };

        let matched = received
            .iter()
            .find_map(|hash| candidates.iter().find(|c| &c.hash == hash));
        self.store(&missing, received);

        match matched {
            Some(candidate) => {
                debug!(
                    service = self.service.name(),
                    host,
                    matched = %candidate.name,
                    "Listed"
                );
                Ok(self.listed())
            }
            None => Ok(FilterResult::not_found()),
        }
    }

    fn listed(&self) -> FilterResult {
        FilterResult::with_reason(self.service.reason()).rule(self.service.rule())
    }

    fn record_cache_hit(&self) {
        self.counters.record_cache_hit();
        self.metrics.record_reputation_cache_hit(self.service.name());
    }

    fn cached(&self, candidates: &[Candidate]) -> CacheVerdict {
        let mut missing = Vec::new();
        for candidate in candidates {
            let prefix = candidate.prefix();
            if missing.contains(&prefix) {
                continue;
            }
            match self.cache.get(&prefix) {
                Some(bucket) => {
                    if candidates.iter().any(|c| bucket.contains(&c.hash)) {
                        return CacheVerdict::Listed;
                    }
                }
                None => missing.push(prefix),
            }
        }

        if missing.is_empty() {
            CacheVerdict::Clean
        } else {
            CacheVerdict::Missing(missing)
        }
    }

    /// Sends one TXT question for `prefixes` and returns the full hashes received.
    async fn request(&self, prefixes: &[Prefix]) -> Result<Vec<Hash>> {
        let question = question_name(prefixes, self.service.txt_suffix());
        trace!(service = self.service.name(), %question, "Querying reputation upstream");

        let mut message = Message::new();
        message
            .set_id(rand::random::<u16>())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(Name::from_str(&question)?, RecordType::TXT));

        let outcome = {
            let _pending = self.counters.begin_request();
            self.metrics.record_reputation_request(self.service.name());
            self.metrics
                .set_reputation_pending(self.service.name(), self.counters.pending());
            tokio::time::timeout(self.timeout, self.upstream.exchange(&message)).await
        };
        self.metrics
            .set_reputation_pending(self.service.name(), self.counters.pending());

        let response = outcome.map_err(|_| FilterError::Timeout)??;

        match response.response_code() {
            ResponseCode::NoError | ResponseCode::NXDomain => {}
            code => {
                return Err(FilterError::Protocol(format!(
                    "{} answered {code}",
                    self.upstream.address()
                )))
            }
        }

        Ok(received_hashes(&response))
    }

    /// Caches every received hash under its prefix and marks requested
    /// prefixes without hashes as clean.
    fn store(&self, requested: &[Prefix], received: Vec<Hash>) {
        let mut buckets: HashMap<Prefix, Vec<Hash>> = HashMap::new();
        for hash in received {
            buckets.entry([hash[0], hash[1]]).or_default().push(hash);
        }
        for prefix in requested {
            buckets.entry(*prefix).or_default();
        }
        for (prefix, mut hashes) in buckets {
            hashes.sort_unstable();
            hashes.dedup();
            trace!(service = self.service.name(), prefix = %HEXLOWER.encode(&prefix), hashes = hashes.len(), "Cached bucket");
            self.cache.insert(prefix, hashes);
        }
    }
}

impl std::fmt::Debug for ReputationChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReputationChecker")
            .field("service", &self.service)
            .field("upstream", &self.upstream.address())
            .field("cached_prefixes", &self.cache.len())
            .finish_non_exhaustive()
    }
}

/// Returns the ICANN public suffix of `host`, if it has one.
///
/// Private suffixes (`cloudfront.net`) and unlisted TLDs count as none.
fn icann_suffix(host: &str) -> Option<&str> {
    let suffix = psl::suffix(host.as_bytes())?;
    if !matches!(suffix.typ(), Some(psl::Type::Icann)) {
        return None;
    }
    std::str::from_utf8(suffix.as_bytes()).ok()
}

/// Hashes `host` and its parents, most specific first.
///
/// Only the last four labels are considered (`x.a.b.c.d` starts at
/// `a.b.c.d`) and the public suffix itself is never hashed.
fn hostname_hashes(host: &str) -> Vec<Candidate> {
    let suffix = icann_suffix(host);

    let mut current = match host.rmatch_indices('.').nth(MAX_LABELS - 1) {
        Some((dot, _)) => &host[dot + 1..],
        None => host,
    };

    let mut candidates = Vec::with_capacity(MAX_LABELS);
    while !current.is_empty() && Some(current) != suffix {
        candidates.push(Candidate {
            hash: Sha256::digest(current.as_bytes()).into(),
            name: current.to_string(),
        });
        match current.split_once('.') {
            Some((_, parent)) => current = parent,
            None => break,
        }
    }
    candidates
}

fn question_name(prefixes: &[Prefix], suffix: &str) -> String {
    let mut question = String::with_capacity(prefixes.len() * 5 + suffix.len());
    for prefix in prefixes {
        question.push_str(&HEXLOWER.encode(prefix));
        question.push('.');
    }
    question.push_str(suffix);
    question
}

/// Decodes the 64-character hex strings of every TXT answer.
fn received_hashes(response: &Message) -> Vec<Hash> {
    let mut hashes = Vec::new();
    for record in response.answers() {
        let Some(RData::TXT(txt)) = record.data() else {
            continue;
        };
        for data in txt.txt_data() {
            if data.len() != 64 {
                continue;
            }
            let Ok(bytes) = HEXLOWER_PERMISSIVE.decode(data) else {
                continue;
            };
            if let Ok(hash) = Hash::try_from(bytes.as_slice()) {
                hashes.push(hash);
            }
        }
    }
    hashes
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hickory_proto::rr::rdata::TXT;
    use hickory_proto::rr::Record;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    /// Answers TXT questions from a fixed set of listed names.
    struct MockUpstream {
        listed: Vec<Hash>,
        requests: AtomicUsize,
        fail: AtomicBool,
        host: Option<String>,
    }

    impl MockUpstream {
        fn new(listed: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                listed: listed
                    .iter()
                    .map(|name| Sha256::digest(name.as_bytes()).into())
                    .collect(),
                requests: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
                host: Some("reputation.example".to_string()),
            })
        }

        fn requests(&self) -> usize {
            self.requests.load(Ordering::SeqCst)
        }

        fn set_failing(&self, fail: bool) {
            self.fail.store(fail, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Upstream for MockUpstream {
        async fn exchange(&self, request: &Message) -> Result<Message> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(FilterError::Network("unreachable".to_string()));
            }

            let query = request.queries()[0].clone();
            let question = query.name().to_ascii();
            let prefixes: Vec<Vec<u8>> = question
                .split('.')
                .filter(|label| label.len() == 4)
                .filter_map(|label| HEXLOWER.decode(label.as_bytes()).ok())
                .collect();

            let mut response = Message::new();
            response
                .set_id(request.id())
                .set_message_type(MessageType::Response)
                .add_query(query.clone());
            for hash in &self.listed {
                if prefixes.iter().any(|p| p.as_slice() == &hash[..2]) {
                    response.add_answer(Record::from_rdata(
                        query.name().clone(),
                        60,
                        RData::TXT(TXT::new(vec![HEXLOWER.encode(hash)])),
                    ));
                }
            }
            Ok(response)
        }

        fn address(&self) -> &str {
            "mock"
        }

        fn host(&self) -> Option<&str> {
            self.host.as_deref()
        }
    }

    /// Holds every exchange until `gate` has as many waiters as it was built for.
    struct GatedUpstream {
        inner: Arc<MockUpstream>,
        gate: tokio::sync::Barrier,
    }

    #[async_trait]
    impl Upstream for GatedUpstream {
        async fn exchange(&self, request: &Message) -> Result<Message> {
            self.gate.wait().await;
            self.inner.exchange(request).await
        }

        fn address(&self) -> &str {
            "gated"
        }
    }

    fn checker(service: ReputationService, upstream: Arc<MockUpstream>) -> ReputationChecker {
        ReputationChecker::new(
            service,
            upstream,
            CacheConfig::from_minutes(1024 * 1024, 30),
            Duration::from_secs(1),
            FilterMetrics::new(),
        )
    }

    fn names(host: &str) -> Vec<String> {
        hostname_hashes(host).into_iter().map(|c| c.name).collect()
    }

    #[test]
    fn test_hash_descent() {
        assert_eq!(names("test.example.org"), vec!["test.example.org", "example.org"]);
        assert_eq!(names("example.co.uk"), vec!["example.co.uk"]);
        assert_eq!(
            names("xxx.a.b.c.com"),
            vec!["a.b.c.com", "b.c.com", "c.com"]
        );
        assert!(names("org").is_empty());
    }

    #[test]
    fn test_hash_private_suffix() {
        assert_eq!(
            names("d1.cloudfront.net"),
            vec!["d1.cloudfront.net", "cloudfront.net", "net"]
        );
    }

    #[test]
    fn test_hash_values() {
        let candidates = hostname_hashes("example.org");
        let expected: Hash = Sha256::digest(b"example.org").into();
        assert_eq!(candidates[0].hash, expected);
    }

    #[test]
    fn test_question_name() {
        let question = question_name(&[[0x4f, 0x1a], [0x00, 0x03]], "sb.dns.adguard.com.");
        assert_eq!(question, "4f1a.0003.sb.dns.adguard.com.");
    }

    #[tokio::test]
    async fn test_listed_host() {
        let upstream = MockUpstream::new(&["malware.example.org"]);
        let checker = checker(ReputationService::SafeBrowsing, upstream.clone());

        let result = checker.check("www.malware.example.org").await.unwrap();
        assert!(result.is_filtered);
        assert_eq!(result.reason, Reason::FilteredSafeBrowsing);
        assert_eq!(result.rule.as_deref(), Some("adguard-malware-shavar"));
        assert_eq!(upstream.requests(), 1);
    }

    #[tokio::test]
    async fn test_parental_rule() {
        let upstream = MockUpstream::new(&["adult.example"]);
        let checker = checker(ReputationService::Parental, upstream);

        let result = checker.check("adult.example").await.unwrap();
        assert_eq!(result.reason, Reason::FilteredParental);
        assert_eq!(result.rule.as_deref(), Some("parental CATEGORY_BLACKLISTED"));
    }

    #[tokio::test]
    async fn test_cache_idempotence() {
        let upstream = MockUpstream::new(&["malware.example.org"]);
        let checker = checker(ReputationService::SafeBrowsing, upstream.clone());

        assert!(checker.check("malware.example.org").await.unwrap().is_filtered);
        assert!(checker.check("malware.example.org").await.unwrap().is_filtered);
        assert_eq!(upstream.requests(), 1);

        let stats = checker.stats();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.pending_max, 1);
    }

    #[tokio::test]
    async fn test_concurrent_lookups_tracked() {
        let inner = MockUpstream::new(&["malware.example.org"]);
        let upstream = Arc::new(GatedUpstream {
            inner: inner.clone(),
            gate: tokio::sync::Barrier::new(2),
        });
        let checker = ReputationChecker::new(
            ReputationService::SafeBrowsing,
            upstream,
            CacheConfig::from_minutes(1024 * 1024, 30),
            Duration::from_secs(5),
            FilterMetrics::new(),
        );

        let hosts = ["malware.example.org", "benign.example.net"];
        let prefixes: Vec<Prefix> = hosts
            .iter()
            .map(|h| hostname_hashes(h)[0].prefix())
            .collect();
        assert_ne!(prefixes[0], prefixes[1]);

        let (listed, clean) = tokio::join!(checker.check(hosts[0]), checker.check(hosts[1]));
        assert!(listed.unwrap().is_filtered);
        assert!(!clean.unwrap().is_filtered);

        let stats = checker.stats();
        assert_eq!(inner.requests(), 2);
        assert_eq!(stats.requests, 2);
        assert!(stats.pending_max >= 2);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_negative_caching() {
        let upstream = MockUpstream::new(&["malware.example.org"]);
        let checker = checker(ReputationService::SafeBrowsing, upstream.clone());

        for _ in 0..3 {
            assert!(!checker.check("benign.example.net").await.unwrap().is_filtered);
        }
        assert_eq!(upstream.requests(), 1);
    }

    #[tokio::test]
    async fn test_failure_not_cached() {
        let upstream = MockUpstream::new(&["malware.example.org"]);
        let checker = checker(ReputationService::SafeBrowsing, upstream.clone());

        upstream.set_failing(true);
        assert!(checker.check("malware.example.org").await.is_err());

        upstream.set_failing(false);
        assert!(checker.check("malware.example.org").await.unwrap().is_filtered);
        assert_eq!(upstream.requests(), 2);
        assert_eq!(checker.stats().pending, 0);
    }

    #[tokio::test]
    async fn test_reputation_server_not_checked() {
        let upstream = MockUpstream::new(&["reputation.example"]);
        let checker = checker(ReputationService::SafeBrowsing, upstream.clone());

        let result = checker.check("reputation.example").await.unwrap();
        assert!(!result.matched());
        assert_eq!(upstream.requests(), 0);
    }

    #[tokio::test]
    async fn test_expired_bucket_refreshed() {
        let upstream = MockUpstream::new(&[]);
        let checker = ReputationChecker::new(
            ReputationService::SafeBrowsing,
            upstream.clone(),
            CacheConfig {
                max_bytes: 1024 * 1024,
                ttl: Duration::from_millis(20),
            },
            Duration::from_secs(1),
            FilterMetrics::new(),
        );

        checker.check("example.org").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        checker.check("example.org").await.unwrap();
        assert_eq!(upstream.requests(), 2);
    }

    #[test]
    fn test_received_hashes_skip_garbage() {
        let name = Name::from_str("abcd.sb.dns.adguard.com.").unwrap();
        let good = HEXLOWER.encode(&[7u8; 32]);
        let mut response = Message::new();
        response.add_answer(Record::from_rdata(
            name.clone(),
            60,
            RData::TXT(TXT::new(vec![
                good.clone(),
                "zz".repeat(32),
                "abcd".to_string(),
                good.to_uppercase(),
            ])),
        ));

        assert_eq!(received_hashes(&response), vec![[7u8; 32], [7u8; 32]]);
    }
}
