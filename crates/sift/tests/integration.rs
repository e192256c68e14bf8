//! End-to-end tests for the Sift filtering engine.
//!
//! These tests wire the engine the way the daemon does:
//! - Filter lists from files and remote sources
//! - Reputation lookups against a mock upstream
//! - Control API changes persisted to the configuration file
//! - Background list rebuilds

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use data_encoding::HEXLOWER;
use futures::future::BoxFuture;
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::rdata::TXT;
use hickory_proto::rr::{RData, Record, RecordType};
use http_body_util::BodyExt;
use sha2::{Digest, Sha256};
use tower::ServiceExt;

use sift_config::{Config, ConfigHolder, FilterListConfig, FilteringConfig, RewriteEntry};
use sift_filter::{
    DnsFilter, FilterError, FilterList, HostResolver, ListLoader, Reason, Upstream,
};
use sift_server::ControlServer;

// ============================================================================
// Test Helpers
// ============================================================================

/// Answers every TXT question with the hashes of `listed`.
struct HashListUpstream {
    listed: Vec<String>,
    requests: AtomicUsize,
}

impl HashListUpstream {
    fn new(names: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            listed: names
                .iter()
                .map(|name| HEXLOWER.encode(&Sha256::digest(name.as_bytes())))
                .collect(),
            requests: AtomicUsize::new(0),
        })
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Upstream for HashListUpstream {
    async fn exchange(&self, request: &Message) -> sift_filter::Result<Message> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let question = request.queries()[0].clone();

        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response);
        if !self.listed.is_empty() {
            response.add_answer(Record::from_rdata(
                question.name().clone(),
                60,
                RData::TXT(TXT::new(self.listed.clone())),
            ));
        }
        Ok(response)
    }

    fn address(&self) -> &str {
        "hash-list"
    }
}

struct NoResolver;

#[async_trait]
impl HostResolver for NoResolver {
    async fn lookup_ipv4(&self, host: &str) -> sift_filter::Result<Vec<std::net::Ipv4Addr>> {
        Err(FilterError::Network(format!("no resolver for {host}")))
    }
}

/// Serves remote lists from memory.
struct MemoryLoader {
    lists: Vec<(&'static str, &'static str)>,
}

impl ListLoader for MemoryLoader {
    fn load<'a>(&'a self, source: &'a str) -> BoxFuture<'a, sift_filter::Result<String>> {
        Box::pin(async move {
            self.lists
                .iter()
                .find(|(url, _)| *url == source)
                .map(|(_, text)| text.to_string())
                .ok_or_else(|| FilterError::Network(format!("HTTP 404 for {source}")))
        })
    }
}

const ADS_LIST: &str = "\
! Title: Example ads
! Expires: 4 days
||doubleclick.net^
||ads.example.com^
@@||good.ads.example.com^
/^track(er)?[0-9]*\\./
*.banner.example.org^
";

fn remote_loader() -> MemoryLoader {
    MemoryLoader {
        lists: vec![("https://lists.example.net/ads.txt", ADS_LIST)],
    }
}

fn build_filter(
    config: FilteringConfig,
    safebrowsing: Arc<HashListUpstream>,
    parental: Arc<HashListUpstream>,
) -> Arc<DnsFilter> {
    Arc::new(
        DnsFilter::builder(config)
            .safebrowsing_upstream(safebrowsing)
            .parental_upstream(parental)
            .resolver(Arc::new(NoResolver))
            .build()
            .unwrap(),
    )
}

async fn check(filter: &DnsFilter, host: &str) -> sift_filter::FilterResult {
    filter.check_host(host, RecordType::A, &filter.settings()).await
}

async fn send(router: &Router, method: &str, uri: &str, body: &str) -> (StatusCode, String) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

/// Polls until `done` holds or the deadline passes.
async fn wait_for(mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Filter Lists
// ============================================================================

#[tokio::test]
async fn test_configured_lists_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let hosts_path = dir.path().join("hosts.txt");
    std::fs::write(
        &hosts_path,
        "# local overrides\n0.0.0.0 telemetry.example.net\n192.168.1.5 printer.lan\n",
    )
    .unwrap();

    let config = FilteringConfig {
        user_rules: vec![
            "@@||doubleclick.net^$important".to_string(),
            "||user.block.example^".to_string(),
        ],
        filters: vec![
            FilterListConfig {
                id: 1,
                name: "ads".to_string(),
                url: "https://lists.example.net/ads.txt".to_string(),
                enabled: true,
            },
            FilterListConfig {
                id: 2,
                name: "hosts".to_string(),
                url: hosts_path.display().to_string(),
                enabled: true,
            },
            FilterListConfig {
                id: 3,
                name: "broken".to_string(),
                url: "https://lists.example.net/missing.txt".to_string(),
                enabled: true,
            },
        ],
        ..FilteringConfig::default()
    };

    let filter = build_filter(config, HashListUpstream::new(&[]), HashListUpstream::new(&[]));
    filter
        .load_configured_lists(&remote_loader(), false)
        .await
        .unwrap();

    let blocked = check(&filter, "ADS.example.com.").await;
    assert!(blocked.is_filtered);
    assert_eq!(blocked.reason, Reason::FilteredBlackList);
    assert_eq!(blocked.filter_id, Some(1));
    assert_eq!(blocked.rule.as_deref(), Some("||ads.example.com^"));

    let allowed = check(&filter, "good.ads.example.com").await;
    assert_eq!(allowed.reason, Reason::NotFilteredWhiteList);

    // The important user exception beats the list's block.
    let important = check(&filter, "stats.doubleclick.net").await;
    assert_eq!(important.reason, Reason::NotFilteredWhiteList);
    assert_eq!(important.filter_id, Some(0));

    assert!(check(&filter, "tracker42.example.io").await.is_filtered);
    assert!(check(&filter, "top.banner.example.org").await.is_filtered);
    assert!(check(&filter, "user.block.example").await.is_filtered);

    let printer = check(&filter, "printer.lan").await;
    assert_eq!(printer.filter_id, Some(2));
    assert_eq!(printer.ip, Some("192.168.1.5".parse::<IpAddr>().unwrap()));

    assert!(!check(&filter, "example.com").await.matched());
}

#[tokio::test]
async fn test_filtering_disabled_skips_rules() {
    let config = FilteringConfig {
        enabled: false,
        user_rules: vec!["||blocked.example^".to_string()],
        rewrites: vec![RewriteEntry::new("nas.lan", "192.168.1.10")],
        ..FilteringConfig::default()
    };
    let filter = build_filter(config, HashListUpstream::new(&[]), HashListUpstream::new(&[]));
    filter
        .load_configured_lists(&remote_loader(), false)
        .await
        .unwrap();

    assert!(!check(&filter, "blocked.example").await.matched());
    assert_eq!(check(&filter, "nas.lan").await.reason, Reason::Rewrite);
}

#[tokio::test]
async fn test_background_rebuild_keeps_serving() {
    let filter = build_filter(
        FilteringConfig::default(),
        HashListUpstream::new(&[]),
        HashListUpstream::new(&[]),
    );
    filter
        .set_filters(vec![FilterList::text(1, "||old.example^")], false)
        .await
        .unwrap();
    let before = filter.stats().rules_generation;

    filter
        .set_filters(vec![FilterList::text(2, "||new.example^")], true)
        .await
        .unwrap();

    let storage = filter.storage().clone();
    wait_for(|| storage.generation() > before).await;

    assert!(!check(&filter, "old.example").await.matched());
    assert_eq!(check(&filter, "new.example").await.filter_id, Some(2));
}

// ============================================================================
// Check Pipeline
// ============================================================================

#[tokio::test]
async fn test_pipeline_order() {
    let config = FilteringConfig {
        safebrowsing_enabled: true,
        parental_enabled: true,
        safesearch_enabled: true,
        blocked_services: vec!["reddit".to_string()],
        rewrites: vec![RewriteEntry::new("malware.example", "10.0.0.1")],
        user_rules: vec!["@@||clean.malware.example^".to_string()],
        ..FilteringConfig::default()
    };
    let safebrowsing = HashListUpstream::new(&["malware.example", "phish.example"]);
    let parental = HashListUpstream::new(&["adult.example"]);
    let filter = build_filter(config, safebrowsing.clone(), parental.clone());
    filter
        .load_configured_lists(&remote_loader(), false)
        .await
        .unwrap();

    // A rewrite answers before any lookup.
    let rewritten = check(&filter, "malware.example").await;
    assert_eq!(rewritten.reason, Reason::Rewrite);
    assert_eq!(safebrowsing.requests(), 0);

    // A whitelist match ends the pass.
    let allowed = check(&filter, "clean.malware.example").await;
    assert_eq!(allowed.reason, Reason::NotFilteredWhiteList);
    assert_eq!(safebrowsing.requests(), 0);

    let service = check(&filter, "www.reddit.com").await;
    assert_eq!(service.reason, Reason::FilteredBlockedService);
    assert_eq!(service.service_name.as_deref(), Some("reddit"));

    let safe_search = check(&filter, "www.yandex.ru").await;
    assert_eq!(safe_search.reason, Reason::FilteredSafeSearch);
    assert_eq!(safe_search.ip, Some("213.180.193.56".parse::<IpAddr>().unwrap()));

    // An unresolvable safe-search target fails open to the next stage.
    assert!(!check(&filter, "www.bing.com").await.is_filtered);

    let phishing = check(&filter, "login.phish.example").await;
    assert_eq!(phishing.reason, Reason::FilteredSafeBrowsing);
    assert_eq!(phishing.rule.as_deref(), Some("adguard-malware-shavar"));

    let adult = check(&filter, "adult.example").await;
    assert_eq!(adult.reason, Reason::FilteredParental);

    // A second lookup for the same host is served from the cache.
    let requests = safebrowsing.requests();
    assert_eq!(check(&filter, "login.phish.example").await.reason, Reason::FilteredSafeBrowsing);
    assert_eq!(safebrowsing.requests(), requests);
    assert!(filter.stats().safebrowsing.cache_hits >= 1);
}

// ============================================================================
// Control API
// ============================================================================

#[tokio::test]
async fn test_control_api_persists_changes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sift.yaml");
    Config::default().save(&path).unwrap();

    let holder = Arc::new(ConfigHolder::from_file(&path).unwrap());
    let filter = build_filter(
        holder.get().filtering.clone(),
        HashListUpstream::new(&[]),
        HashListUpstream::new(&[]),
    );
    let persist = holder.clone();
    filter.set_on_config_modified(Box::new(move |filtering| {
        persist.update_filtering(filtering.clone()).unwrap();
    }));

    let router = ControlServer::new(filter.clone()).router();

    let (code, _) = send(&router, "POST", "/control/parental/enable", "sensitivity=TEEN").await;
    assert_eq!(code, StatusCode::OK);
    let (code, _) = send(
        &router,
        "POST",
        "/control/blocked_services/set",
        r#"["youtube","tiktok"]"#,
    )
    .await;
    assert_eq!(code, StatusCode::OK);
    let (code, _) = send(
        &router,
        "POST",
        "/control/rewrite/add",
        r#"{"domain":"*.home.lan","answer":"192.168.0.2"}"#,
    )
    .await;
    assert_eq!(code, StatusCode::OK);

    let saved = Config::from_file(&path).unwrap().filtering;
    assert!(saved.parental_enabled);
    assert_eq!(saved.parental_sensitivity, 13);
    assert_eq!(saved.blocked_services, vec!["youtube", "tiktok"]);
    assert_eq!(saved.rewrites, vec![RewriteEntry::new("*.home.lan", "192.168.0.2")]);

    let (code, body) = send(
        &router,
        "GET",
        "/control/filtering/check_host?name=tv.home.lan",
        "",
    )
    .await;
    assert_eq!(code, StatusCode::OK);
    let verdict: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(verdict["reason"], "Rewrite");
    assert_eq!(verdict["ip_list"][0], "192.168.0.2");

    let (code, _) = send(
        &router,
        "POST",
        "/control/rewrite/delete",
        r#"{"domain":"*.home.lan","answer":"192.168.0.2"}"#,
    )
    .await;
    assert_eq!(code, StatusCode::OK);
    assert!(Config::from_file(&path).unwrap().filtering.rewrites.is_empty());
}

#[tokio::test]
async fn test_control_server_over_tcp() {
    let filter = build_filter(
        FilteringConfig::default(),
        HashListUpstream::new(&[]),
        HashListUpstream::new(&[]),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = ControlServer::new(filter.clone());
    let task = tokio::spawn(async move {
        server
            .serve(listener, async {
                let _ = stop_rx.await;
            })
            .await
    });

    let client = http_get(address, "/control/safesearch/status").await;
    assert!(client.starts_with("HTTP/1.1 200"), "{client}");
    assert!(client.contains(r#"{"enabled":false}"#), "{client}");

    stop_tx.send(()).unwrap();
    task.await.unwrap().unwrap();
}

/// Minimal HTTP/1.1 GET over a raw socket.
async fn http_get(address: std::net::SocketAddr, path: &str) -> String {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut stream = tokio::net::TcpStream::connect(address).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}
