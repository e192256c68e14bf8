//! # Sift DNS Filtering Engine
//!
//! Decides, for a queried hostname, whether it should be answered normally,
//! blocked, rewritten, or redirected to an enforced safe-search address.
//!
//! ## Features
//!
//! - **Adblock-style and hosts-file rules**: `||example.org^`, `@@` exceptions,
//!   `$important`, raw `/regex/` rules and `0.0.0.0 example.org` lines
//! - **Three rule tiers**: important, whitelist and blacklist, each indexed by
//!   exact host and by a six-byte substring shortcut
//! - **DNS rewrites**: exact and `*.` wildcard domains answered with IPs or CNAMEs
//! - **Blocked services**: a built-in catalog of per-service rule sets
//! - **Reputation lookups**: privacy-preserving hash-prefix queries for safe
//!   browsing and parental control, cached by prefix
//! - **Safe search**: search engines redirected to their enforced endpoints
//! - **Hot-reload**: rule sets rebuilt in the background and swapped atomically
//!
//! ## Example
//!
//! ```rust,ignore
//! use sift_filter::{DnsFilter, FilterList, Reason};
//! use hickory_proto::rr::RecordType;
//!
//! let filter = DnsFilter::new(Default::default())?;
//! filter
//!     .set_filters(vec![FilterList::text(1, "||example.org^")], false)
//!     .await?;
//!
//! let settings = filter.settings();
//! let result = filter.check_host("www.example.org", RecordType::A, &settings).await;
//! assert_eq!(result.reason, Reason::FilteredBlackList);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;
use thiserror::Error;

pub mod engine;
pub mod lists;
pub mod reputation;
pub mod rewrite;
pub mod rule;
pub mod safesearch;
pub mod services;
pub mod storage;
pub mod table;
pub mod upstream;

pub use engine::{
    ClientPolicy, ConfigModifiedHook, DnsFilter, DnsFilterBuilder, FilterStats, FilteringSettings,
    NoClientPolicy,
};
pub use lists::{FilterList, ListLoader, ListSource};
#[cfg(feature = "http")]
pub use lists::HttpLoader;
pub use reputation::{LookupStats, ReputationChecker, ReputationService};
pub use rewrite::{RewriteTable, RewriteTarget};
pub use rule::{Rule, RuleKind};
pub use safesearch::{safe_search_target, HostResolver, SafeSearch, SystemResolver};
pub use services::{ServiceCatalog, ServiceSet};
pub use storage::RuleStorage;
pub use table::{RuleSet, RulesTable};
pub use upstream::{upstream_from_url, UdpUpstream, Upstream};
#[cfg(feature = "http")]
pub use upstream::DohUpstream;

// ============================================================================
// Error Types
// ============================================================================

/// Errors that can occur during filtering operations.
#[derive(Error, Debug)]
pub enum FilterError {
    /// A rule line could not be parsed.
    #[error("Invalid rule syntax '{rule}': {message}")]
    InvalidSyntax {
        /// The offending line.
        rule: String,
        /// Error message.
        message: String,
    },

    /// The same rule text was already added to the rule set.
    #[error("Rule already exists: {0}")]
    AlreadyExists(String),

    /// A regex rule does not compile.
    #[error("Invalid regex pattern '{pattern}': {source}")]
    InvalidRegex {
        /// The invalid pattern.
        pattern: String,
        /// The underlying regex error.
        #[source]
        source: regex::Error,
    },

    /// IO error while reading a filter list.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error while talking to an upstream or fetching a list.
    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Network error.
    #[error("Network error: {0}")]
    Network(String),

    /// Upstream did not answer in time.
    #[error("Timeout")]
    Timeout,

    /// Malformed or unexpected upstream response.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Safe-search target resolved to no IPv4 address.
    #[error("No IPv4 address for {0}")]
    NoIpv4(String),

    /// The background rebuild worker is gone.
    #[error("Rule rebuild worker stopped")]
    WorkerStopped,
}

/// Result type for filter operations.
pub type Result<T> = std::result::Result<T, FilterError>;

impl From<hickory_proto::error::ProtoError> for FilterError {
    fn from(e: hickory_proto::error::ProtoError) -> Self {
        Self::Protocol(e.to_string())
    }
}

// ============================================================================
// Verdicts
// ============================================================================

/// Why a host was or was not filtered.
///
/// The declaration order is stable and exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub enum Reason {
    /// No rule matched.
    #[default]
    NotFilteredNotFound,
    /// A whitelist rule matched.
    NotFilteredWhiteList,
    /// A check failed.
    NotFilteredError,
    /// A blacklist rule matched.
    FilteredBlackList,
    /// Listed by the safe browsing service.
    FilteredSafeBrowsing,
    /// Listed by the parental control service.
    FilteredParental,
    /// Invalid host.
    FilteredInvalid,
    /// Redirected to the enforced safe-search endpoint.
    FilteredSafeSearch,
    /// A blocked service rule matched.
    FilteredBlockedService,
    /// A DNS rewrite applied.
    Rewrite,
}

impl Reason {
    /// Returns the canonical name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFilteredNotFound => "NotFilteredNotFound",
            Self::NotFilteredWhiteList => "NotFilteredWhiteList",
            Self::NotFilteredError => "NotFilteredError",
            Self::FilteredBlackList => "FilteredBlackList",
            Self::FilteredSafeBrowsing => "FilteredSafeBrowsing",
            Self::FilteredParental => "FilteredParental",
            Self::FilteredInvalid => "FilteredInvalid",
            Self::FilteredSafeSearch => "FilteredSafeSearch",
            Self::FilteredBlockedService => "FilteredBlockedService",
            Self::Rewrite => "Rewrite",
        }
    }

    /// Returns true for every reason except "not found".
    pub const fn matched(self) -> bool {
        !matches!(self, Self::NotFilteredNotFound)
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a host check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FilterResult {
    /// True when the query should not be answered normally.
    pub is_filtered: bool,

    /// Verdict reason.
    pub reason: Reason,

    /// Text of the matching rule.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule: Option<String>,

    /// Answer address for hosts rules and safe search.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,

    /// Id of the list the matching rule came from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_id: Option<i64>,

    /// Final name after following rewrite CNAMEs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canon_name: Option<String>,

    /// Rewrite answers.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ip_list: Vec<IpAddr>,

    /// Name of the matching blocked service.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
}

impl FilterResult {
    /// The "nothing matched" result.
    pub fn not_found() -> Self {
        Self::default()
    }

    /// Creates a result with the given reason.
    ///
    /// `is_filtered` follows the reason: whitelist, error and rewrite verdicts
    /// do not filter.
    pub fn with_reason(reason: Reason) -> Self {
        let is_filtered = matches!(
            reason,
            Reason::FilteredBlackList
                | Reason::FilteredSafeBrowsing
                | Reason::FilteredParental
                | Reason::FilteredInvalid
                | Reason::FilteredSafeSearch
                | Reason::FilteredBlockedService
        );
        Self {
            is_filtered,
            reason,
            ..Self::default()
        }
    }

    /// Sets the rule text.
    #[must_use]
    pub fn rule(mut self, rule: impl Into<String>) -> Self {
        self.rule = Some(rule.into());
        self
    }

    /// Returns true if anything matched.
    pub fn matched(&self) -> bool {
        self.reason.matched()
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Normalizes a hostname for matching.
///
/// - Converts to lowercase
/// - Removes one trailing dot
pub fn normalize_host(host: &str) -> String {
    let host = host.strip_suffix('.').unwrap_or(host);
    host.to_ascii_lowercase()
}
