//! DNS rewrites.
//!
//! A rewrite maps an exact domain, or a `*.`-prefixed wildcard, to an answer:
//!
//! - an IPv4 or IPv6 literal (IPv4-mapped IPv6 counts as IPv4)
//! - a canonical name, followed through the same table
//! - `A` or `AAAA`, which suppress the rewrite for that query type
//!
//! An entry answering with its own domain is an exception: the host is
//! resolved normally.

use std::cmp::Reverse;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use compact_str::CompactString;
use hashbrown::HashSet;
use hickory_proto::rr::RecordType;
use sift_config::RewriteEntry;
use tracing::{debug, info};

use crate::{FilterResult, Reason};

/// Prepared answer of a rewrite entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteTarget {
    /// Canonical name.
    Cname(CompactString),
    /// IPv4 answer, or an exception for `A` queries when `None`.
    A(Option<Ipv4Addr>),
    /// IPv6 answer, or an exception for `AAAA` queries when `None`.
    Aaaa(Option<Ipv6Addr>),
}

impl RewriteTarget {
    /// Classifies a configured answer.
    pub fn parse(answer: &str) -> Self {
        match answer {
            "A" => return Self::A(None),
            "AAAA" => return Self::Aaaa(None),
            _ => {}
        }

        match answer.parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => Self::A(Some(v4)),
            Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
                Some(v4) => Self::A(Some(v4)),
                None => Self::Aaaa(Some(v6)),
            },
            Err(_) => Self::Cname(CompactString::from(answer.to_ascii_lowercase())),
        }
    }

    fn is_cname(&self) -> bool {
        matches!(self, Self::Cname(_))
    }

    /// Whether the entry takes part in answering `qtype`.
    fn applies_to(&self, qtype: RecordType) -> bool {
        match self {
            Self::Cname(_) => true,
            Self::A(_) => qtype == RecordType::A,
            Self::Aaaa(_) => qtype == RecordType::AAAA,
        }
    }
}

#[derive(Debug, Clone)]
struct PreparedRewrite {
    domain: CompactString,
    target: RewriteTarget,
}

impl PreparedRewrite {
    fn is_wildcard(&self) -> bool {
        is_wildcard(&self.domain)
    }

    fn matches(&self, host: &str) -> bool {
        self.domain == host
            || (self.is_wildcard() && host.ends_with(&self.domain[1..]))
    }
}

fn is_wildcard(domain: &str) -> bool {
    domain.starts_with("*.")
}

/// Rewrite entries prepared for lookup, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct RewriteTable {
    entries: Vec<PreparedRewrite>,
}

impl RewriteTable {
    /// Prepares configured entries.
    pub fn new(entries: &[RewriteEntry]) -> Self {
        let entries = entries
            .iter()
            .map(|e| PreparedRewrite {
                domain: CompactString::from(e.domain.to_ascii_lowercase()),
                target: RewriteTarget::parse(&e.answer),
            })
            .collect();
        Self { entries }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries applying to `host` and `qtype`, most relevant first.
    ///
    /// Addresses of the other family are dropped before ranking. CNAMEs sort before addresses, exact domains before wildcards and longer
    /// wildcards before shorter ones; ties keep declaration order. An exact
    /// match discards every wildcard, a wildcard match keeps only the winner.
    fn find(&self, host: &str, qtype: RecordType) -> Vec<&PreparedRewrite> {
        let mut matched: Vec<&PreparedRewrite> = self
            .entries
            .iter()
            .filter(|e| e.target.applies_to(qtype) && e.matches(host))
            .collect();
        if matched.is_empty() {
            return matched;
        }

        matched.sort_by_key(|e| {
            let wildcard = e.is_wildcard();
            let depth = if wildcard { e.domain.len() } else { 0 };
            (!e.target.is_cname(), wildcard, Reverse(depth))
        });

        if matched[0].is_wildcard() {
            matched.truncate(1);
        } else if let Some(first_wildcard) = matched.iter().position(|e| e.is_wildcard()) {
            matched.truncate(first_wildcard);
        }
        matched
    }

    /// Resolves `host` for `qtype` through the table.
    pub fn resolve(&self, host: &str, qtype: RecordType) -> FilterResult {
        let mut candidates = self.find(host, qtype);
        if candidates.is_empty() {
            return FilterResult::not_found();
        }

        let mut result = FilterResult::with_reason(Reason::Rewrite);
        let mut visited: HashSet<CompactString> = HashSet::new();
        let mut current = CompactString::from(host);

        while let Some(RewriteTarget::Cname(cname)) =
            candidates.first().copied().map(|e| &e.target)
        {
            debug!(host = %current, cname = %cname, "Rewrite CNAME");

            if *cname == current {
                return FilterResult::not_found();
            }

            current = cname.clone();
            if !visited.insert(current.clone()) {
                info!(host, cname = %current, "Breaking rewrite CNAME loop");
                return result;
            }

            result.canon_name = Some(current.to_string());
            candidates = self.find(&current, qtype);
        }

        for entry in candidates {
            let answer = match (&entry.target, qtype) {
                (RewriteTarget::A(ip), RecordType::A) => ip.map(IpAddr::V4),
                (RewriteTarget::Aaaa(ip), RecordType::AAAA) => ip.map(IpAddr::V6),
                _ => continue,
            };
            match answer {
                Some(ip) => {
                    debug!(host = %current, %ip, "Rewrite address");
                    result.ip_list.push(ip);
                }
                None => return FilterResult::not_found(),
            }
        }

        if result.ip_list.is_empty() && result.canon_name.is_none() {
            return FilterResult::not_found();
        }
        result
    }
}
