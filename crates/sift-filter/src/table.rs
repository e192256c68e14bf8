//! Rules tables.
//!
//! A [`RulesTable`] indexes the rules of one precedence tier three ways:
//!
//! 1. Hosts rules by exact host, O(1)
//! 2. Rules with a full shortcut by that shortcut, probed with every
//!    six-byte window of the queried host
//! 3. Everything else in a leftover list, scanned linearly
//!
//! A [`RuleSet`] holds the important, whitelist and blacklist tiers of one
//! generation of filter lists. It is immutable once built.

use std::net::IpAddr;
use std::sync::Arc;

use compact_str::CompactString;
use hashbrown::{HashMap, HashSet};
use hickory_proto::rr::RecordType;
use tracing::{debug, trace, warn};

use crate::rule::{Rule, SHORTCUT_LEN};
use crate::{FilterError, FilterResult, Reason, Result};

/// Rules of one precedence tier.
#[derive(Debug, Default)]
pub struct RulesTable {
    hosts: HashMap<CompactString, Vec<Arc<Rule>>>,
    shortcuts: HashMap<CompactString, Vec<Arc<Rule>>>,
    leftovers: Vec<Arc<Rule>>,
    len: usize,
}

impl RulesTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a rule to the index it belongs to.
    pub fn add(&mut self, rule: Arc<Rule>) {
        self.len += 1;
        if let Some(host) = rule.host() {
            self.hosts
                .entry(CompactString::from(host))
                .or_default()
                .push(rule);
        } else if rule.shortcut().len() == SHORTCUT_LEN {
            self.shortcuts
                .entry(CompactString::from(rule.shortcut()))
                .or_default()
                .push(rule);
        } else {
            self.leftovers.push(rule);
        }
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the table holds no rules.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of rules in the leftover list.
    pub fn leftover_count(&self) -> usize {
        self.leftovers.len()
    }

    /// Finds the first rule matching the host.
    ///
    /// Hosts rules also report the address they answer for `qtype`.
    pub fn lookup(&self, host: &str, qtype: RecordType) -> Option<(&Arc<Rule>, Option<IpAddr>)> {
        self.first_match(host, qtype, |_| true)
    }

    fn first_match(
        &self,
        host: &str,
        qtype: RecordType,
        accept: impl Fn(&Rule) -> bool,
    ) -> Option<(&Arc<Rule>, Option<IpAddr>)> {
        if let Some(rules) = self.hosts.get(host) {
            for rule in rules.iter().filter(|r| accept(r)) {
                match rule.answer_for(qtype) {
                    Some(ip) => return Some((rule, Some(ip))),
                    None => trace!(host, rule = %rule.text(), ?qtype, "Hosts rule skipped for query type"),
                }
            }
        }

        if host.len() >= SHORTCUT_LEN && !self.shortcuts.is_empty() {
            for i in 0..=host.len() - SHORTCUT_LEN {
                let Some(window) = host.get(i..i + SHORTCUT_LEN) else {
                    continue;
                };
                if let Some(rules) = self.shortcuts.get(window) {
                    if let Some(rule) = rules.iter().find(|r| accept(r) && r.matches(host)) {
                        return Some((rule, None));
                    }
                }
            }
        }

        self.leftovers
            .iter()
            .find(|r| accept(r) && r.matches(host))
            .map(|rule| (rule, None))
    }
}

/// Counts from loading filter list text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadSummary {
    /// Rules added.
    pub added: usize,
    /// Lines rejected as invalid.
    pub invalid: usize,
    /// Lines already present.
    pub duplicates: usize,
}

/// The three precedence tiers of one rule generation.
#[derive(Debug, Default)]
pub struct RuleSet {
    important: RulesTable,
    whitelist: RulesTable,
    blacklist: RulesTable,
    seen: HashSet<String>,
}

impl RuleSet {
    /// Creates an empty rule set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles a single line and routes its rules to a tier.
    ///
    /// Returns the number of rules added.
    pub fn add_line(&mut self, line: &str, list_id: i64) -> Result<usize> {
        let rules = Rule::parse_line(line, list_id)?;

        let text = line.trim();
        if self.seen.contains(text) {
            return Err(FilterError::AlreadyExists(text.to_string()));
        }
        self.seen.insert(text.to_string());

        let count = rules.len();
        for rule in rules {
            let rule = Arc::new(rule);
            if rule.is_important() {
                self.important.add(rule);
            } else if rule.is_whitelist() {
                self.whitelist.add(rule);
            } else {
                self.blacklist.add(rule);
            }
        }
        Ok(count)
    }

    /// Adds every rule of a filter list's text.
    ///
    /// Malformed lines are logged and skipped, duplicates are skipped silently.
    pub fn add_text(&mut self, text: &str, list_id: i64) -> LoadSummary {
        let mut summary = LoadSummary::default();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('!') || trimmed.starts_with('#') {
                continue;
            }
            match self.add_line(trimmed, list_id) {
                Ok(n) => summary.added += n,
                Err(FilterError::AlreadyExists(_)) => summary.duplicates += 1,
                Err(e) => {
                    warn!(list_id, error = %e, "Skipping rule");
                    summary.invalid += 1;
                }
            }
        }
        debug!(
            list_id,
            added = summary.added,
            invalid = summary.invalid,
            duplicates = summary.duplicates,
            "Filter list parsed"
        );
        summary
    }

    /// Total number of rules.
    pub fn len(&self) -> usize {
        self.important.len() + self.whitelist.len() + self.blacklist.len()
    }

    /// Returns true if no rules are loaded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Important tier.
    pub fn important(&self) -> &RulesTable {
        &self.important
    }

    /// Whitelist tier.
    pub fn whitelist(&self) -> &RulesTable {
        &self.whitelist
    }

    /// Blacklist tier.
    pub fn blacklist(&self) -> &RulesTable {
        &self.blacklist
    }

    /// Matches a normalized host against the tiers in precedence order.
    ///
    /// Within the important tier an important exception wins over an important
    /// block.
    pub fn check(&self, host: &str, qtype: RecordType) -> FilterResult {
        let hit = self
            .important
            .first_match(host, qtype, Rule::is_whitelist)
            .or_else(|| self.important.lookup(host, qtype))
            .or_else(|| self.whitelist.lookup(host, qtype))
            .or_else(|| self.blacklist.lookup(host, qtype));

        match hit {
            Some((rule, ip)) => result_for(rule, ip),
            None => FilterResult::not_found(),
        }
    }
}

fn result_for(rule: &Rule, ip: Option<IpAddr>) -> FilterResult {
    let reason = if rule.is_whitelist() {
        Reason::NotFilteredWhiteList
    } else {
        Reason::FilteredBlackList
    };
    let mut result = FilterResult::with_reason(reason).rule(rule.text());
    result.ip = ip;
    result.filter_id = Some(rule.list_id());
    result
}
