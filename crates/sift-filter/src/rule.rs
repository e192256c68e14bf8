//! Rule model and compiler.
//!
//! A line of a filter list compiles into one or more [`Rule`]s:
//!
//! - **Hosts syntax**: `<ip> <host> [host...] [# comment]`, one exact rule per host
//! - **Adblock syntax**: `[@@]pattern[$options]`, where the pattern is either a
//!   domain-anchored suffix (`||example.org^`), a wildcard pattern, or a raw
//!   `/regex/`
//!
//! Regex matchers are compiled on first use, suffix matchers never need one.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use compact_str::CompactString;
use hickory_proto::rr::RecordType;
use once_cell::sync::OnceCell;
use regex::{Regex, RegexBuilder};
use tracing::warn;

use crate::{FilterError, Result};

/// Length of the literal used to index rules by substring.
pub const SHORTCUT_LEN: usize = 6;

/// Lines containing any of these are element-hiding rules, not network rules.
const COSMETIC_MASKS: [&str; 8] = ["##", "#@#", "#$#", "#@$#", "$$", "$@$", "#%#", "#@%#"];

/// Regex for the `^` separator: end of input or anything that cannot be part of a host.
const SEPARATOR_REGEX: &str = r"(?:[^a-z0-9_\-.%]|$)";

/// Syntax family a rule was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    /// Adblock-style network rule.
    Network,
    /// Hosts-file rule.
    Hosts,
}

/// A compiled filtering rule.
#[derive(Debug)]
pub struct Rule {
    text: String,
    pattern: String,
    list_id: i64,
    whitelist: bool,
    important: bool,
    apps: Vec<CompactString>,
    shortcut: CompactString,
    matcher: Matcher,
}

#[derive(Debug)]
enum Matcher {
    /// Exact host bound to an address.
    HostIp { host: CompactString, ip: IpAddr },
    /// `||literal^`: the host or any of its subdomains.
    Suffix(CompactString),
    /// Anything else, translated to a regex.
    Pattern(LazyRegex),
}

#[derive(Debug)]
struct LazyRegex {
    source: String,
    compiled: OnceCell<Option<Regex>>,
}

impl LazyRegex {
    fn new(source: String) -> Self {
        Self {
            source,
            compiled: OnceCell::new(),
        }
    }

    fn build(source: &str) -> std::result::Result<Regex, regex::Error> {
        RegexBuilder::new(source).case_insensitive(true).build()
    }

    /// Returns the compiled regex, or `None` if it failed to compile.
    fn get(&self) -> Option<&Regex> {
        self.compiled
            .get_or_init(|| match Self::build(&self.source) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %self.source, error = %e, "Rule regex does not compile, rule disabled");
                    None
                }
            })
            .as_ref()
    }
}

impl Rule {
    /// Compiles a filter list line.
    ///
    /// Hosts lines yield one rule per host; adblock lines yield exactly one.
    pub fn parse_line(line: &str, list_id: i64) -> Result<Vec<Rule>> {
        let line = line.trim();

        if line.len() < 4 {
            return Err(invalid(line, "rule is too short"));
        }
        if line.starts_with('!') || line.starts_with('#') {
            return Err(invalid(line, "comment"));
        }
        if line.starts_with("[Adblock") {
            return Err(invalid(line, "list header"));
        }
        if COSMETIC_MASKS.iter().any(|mask| line.contains(mask)) {
            return Err(invalid(line, "cosmetic rules are not supported"));
        }

        if let Some(rules) = Self::parse_hosts(line, list_id)? {
            return Ok(rules);
        }

        Self::parse_network(line, list_id).map(|rule| vec![rule])
    }

    /// Returns `Ok(None)` if the line is not in hosts syntax.
    fn parse_hosts(line: &str, list_id: i64) -> Result<Option<Vec<Rule>>> {
        let content = line.split_once('#').map_or(line, |(before, _)| before);
        let mut fields = content.split_whitespace();

        let Some(ip) = fields.next().and_then(|f| f.parse::<IpAddr>().ok()) else {
            return Ok(None);
        };

        let rules: Vec<Rule> = fields
            .map(|field| {
                let host = CompactString::from(crate::normalize_host(field));
                Rule {
                    text: line.to_string(),
                    pattern: host.to_string(),
                    list_id,
                    whitelist: false,
                    important: false,
                    apps: Vec::new(),
                    shortcut: CompactString::default(),
                    matcher: Matcher::HostIp { host, ip },
                }
            })
            .collect();

        if rules.is_empty() {
            return Err(invalid(line, "hosts line has no host names"));
        }
        Ok(Some(rules))
    }

    fn parse_network(line: &str, list_id: i64) -> Result<Rule> {
        let (whitelist, body) = match line.strip_prefix("@@") {
            Some(rest) => (true, rest),
            None => (false, line),
        };

        let (raw_pattern, options) = split_options(body);

        let mut important = false;
        let mut apps = Vec::new();
        if let Some(options) = options {
            for option in split_unescaped(options, ',') {
                let option = unescape(&option);
                if option == "important" {
                    important = true;
                } else if let Some(list) = option.strip_prefix("app=") {
                    apps.extend(
                        list.split('|')
                            .filter(|app| !app.is_empty())
                            .map(CompactString::from),
                    );
                } else {
                    return Err(invalid(line, &format!("unknown option '{option}'")));
                }
            }
        }

        let pattern = if is_regex_pattern(raw_pattern) {
            raw_pattern.to_string()
        } else {
            unescape(raw_pattern)
        };
        if pattern.is_empty() {
            return Err(invalid(line, "empty pattern"));
        }

        let matcher = match suffix_literal(&pattern) {
            Some(literal) => Matcher::Suffix(CompactString::from(literal.to_ascii_lowercase())),
            None => Matcher::Pattern(LazyRegex::new(pattern_to_regex(&pattern)?)),
        };

        Ok(Rule {
            text: line.to_string(),
            shortcut: shortcut(&pattern),
            pattern,
            list_id,
            whitelist,
            important,
            apps,
            matcher,
        })
    }

    /// Builds a rule around an already translated regex, reported under `text`.
    pub(crate) fn from_regex(text: &str, source: String, list_id: i64) -> Rule {
        Rule {
            text: text.to_string(),
            pattern: text.to_string(),
            list_id,
            whitelist: false,
            important: false,
            apps: Vec::new(),
            shortcut: CompactString::default(),
            matcher: Matcher::Pattern(LazyRegex::new(source)),
        }
    }

    /// Original rule text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Pattern with decorators and options stripped.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Id of the filter list the rule came from.
    pub fn list_id(&self) -> i64 {
        self.list_id
    }

    /// True for `@@` exception rules.
    pub fn is_whitelist(&self) -> bool {
        self.whitelist
    }

    /// True for `$important` rules.
    pub fn is_important(&self) -> bool {
        self.important
    }

    /// Applications listed in `$app=`.
    pub fn apps(&self) -> &[CompactString] {
        &self.apps
    }

    /// Index literal, empty when the rule has none.
    pub fn shortcut(&self) -> &str {
        &self.shortcut
    }

    /// Syntax family.
    pub fn kind(&self) -> RuleKind {
        match self.matcher {
            Matcher::HostIp { .. } => RuleKind::Hosts,
            _ => RuleKind::Network,
        }
    }

    /// True when matching is a suffix comparison.
    pub fn is_suffix(&self) -> bool {
        matches!(self.matcher, Matcher::Suffix(_))
    }

    /// Exact host of a hosts rule.
    pub fn host(&self) -> Option<&str> {
        match &self.matcher {
            Matcher::HostIp { host, .. } => Some(host),
            _ => None,
        }
    }

    /// Address of a hosts rule.
    pub fn ip(&self) -> Option<IpAddr> {
        match self.matcher {
            Matcher::HostIp { ip, .. } => Some(ip),
            _ => None,
        }
    }

    /// Tests a normalized host against the rule.
    pub fn matches(&self, host: &str) -> bool {
        match &self.matcher {
            Matcher::HostIp { host: h, .. } => h == host,
            Matcher::Suffix(suffix) => {
                host == suffix.as_str()
                    || (host.len() > suffix.len()
                        && host.ends_with(suffix.as_str())
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
            }
            Matcher::Pattern(re) => re.get().is_some_and(|re| re.is_match(host)),
        }
    }

    /// Address a hosts rule answers for the query type.
    ///
    /// `A` needs an IPv4 address. `AAAA` needs an IPv6 address, except that a
    /// `0.0.0.0` rule answers `::`. Anything else gets no answer.
    pub fn answer_for(&self, qtype: RecordType) -> Option<IpAddr> {
        let ip = self.ip()?;
        match (qtype, ip) {
            (RecordType::A, IpAddr::V4(_)) | (RecordType::AAAA, IpAddr::V6(_)) => Some(ip),
            (RecordType::AAAA, IpAddr::V4(v4)) if v4 == Ipv4Addr::UNSPECIFIED => {
                Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED))
            }
            _ => None,
        }
    }

    /// Compiles the matcher now and reports a broken regex.
    pub fn compile(&self) -> Result<()> {
        if let Matcher::Pattern(re) = &self.matcher {
            LazyRegex::build(&re.source).map_err(|source| FilterError::InvalidRegex {
                pattern: re.source.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

fn invalid(rule: &str, message: &str) -> FilterError {
    FilterError::InvalidSyntax {
        rule: rule.to_string(),
        message: message.to_string(),
    }
}

fn is_regex_pattern(pattern: &str) -> bool {
    pattern.len() > 1 && pattern.starts_with('/') && pattern.ends_with('/')
}

/// Splits `pattern$options` at the last unescaped `$`.
///
/// A `$` inside a `/regex/` is part of the regex.
fn split_options(body: &str) -> (&str, Option<&str>) {
    let bytes = body.as_bytes();
    let Some(pos) = (0..bytes.len())
        .rev()
        .find(|&i| bytes[i] == b'$' && (i == 0 || bytes[i - 1] != b'\\'))
    else {
        return (body, None);
    };

    if body.starts_with('/') {
        if let Some(last_slash) = body.rfind('/') {
            if last_slash > 0 && pos < last_slash {
                return (body, None);
            }
        }
    }

    (&body[..pos], Some(&body[pos + 1..]))
}

/// Splits on `delim` unless it is escaped with a backslash. Escapes are kept.
fn split_unescaped(s: &str, delim: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in s.chars() {
        if escaped {
            current.push('\\');
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == delim {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    if escaped {
        current.push('\\');
    }
    parts.push(current);
    parts
}

/// Resolves `\$` and `\,` to their literal characters.
fn unescape(s: &str) -> String {
    s.replace("\\$", "$").replace("\\,", ",")
}

/// Returns the literal of a `||literal^` or `||literal|` pattern.
fn suffix_literal(pattern: &str) -> Option<&str> {
    let rest = pattern.strip_prefix("||")?;
    let literal = rest.strip_suffix('^').or_else(|| rest.strip_suffix('|'))?;
    let plain = !literal.is_empty()
        && literal
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'));
    plain.then_some(literal)
}

/// Extracts the index literal: the first longest token between `*`, `^` and `|`,
/// lowercased and cut to [`SHORTCUT_LEN`] bytes. Shorter tokens give no shortcut.
fn shortcut(pattern: &str) -> CompactString {
    if is_regex_pattern(pattern) {
        return CompactString::default();
    }

    let longest = pattern
        .split(['*', '^', '|'])
        .fold("", |best, token| if token.len() > best.len() { token } else { best });

    if longest.len() >= SHORTCUT_LEN && longest.is_char_boundary(SHORTCUT_LEN) {
        CompactString::from(longest[..SHORTCUT_LEN].to_lowercase())
    } else {
        CompactString::default()
    }
}

/// Translates a rule pattern into regex source.
///
/// | Pattern        | Regex                         |
/// |----------------|-------------------------------|
/// | `/re/`         | `re`                          |
/// | leading `\|\|` | `(?:^\|\.)`                   |
/// | leading `\|`   | `^`                           |
/// | trailing `\|`  | `$`                           |
/// | `*`            | `.*`                          |
/// | `^`            | separator or end of input     |
/// | inner `\|`     | literal pipe                  |
pub fn pattern_to_regex(pattern: &str) -> Result<String> {
    if pattern.starts_with('/') && pattern.ends_with('/') {
        if pattern.len() > 2 {
            return Ok(pattern[1..pattern.len() - 1].to_string());
        }
        return Err(invalid(pattern, "empty regex"));
    }

    let mut out = String::with_capacity(pattern.len() * 2);
    let mut rest = pattern;
    if let Some(r) = rest.strip_prefix("||") {
        out.push_str(r"(?:^|\.)");
        rest = r;
    } else if let Some(r) = rest.strip_prefix('|') {
        out.push('^');
        rest = r;
    }

    let (body, anchored_end) = match rest.strip_suffix('|') {
        Some(body) => (body, true),
        None => (rest, false),
    };

    let mut literal = String::new();
    for c in body.chars() {
        let special = match c {
            '*' => ".*",
            '^' => SEPARATOR_REGEX,
            '|' => r"\|",
            _ => {
                literal.push(c);
                continue;
            }
        };
        out.push_str(&regex::escape(&literal));
        literal.clear();
        out.push_str(special);
    }
    out.push_str(&regex::escape(&literal));

    if anchored_end {
        out.push('$');
    }
    Ok(out)
}
