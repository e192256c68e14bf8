//! Filtering configuration.

use super::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Default reputation upstream for both safe browsing and parental control.
pub const DEFAULT_REPUTATION_UPSTREAM: &str = "https://dns-family.adguard.com/dns-query";

/// Default parental sensitivity ("TEEN").
pub const DEFAULT_PARENTAL_SENSITIVITY: u8 = 13;

/// Accepted parental sensitivity values.
pub const PARENTAL_SENSITIVITIES: [u8; 4] = [3, 10, 13, 17];

/// Filtering configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilteringConfig {
    /// Enable rule-based filtering.
    pub enabled: bool,

    /// Enable parental control.
    pub parental_enabled: bool,

    /// Parental sensitivity (3, 10, 13 or 17).
    pub parental_sensitivity: u8,

    /// Enforce safe search.
    pub safesearch_enabled: bool,

    /// Enable safe browsing.
    pub safebrowsing_enabled: bool,

    /// Safe browsing cache size (bytes).
    pub safebrowsing_cache_size: u64,

    /// Safe search cache size (bytes).
    pub safesearch_cache_size: u64,

    /// Parental cache size (bytes).
    pub parental_cache_size: u64,

    /// Cache entry TTL (minutes).
    pub cache_time: u64,

    /// DNS rewrites.
    pub rewrites: Vec<RewriteEntry>,

    /// Names of blocked services.
    pub blocked_services: Vec<String>,

    /// Filter lists.
    pub filters: Vec<FilterListConfig>,

    /// User rules (list id 0).
    pub user_rules: Vec<String>,

    /// Safe browsing upstream.
    pub safebrowsing_upstream: String,

    /// Parental control upstream.
    pub parental_upstream: String,

    /// Reputation upstream timeout (seconds).
    pub upstream_timeout_secs: u64,
}

impl Default for FilteringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            parental_enabled: false,
            parental_sensitivity: DEFAULT_PARENTAL_SENSITIVITY,
            safesearch_enabled: false,
            safebrowsing_enabled: false,
            safebrowsing_cache_size: 1024 * 1024,
            safesearch_cache_size: 1024 * 1024,
            parental_cache_size: 1024 * 1024,
            cache_time: 30,
            rewrites: Vec::new(),
            blocked_services: Vec::new(),
            filters: Vec::new(),
            user_rules: Vec::new(),
            safebrowsing_upstream: DEFAULT_REPUTATION_UPSTREAM.to_string(),
            parental_upstream: DEFAULT_REPUTATION_UPSTREAM.to_string(),
            upstream_timeout_secs: 3,
        }
    }
}

impl FilteringConfig {
    pub fn validate(&self) -> Result<()> {
        if !PARENTAL_SENSITIVITIES.contains(&self.parental_sensitivity) {
            return Err(ConfigError::InvalidValue {
                field: "filtering.parental_sensitivity".to_string(),
                message: format!(
                    "must be one of 3, 10, 13 or 17, got {}",
                    self.parental_sensitivity
                ),
            });
        }

        for (field, size) in [
            ("filtering.safebrowsing_cache_size", self.safebrowsing_cache_size),
            ("filtering.safesearch_cache_size", self.safesearch_cache_size),
            ("filtering.parental_cache_size", self.parental_cache_size),
        ] {
            if size == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: "cache size must be greater than zero".to_string(),
                });
            }
        }

        for (field, upstream) in [
            ("filtering.safebrowsing_upstream", &self.safebrowsing_upstream),
            ("filtering.parental_upstream", &self.parental_upstream),
        ] {
            validate_upstream(field, upstream)?;
        }

        if self.upstream_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "filtering.upstream_timeout_secs must be greater than zero".to_string(),
            ));
        }

        for rewrite in &self.rewrites {
            rewrite.validate()?;
        }

        for list in &self.filters {
            list.validate()?;
        }

        Ok(())
    }

    /// Returns the reputation upstream timeout.
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}

/// Upstreams are either URLs (`https://`, `udp://`) or bare `host:port` pairs.
fn validate_upstream(field: &str, upstream: &str) -> Result<()> {
    if upstream.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: "upstream cannot be empty".to_string(),
        });
    }
    if upstream.contains("://") && upstream.parse::<Url>().is_err() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            message: format!("Invalid URL: {upstream}"),
        });
    }
    Ok(())
}

/// A DNS rewrite entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteEntry {
    /// Domain name or `*.`-prefixed wildcard.
    pub domain: String,

    /// IP address, canonical name, or an `A`/`AAAA` exception marker.
    pub answer: String,
}

impl RewriteEntry {
    pub fn new(domain: impl Into<String>, answer: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            answer: answer.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.domain.is_empty() {
            return Err(ConfigError::Validation(
                "Rewrite domain cannot be empty".to_string(),
            ));
        }
        if self.answer.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Rewrite answer for {} cannot be empty",
                self.domain
            )));
        }
        Ok(())
    }
}

/// Filter list entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterListConfig {
    /// List id, reported with every match. Id 0 is reserved for user rules.
    pub id: i64,

    /// Human-readable name.
    #[serde(default)]
    pub name: String,

    /// Source URL or file path.
    pub url: String,

    /// Enable this list.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl FilterListConfig {
    pub fn validate(&self) -> Result<()> {
        if self.id == 0 {
            return Err(ConfigError::InvalidValue {
                field: "filtering.filters.id".to_string(),
                message: format!("id 0 is reserved for user rules ({})", self.url),
            });
        }
        if self.url.is_empty() {
            return Err(ConfigError::Validation(
                "Filter list URL cannot be empty".to_string(),
            ));
        }
        if (self.url.starts_with("http://") || self.url.starts_with("https://"))
            && self.url.parse::<Url>().is_err()
        {
            return Err(ConfigError::InvalidValue {
                field: "filtering.filters.url".to_string(),
                message: format!("Invalid URL: {}", self.url),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_filtering_is_valid() {
        assert!(FilteringConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_sensitivity() {
        let config = FilteringConfig {
            parental_sensitivity: 12,
            ..FilteringConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_cache_size() {
        let config = FilteringConfig {
            parental_cache_size: 0,
            ..FilteringConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_upstream_forms() {
        assert!(validate_upstream("f", "udp://94.140.14.15:53").is_ok());
        assert!(validate_upstream("f", "94.140.14.15:53").is_ok());
        assert!(validate_upstream("f", "https://").is_err());
        assert!(validate_upstream("f", "").is_err());
    }

    #[test]
    fn test_filter_list_reserved_id() {
        let list = FilterListConfig {
            id: 0,
            name: "user".to_string(),
            url: "/tmp/list.txt".to_string(),
            enabled: true,
        };
        assert!(list.validate().is_err());
    }

    #[test]
    fn test_rewrite_validation() {
        assert!(RewriteEntry::new("example.org", "1.2.3.4").validate().is_ok());
        assert!(RewriteEntry::new("", "1.2.3.4").validate().is_err());
        assert!(RewriteEntry::new("example.org", "").validate().is_err());
    }
}
