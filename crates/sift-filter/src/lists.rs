//! Filter list sources and loaders.

use std::path::PathBuf;
#[cfg(feature = "http")]
use std::time::Duration;

use futures::future::BoxFuture;
use sift_config::FilterListConfig;
use tracing::{debug, info, warn};

use crate::{FilterError, Result};

/// Where a list's text comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListSource {
    /// Rules held in memory.
    Text(String),
    /// Rules read from a local file at rebuild time.
    File(PathBuf),
}

/// A filter list with the id reported for its matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterList {
    /// List id.
    pub id: i64,
    /// Rule source.
    pub source: ListSource,
}

impl FilterList {
    /// Creates a list from in-memory text.
    pub fn text(id: i64, text: impl Into<String>) -> Self {
        Self {
            id,
            source: ListSource::Text(text.into()),
        }
    }

    /// Creates a list backed by a file.
    pub fn file(id: i64, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            source: ListSource::File(path.into()),
        }
    }

    /// Returns the list's rule text.
    ///
    /// A missing file is an empty list.
    pub fn read(&self) -> Result<String> {
        match &self.source {
            ListSource::Text(text) => Ok(text.clone()),
            ListSource::File(path) => match std::fs::read_to_string(path) {
                Ok(text) => Ok(text),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "Filter list file not found, using empty list");
                    Ok(String::new())
                }
                Err(e) => Err(FilterError::Io(e)),
            },
        }
    }
}

/// Trait for loading list content from various sources.
pub trait ListLoader: Send + Sync {
    /// Loads the list content.
    fn load<'a>(&'a self, source: &'a str) -> BoxFuture<'a, Result<String>>;
}

/// Loads lists from HTTP/HTTPS URLs.
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct HttpLoader {
    client: reqwest::Client,
}

#[cfg(feature = "http")]
impl HttpLoader {
    /// Creates a new HTTP loader with default settings.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("sift-filter/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Creates a new HTTP loader with a custom client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Loads content from a URL.
    pub async fn load(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(FilterError::Network(format!(
                "HTTP {} for {}",
                response.status(),
                url
            )));
        }

        Ok(response.text().await?)
    }
}

#[cfg(feature = "http")]
impl ListLoader for HttpLoader {
    fn load<'a>(&'a self, source: &'a str) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move { self.load(source).await })
    }
}

/// Turns configured lists into rebuild inputs.
///
/// User rules become list 0. Disabled lists are skipped. Local paths stay file
/// backed; URLs are fetched through `remote` and held in memory, and a failed
/// download is dropped from this generation.
pub async fn resolve_lists(
    user_rules: &[String],
    configs: &[FilterListConfig],
    remote: &dyn ListLoader,
) -> Vec<FilterList> {
    let mut lists = Vec::with_capacity(configs.len() + 1);
    if !user_rules.is_empty() {
        lists.push(FilterList::text(0, user_rules.join("\n")));
    }

    for config in configs.iter().filter(|c| c.enabled) {
        if config.url.starts_with("http://") || config.url.starts_with("https://") {
            match remote.load(&config.url).await {
                Ok(text) => {
                    info!(id = config.id, url = %config.url, bytes = text.len(), "Downloaded filter list");
                    lists.push(FilterList::text(config.id, text));
                }
                Err(e) => {
                    warn!(id = config.id, url = %config.url, error = %e, "Filter list download failed");
                }
            }
        } else {
            lists.push(FilterList::file(config.id, &config.url));
        }
    }
    lists
}
