//! Upstream DNS transports for reputation lookups.
//!
//! - [`UdpUpstream`]: plain DNS over UDP, retried over TCP when truncated
//! - [`DohUpstream`]: DNS-over-HTTPS (RFC 8484 POST), behind the `http` feature

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::trace;

use crate::{FilterError, Result};

/// A DNS server that answers one query at a time.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Sends a query and returns the matching response.
    async fn exchange(&self, request: &Message) -> Result<Message>;

    /// Human-readable address.
    fn address(&self) -> &str;

    /// Server hostname, when it is addressed by name.
    fn host(&self) -> Option<&str> {
        None
    }
}

/// Plain DNS over UDP with TCP fallback.
#[derive(Debug, Clone)]
pub struct UdpUpstream {
    address: String,
    host: Option<String>,
    timeout: Duration,
}

impl UdpUpstream {
    /// Creates an upstream for `host:port` (or a bare IP, port 53).
    pub fn new(address: &str, timeout: Duration) -> Self {
        let address = match address.parse::<IpAddr>() {
            Ok(ip) => SocketAddr::new(ip, 53).to_string(),
            Err(_) if !address.contains(':') => format!("{address}:53"),
            Err(_) => address.to_string(),
        };
        let host = address
            .rsplit_once(':')
            .map(|(host, _)| host.trim_start_matches('[').trim_end_matches(']'))
            .filter(|host| host.parse::<IpAddr>().is_err())
            .map(str::to_string);
        Self {
            address,
            host,
            timeout,
        }
    }

    async fn query_udp(&self, query: &Message) -> Result<Message> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&self.address).await?;

        let wire = query.to_vec()?;
        socket.send(&wire).await?;

        let mut buf = vec![0u8; 65535];
        let len = timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| FilterError::Timeout)??;

        let response = Message::from_vec(&buf[..len])?;

        if response.id() != query.id() {
            return Err(FilterError::Protocol("Response ID mismatch".into()));
        }

        if response.truncated() {
            trace!(upstream = %self.address, "Response truncated, retrying with TCP");
            return self.query_tcp(query).await;
        }

        Ok(response)
    }

    async fn query_tcp(&self, query: &Message) -> Result<Message> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let mut stream = timeout(self.timeout, tokio::net::TcpStream::connect(&self.address))
            .await
            .map_err(|_| FilterError::Timeout)??;

        let wire = query.to_vec()?;
        let len = u16::try_from(wire.len())
            .map_err(|_| FilterError::Protocol("Query too large for TCP".into()))?;

        // Write length-prefixed message
        stream.write_all(&len.to_be_bytes()).await?;
        stream.write_all(&wire).await?;

        let mut len_buf = [0u8; 2];
        timeout(self.timeout, stream.read_exact(&mut len_buf))
            .await
            .map_err(|_| FilterError::Timeout)??;

        let resp_len = u16::from_be_bytes(len_buf) as usize;
        let mut resp_buf = vec![0u8; resp_len];
        timeout(self.timeout, stream.read_exact(&mut resp_buf))
            .await
            .map_err(|_| FilterError::Timeout)??;

        let response = Message::from_vec(&resp_buf)?;

        if response.id() != query.id() {
            return Err(FilterError::Protocol("Response ID mismatch".into()));
        }

        Ok(response)
    }
}

#[async_trait]
impl Upstream for UdpUpstream {
    async fn exchange(&self, request: &Message) -> Result<Message> {
        self.query_udp(request).await
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }
}

/// DNS-over-HTTPS upstream.
#[cfg(feature = "http")]
#[derive(Debug, Clone)]
pub struct DohUpstream {
    url: String,
    host: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
}

#[cfg(feature = "http")]
impl DohUpstream {
    /// Creates an upstream for an `https://` URL.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| FilterError::Protocol(format!("Invalid upstream URL {url}: {e}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sift-filter/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            url: url.to_string(),
            host: parsed.host_str().map(str::to_string),
            client,
            timeout,
        })
    }
}

#[cfg(feature = "http")]
#[async_trait]
impl Upstream for DohUpstream {
    async fn exchange(&self, request: &Message) -> Result<Message> {
        use reqwest::header::{ACCEPT, CONTENT_TYPE};

        const DNS_MESSAGE: &str = "application/dns-message";

        let body = request.to_vec()?;
        let send = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .header(ACCEPT, DNS_MESSAGE)
            .body(body)
            .send();

        let response = timeout(self.timeout, send)
            .await
            .map_err(|_| FilterError::Timeout)??;

        if !response.status().is_success() {
            return Err(FilterError::Network(format!(
                "HTTP {} from {}",
                response.status(),
                self.url
            )));
        }

        let bytes = response.bytes().await?;
        Ok(Message::from_vec(&bytes)?)
    }

    fn address(&self) -> &str {
        &self.url
    }

    fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }
}

/// Builds an upstream from its configured address.
///
/// `https://` selects DNS-over-HTTPS; `udp://host:port` or a bare
/// `host[:port]` selects plain DNS.
pub fn upstream_from_url(url: &str, timeout: Duration) -> Result<Arc<dyn Upstream>> {
    if url.starts_with("https://") {
        #[cfg(feature = "http")]
        {
            return Ok(Arc::new(DohUpstream::new(url, timeout)?));
        }
        #[cfg(not(feature = "http"))]
        {
            return Err(FilterError::Protocol(format!(
                "DNS-over-HTTPS upstream {url} needs the 'http' feature"
            )));
        }
    }

    let address = url.strip_prefix("udp://").unwrap_or(url);
    if address.is_empty() || address.contains("://") {
        return Err(FilterError::Protocol(format!("Unsupported upstream: {url}")));
    }
    Ok(Arc::new(UdpUpstream::new(address, timeout)))
}
