//! Fallback upstream descriptions and host capability traits.
//!
//! The engine never speaks DNS on the wire itself. The host supplies:
//! - a [`Resolve`] for its own direct resolution path,
//! - a [`ResponseCache`] shared with the rest of the server,
//! - an [`UpstreamConnector`] that turns [`Upstreams`] into a fallback [`Resolve`].

use async_trait::async_trait;
use hickory_proto::op::Message;
use reqwest::Url;
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Transport protocol of a name server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Udp,
    Tcp,
    Tls,
    Https,
    #[serde(rename = "httpsjson")]
    HttpsJson,
    Quic,
}

impl Protocol {
    /// Port used when the configuration leaves it at `0`.
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Udp | Protocol::Tcp => 53,
            Protocol::Tls | Protocol::Quic => 853,
            Protocol::Https | Protocol::HttpsJson => 443,
        }
    }

    /// Whether the transport is DNS-over-HTTPS.
    pub fn is_https(self) -> bool {
        matches!(self, Protocol::Https | Protocol::HttpsJson)
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Udp => "udp",
            Protocol::Tcp => "tcp",
            Protocol::Tls => "tls",
            Protocol::Https => "https",
            Protocol::HttpsJson => "https-json",
            Protocol::Quic => "quic",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A fully validated fallback name server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameServer {
    /// Address to connect to
    pub addr: SocketAddr,
    /// TLS server name for Tls/Quic, absent for plain transports
    pub host: Option<String>,
    /// DoH endpoint, present only for Https/HttpsJson
    pub url: Option<Url>,
    /// Transport protocol
    pub protocol: Protocol,
}

impl NameServer {
    /// Validate a name server entry.
    ///
    /// `port == 0` selects the protocol default. HTTPS transports need an absolute
    /// `url`; for other transports `url` is taken as the TLS server name.
    pub fn new(ip: &str, url: Option<&str>, port: u16, protocol: Protocol) -> Result<Self> {
        let ip: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| Error::InvalidIpAddress(ip.to_string()))?;

        let url = url.map(str::trim).filter(|u| !u.is_empty());

        let (host, doh_url, default_port) = if protocol.is_https() {
            let raw = url.ok_or_else(|| {
                Error::InvalidNameServer(format!("{} requires a url ({})", protocol, ip))
            })?;
            let parsed = Url::parse(raw)
                .map_err(|e| Error::InvalidNameServer(format!("bad url {:?}: {}", raw, e)))?;
            let port = parsed.port_or_known_default().unwrap_or(protocol.default_port());
            (parsed.host_str().map(str::to_string), Some(parsed), port)
        } else {
            (url.map(str::to_string), None, protocol.default_port())
        };

        let port = if port == 0 { default_port } else { port };

        Ok(Self {
            addr: SocketAddr::new(ip, port),
            host,
            url: doh_url,
            protocol,
        })
    }
}

impl fmt::Display for NameServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.url, &self.host) {
            (Some(url), _) => write!(f, "{}://{} ({})", self.protocol, url, self.addr),
            (None, Some(host)) => write!(f, "{}://{} ({})", self.protocol, host, self.addr),
            (None, None) => write!(f, "{}://{}", self.protocol, self.addr),
        }
    }
}

/// Forward proxy type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    #[default]
    Http,
    Socks5,
}

/// Credentials for an authenticated proxy.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// A validated forward proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    pub proxy_type: ProxyType,
    pub address: String,
    pub port: u16,
    pub credentials: Option<ProxyCredentials>,
}

impl Proxy {
    /// Validate a proxy entry. A username without a password is rejected.
    pub fn new(
        proxy_type: ProxyType,
        address: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(Error::InvalidProxy("empty address".to_string()));
        }
        if port == 0 {
            return Err(Error::InvalidProxy(format!("missing port for {}", address)));
        }
        let credentials = match (username, password) {
            (None, None) => None,
            (Some(username), Some(password)) => Some(ProxyCredentials {
                username: username.to_string(),
                password: password.to_string(),
            }),
            (Some(_), None) => {
                return Err(Error::InvalidProxy("username without password".to_string()))
            }
            (None, Some(_)) => {
                return Err(Error::InvalidProxy("password without username".to_string()))
            }
        };
        Ok(Self {
            proxy_type,
            address: address.to_string(),
            port,
            credentials,
        })
    }
}

/// The fallback name servers, in configured order, and an optional proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Upstreams {
    pub servers: Vec<NameServer>,
    pub proxy: Option<Proxy>,
}

impl Upstreams {
    /// Whether there is at least one usable server.
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// Resolve a DNS request into a response.
#[async_trait]
pub trait Resolve: Send + Sync {
    async fn resolve(&self, request: &Message) -> Result<Message>;
}

/// The host's shared response cache.
pub trait ResponseCache: Send + Sync {
    /// Return a cached response for the request, if any.
    fn query(&self, request: &Message) -> Option<Message>;

    /// Store a response.
    fn cache_response(&self, response: &Message);
}

/// Builds a fallback resolver from the configured upstreams.
pub trait UpstreamConnector: Send + Sync {
    fn connect(&self, upstreams: &Upstreams) -> Result<Arc<dyn Resolve>>;
}

/// Cache that stores nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl ResponseCache for NoCache {
    fn query(&self, _request: &Message) -> Option<Message> {
        None
    }

    fn cache_response(&self, _response: &Message) {}
}

/// Everything the engine needs from its host.
#[derive(Clone)]
pub struct HostContext {
    /// Persistent per-application storage folder
    pub app_folder: PathBuf,
    /// The host's own resolution path
    pub direct: Arc<dyn Resolve>,
    /// Shared response cache
    pub cache: Arc<dyn ResponseCache>,
    /// Factory for the fallback client
    pub connector: Arc<dyn UpstreamConnector>,
}

impl fmt::Debug for HostContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostContext")
            .field("app_folder", &self.app_folder)
            .finish_non_exhaustive()
    }
}
