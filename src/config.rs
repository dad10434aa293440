//! Application configuration.
//!
//! Configuration is JSON with case-insensitive keys:
//!
//! ```json
//! {
//!   "debug": false,
//!   "domains": ["*.badcdn.com", "+.blocked.net", "exact.org"],
//!   "exceptDomains": ["+.intranet.lan"],
//!   "ipcidr": ["127.0.0.0/8", "0.0.0.0/32"],
//!   "geo": { "isEnabled": true, "subscribeUrl": "https://...", "countries": ["CN"] },
//!   "nameServers": [{ "ip": "8.8.8.8", "protocol": "Udp", "port": 0 }],
//!   "proxy": { "type": "Socks5", "address": "127.0.0.1", "port": 1080 }
//! }
//! ```

use reqwest::Url;
use serde::de::{DeserializeOwned, IntoDeserializer};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::rule::{CountrySet, DomainMatcher, DynamicRule, GeoPolicy, RangeTable};
use crate::upstream::{NameServer, Protocol, Proxy, ProxyType, Upstreams};

/// Raw configuration as written by the operator.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Promote per-request decision traces to info level
    #[serde(alias = "isdebug")]
    pub debug: bool,
    /// Domains that go straight to fallback: `name`, `*.name`, `+.name`
    pub domains: Vec<String>,
    /// Domains whose primary answer is never examined
    #[serde(rename = "exceptdomains")]
    pub except_domains: Vec<String>,
    /// Contaminated IPv4 blocks
    pub ipcidr: Vec<String>,
    /// GeoIP policy
    pub geo: Option<GeoConfig>,
    /// Fallback name servers
    #[serde(rename = "nameservers")]
    pub name_servers: Vec<NameServerConfig>,
    /// Optional forward proxy for the fallback client
    pub proxy: Option<ProxyConfig>,
}

/// GeoIP section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GeoConfig {
    #[serde(rename = "isenabled", alias = "enabled")]
    pub is_enabled: bool,
    #[serde(rename = "subscribeurl")]
    pub subscribe_url: Option<String>,
    pub countries: Vec<String>,
}

/// One fallback name server entry.
#[derive(Debug, Clone, Deserialize)]
pub struct NameServerConfig {
    pub ip: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "lowercase_enum")]
    pub protocol: Protocol,
    #[serde(default)]
    pub port: i64,
}

/// Forward proxy section.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    #[serde(rename = "type", default, deserialize_with = "lowercase_enum")]
    pub proxy_type: ProxyType,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// Deserialize a unit enum from a string in any case, ignoring `-` and `_`.
fn lowercase_enum<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let raw = String::deserialize(deserializer)?;
    let normalized: String = raw
        .chars()
        .filter(|c| *c != '-' && *c != '_')
        .map(|c| c.to_ascii_lowercase())
        .collect();
    T::deserialize(normalized.into_deserializer())
}

/// Lowercase every object key and drop explicit nulls so defaults apply.
fn normalize_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.to_ascii_lowercase(), normalize_keys(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_keys).collect()),
        other => other,
    }
}

/// Convert a configured port into `u16`.
fn port(value: i64, what: &str) -> Result<u16> {
    u16::try_from(value)
        .map_err(|_| Error::Config(format!("port out of range for {}: {}", what, value)))
}

impl AppConfig {
    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(json)?;
        if !value.is_object() {
            return Err(Error::Config("configuration must be a JSON object".to_string()));
        }
        Ok(serde_json::from_value(normalize_keys(value))?)
    }

    /// Load configuration from a file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Compile the runtime classifiers and upstream list.
    ///
    /// Bad entries are skipped with a warning; this never fails.
    pub fn compile(&self) -> EngineConfig {
        EngineConfig {
            debug: self.debug,
            domains: DomainMatcher::build(&self.domains),
            except_domains: DomainMatcher::build(&self.except_domains),
            ranges: RangeTable::build(&self.ipcidr),
            geo: self.compile_geo(),
            upstreams: self.compile_upstreams(),
        }
    }

    fn compile_geo(&self) -> GeoPolicy {
        let Some(geo) = &self.geo else {
            return GeoPolicy::default();
        };

        let subscribe_url = geo
            .subscribe_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .and_then(|u| match Url::parse(u) {
                Ok(_) => Some(u.to_string()),
                Err(e) => {
                    log::warn!("Ignoring geo subscribe url {:?}: {}", u, e);
                    None
                }
            });

        GeoPolicy {
            enabled: geo.is_enabled,
            countries: CountrySet::build(&geo.countries),
            subscribe_url,
        }
    }

    fn compile_upstreams(&self) -> Upstreams {
        let mut servers = Vec::with_capacity(self.name_servers.len());
        for entry in &self.name_servers {
            let result = port(entry.port, &entry.ip).and_then(|p| {
                NameServer::new(&entry.ip, entry.url.as_deref(), p, entry.protocol)
            });
            match result {
                Ok(ns) => servers.push(ns),
                Err(e) => log::warn!("Skipping name server {:?}: {}", entry.ip, e),
            }
        }

        if servers.is_empty() {
            if !self.name_servers.is_empty() {
                log::warn!("There is no available name server");
            }
            return Upstreams::default();
        }

        let proxy = self.proxy.as_ref().and_then(|p| {
            let result = port(p.port, &p.address).and_then(|port| {
                Proxy::new(
                    p.proxy_type,
                    &p.address,
                    port,
                    p.username.as_deref(),
                    p.password.as_deref(),
                )
            });
            match result {
                Ok(proxy) => Some(proxy),
                Err(e) => {
                    log::warn!("Proxy create failed: {}", e);
                    None
                }
            }
        });

        Upstreams { servers, proxy }
    }
}

/// Immutable runtime configuration of the decision engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub debug: bool,
    pub domains: DomainMatcher,
    pub except_domains: DomainMatcher,
    pub ranges: RangeTable,
    pub geo: GeoPolicy,
    pub upstreams: Upstreams,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_insensitive_keys() {
        let cfg = AppConfig::from_json(
            r#"{
                "Debug": true,
                "DOMAINS": ["*.badcdn.com"],
                "ExceptDomains": ["+.lan"],
                "IpCidr": ["10.0.0.0/8"],
                "Geo": {"IsEnabled": true, "SubscribeUrl": "https://example.com/geo.mmdb", "Countries": ["cn"]},
                "NameServers": [{"IP": "8.8.8.8", "Protocol": "Udp"}]
            }"#,
        )
        .unwrap();

        assert!(cfg.debug);
        assert_eq!(cfg.domains, vec!["*.badcdn.com"]);
        assert_eq!(cfg.except_domains, vec!["+.lan"]);
        assert_eq!(cfg.ipcidr, vec!["10.0.0.0/8"]);
        let geo = cfg.geo.as_ref().unwrap();
        assert!(geo.is_enabled);
        assert_eq!(geo.countries, vec!["cn"]);
        assert_eq!(cfg.name_servers[0].protocol, Protocol::Udp);
    }

    #[test]
    fn test_empty_object_is_passthrough() {
        let engine = AppConfig::from_json("{}").unwrap().compile();
        assert!(engine.upstreams.is_empty());
        assert!(engine.domains.is_empty());
        assert!(!engine.geo.is_active());
    }

    #[test]
    fn test_nulls_use_defaults() {
        let cfg = AppConfig::from_json(r#"{"domains": null, "geo": null, "proxy": null}"#).unwrap();
        assert!(cfg.domains.is_empty());
        assert!(cfg.geo.is_none());
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(AppConfig::from_json("{not json").is_err());
        assert!(AppConfig::from_json("[1, 2]").is_err());
        assert!(AppConfig::from_json(r#"{"domains": "not-a-list"}"#).is_err());
    }

    #[test]
    fn test_protocol_names() {
        let cfg = AppConfig::from_json(
            r#"{"nameServers": [
                {"ip": "1.1.1.1", "protocol": "TLS", "url": "cloudflare-dns.com"},
                {"ip": "1.1.1.1", "protocol": "HttpsJson", "url": "https://cloudflare-dns.com/dns-query"},
                {"ip": "1.1.1.1", "protocol": "https-json", "url": "https://cloudflare-dns.com/dns-query"},
                {"ip": "1.1.1.1"}
            ]}"#,
        )
        .unwrap();
        let protocols: Vec<_> = cfg.name_servers.iter().map(|n| n.protocol).collect();
        assert_eq!(
            protocols,
            vec![Protocol::Tls, Protocol::HttpsJson, Protocol::HttpsJson, Protocol::Udp]
        );
    }

    #[test]
    fn test_bad_entries_skipped() {
        let engine = AppConfig::from_json(
            r#"{
                "ipcidr": ["10.0.0.0/8", "10.0.0/8", "1.2.3.4/40"],
                "geo": {"isEnabled": true, "countries": ["CN", "CHN", "us"], "subscribeUrl": "::nope"},
                "nameServers": [
                    {"ip": "not-an-ip"},
                    {"ip": "8.8.8.8", "port": 70000},
                    {"ip": "1.1.1.1", "protocol": "Https"},
                    {"ip": "9.9.9.9", "port": 9953}
                ],
                "proxy": {"type": "Http", "address": "proxy.lan", "port": 8080, "username": "u"}
            }"#,
        )
        .unwrap()
        .compile();

        assert_eq!(engine.ranges.len(), 1);
        assert_eq!(engine.geo.countries.len(), 2);
        assert!(engine.geo.subscribe_url.is_none());
        assert_eq!(engine.upstreams.servers.len(), 1);
        assert_eq!(engine.upstreams.servers[0].addr, "9.9.9.9:9953".parse().unwrap());
        assert!(engine.upstreams.proxy.is_none());
    }

    #[test]
    fn test_all_name_servers_bad_means_no_upstreams() {
        let engine = AppConfig::from_json(
            r#"{"nameServers": [{"ip": "x"}], "proxy": {"type": "Socks5", "address": "127.0.0.1", "port": 1080}}"#,
        )
        .unwrap()
        .compile();
        assert!(engine.upstreams.is_empty());
        assert!(engine.upstreams.proxy.is_none());
    }

    #[test]
    fn test_proxy_compiled() {
        let engine = AppConfig::from_json(
            r#"{
                "nameServers": [{"ip": "8.8.8.8"}],
                "proxy": {"Type": "SOCKS5", "Address": "127.0.0.1", "Port": 1080, "Username": "u", "Password": "p"}
            }"#,
        )
        .unwrap()
        .compile();
        let proxy = engine.upstreams.proxy.unwrap();
        assert_eq!(proxy.proxy_type, ProxyType::Socks5);
        assert_eq!(proxy.port, 1080);
        assert!(proxy.credentials.is_some());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"domains": ["a.com"]}"#).unwrap();
        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.domains, vec!["a.com"]);
        assert!(AppConfig::load(dir.path().join("missing.json")).is_err());
    }
}
