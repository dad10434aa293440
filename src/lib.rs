//! dns-fallback - A DNS contamination fallback engine.
//!
//! This crate sits between a DNS server and its upstreams. After a query has been
//! answered through the normal (direct) path, the engine decides whether that
//! answer can be trusted. Untrusted answers are re-resolved through a configured
//! set of fallback name servers, optionally behind a proxy.
//!
//! # Features
//!
//! - **Domain rules**: `*.` (one label) and `+.` (any depth) suffix patterns that
//!   skip the direct path entirely
//! - **Exempt domains**: names whose direct answers are never examined
//! - **IP-CIDR rules**: IPv4 ranges that mark an answer as contaminated
//! - **GeoIP policy**: answers whose addresses fall outside an allowed country set
//!   are re-resolved
//! - **Hot reload**: a subscribed GeoIP database is refreshed daily and swapped
//!   atomically without blocking lookups
//! - **Never fails**: a bad configuration degrades to passthrough, a failed
//!   fallback degrades to the direct answer
//!
//! # Quick Start
//!
//! ```ignore
//! use dns_fallback::{FallbackApp, HostContext};
//!
//! let app = FallbackApp::initialize(host, r#"{
//!     "domains": ["*.badcdn.com"],
//!     "ipcidr": ["198.18.0.0/15"],
//!     "geo": {"isEnabled": true, "countries": ["CN"]},
//!     "nameServers": [{"ip": "8.8.8.8", "protocol": "Udp"}]
//! }"#);
//!
//! let response = app.process_request(&request).await;
//!
//! app.stop().await;
//! ```
//!
//! # Decision Order
//!
//! 1. No fallback name servers: accept
//! 2. Exempt domain: accept
//! 3. Domain rule: fallback
//! 4. Missing answer, error response code or empty answer: fallback
//! 5. Any A/AAAA record in a configured range or outside the allowed
//!    countries: fallback
//! 6. Otherwise: accept

mod error;
mod metadata;

pub mod config;
pub mod engine;
pub mod geoip_manager;
pub mod rule;
pub mod upstream;
pub mod verdict;

// Re-export core types
pub use error::{CidrRuleError, DomainRuleError, Error, GeoIpRuleError, Result};
pub use verdict::{DomainClass, FallbackReason, QueryClass, Verdict};

// Re-export engine
pub use config::{AppConfig, EngineConfig};
pub use engine::{FallbackApp, FallbackEngine};

// Re-export host capabilities
pub use upstream::{
    HostContext, NameServer, NoCache, Protocol, Proxy, ProxyType, ResponseCache, Resolve,
    UpstreamConnector, Upstreams,
};

// Re-export rule types
pub use rule::{
    CidrRange, CountryLookup, CountrySet, DomainMatcher, DomainPattern, GeoClassifier,
    GeoDatabase, GeoPolicy, RangeTable,
};

// Re-export GeoIP refresh
pub use geoip_manager::{GeoRefresher, RefreshOutcome};
pub use metadata::UpdateMetadata;
