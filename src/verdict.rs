//! Decision types produced by the fallback engine.

use hickory_proto::op::ResponseCode;
use std::fmt;
use std::net::IpAddr;

/// Outcome of matching a query name against the domain rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DomainClass {
    /// Evaluate the primary answer as usual
    #[default]
    Normal,
    /// Skip the primary path and resolve through fallback servers
    Bypass,
}

/// Pre-resolution classification of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryClass {
    /// Matched the except list: return the primary answer unexamined
    Exempt,
    /// Matched a domain rule: go straight to fallback
    Bypass,
    /// Resolve normally, then inspect the answer
    Normal,
}

impl QueryClass {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryClass::Exempt => "EXEMPT",
            QueryClass::Bypass => "BYPASS",
            QueryClass::Normal => "NORMAL",
        }
    }
}

impl fmt::Display for QueryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why an answer was rejected in favour of fallback resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    /// Query name matched a configured domain rule
    DomainRule(String),
    /// No primary answer was available
    NoAnswer,
    /// Primary answer carried an error response code
    ErrorCode(ResponseCode),
    /// Primary answer had no answer records
    EmptyAnswer,
    /// An A record fell inside a configured CIDR range
    IpRange(IpAddr),
    /// An address resolved to a country outside the acceptable set
    Country { ip: IpAddr, country: String },
    /// An address could not be mapped to a country
    UnknownCountry(IpAddr),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::DomainRule(rule) => write!(f, "match domain rule {}", rule),
            FallbackReason::NoAnswer => write!(f, "no primary answer"),
            FallbackReason::ErrorCode(code) => write!(f, "primary answer rcode {}", code),
            FallbackReason::EmptyAnswer => write!(f, "empty primary answer"),
            FallbackReason::IpRange(ip) => write!(f, "match ip range ({})", ip),
            FallbackReason::Country { ip, country } => {
                write!(f, "country not acceptable ({}:{})", ip, country)
            }
            FallbackReason::UnknownCountry(ip) => write!(f, "country lookup failed ({})", ip),
        }
    }
}

/// The engine's per-request decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Trust the primary answer
    Accept,
    /// Re-resolve through the fallback servers
    Fallback(FallbackReason),
}

impl Verdict {
    /// Whether this verdict triggers fallback resolution.
    pub fn is_fallback(&self) -> bool {
        matches!(self, Verdict::Fallback(_))
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Accept => write!(f, "ACCEPT"),
            Verdict::Fallback(reason) => write!(f, "FALLBACK ({})", reason),
        }
    }
}
