//! Error types for dns-fallback.

use thiserror::Error;

/// Error type for dns-fallback operations.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid IP address
    #[error("invalid IP address: {0}")]
    InvalidIpAddress(String),

    /// Name server entry that cannot be used
    #[error("invalid name server: {0}")]
    InvalidNameServer(String),

    /// Proxy entry that cannot be used
    #[error("invalid proxy: {0}")]
    InvalidProxy(String),

    /// GeoIP database error
    #[error("GeoIP error: {0}")]
    GeoIp(String),

    /// Download error
    #[error("download error: {0}")]
    Download(#[from] reqwest::Error),

    /// Non-success HTTP status from the subscription URL
    #[error("unexpected HTTP status: {0}")]
    HttpStatus(u16),

    /// Upstream resolution failure
    #[error("resolve error: {0}")]
    Resolve(String),
}

/// Result type alias for dns-fallback operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for domain rule operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DomainRuleError {
    /// Empty pattern
    #[error("empty domain pattern")]
    EmptyPattern,

    /// Wildcard prefix with nothing after it
    #[error("domain pattern has no suffix after wildcard: {0}")]
    MissingSuffix(String),
}

/// Error type for CIDR rule operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CidrRuleError {
    /// Invalid CIDR notation
    #[error("invalid IPv4 CIDR notation: {0}")]
    InvalidCidr(String),
}

/// Error type for GeoIP rule operations.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum GeoIpRuleError {
    /// Invalid country code (must be 2 characters)
    #[error("invalid country code (must be 2 characters): {0}")]
    InvalidCountryCode(String),
}
