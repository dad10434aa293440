//! Classifier types and trait definitions.

mod cidr;
mod domain;
pub mod geoip;

pub use cidr::{CidrRange, RangeTable};
pub use domain::{DomainMatcher, DomainPattern};
pub use geoip::{
    CountryDatabase, CountryLookup, CountrySet, GeoClassifier, GeoDatabase, GeoPolicy,
};

/// Trait for classifiers that are compiled from configuration patterns.
///
/// The pattern format depends on the classifier:
/// - Domain: `example.com` (exact), `*.example.com` (wildcard) or `+.example.com` (subtree)
/// - CIDR: `192.168.0.0/16` (IPv4 only)
/// - Country: `CN`, `US`, etc.
pub trait DynamicRule: Default {
    /// Error type for pattern addition
    type Error: std::fmt::Display;

    /// Human readable name used in log messages.
    const KIND: &'static str;

    /// Add a pattern to this classifier.
    fn add_pattern(&mut self, pattern: &str) -> Result<(), Self::Error>;

    /// Build a classifier from a list of patterns.
    ///
    /// Malformed patterns are skipped with a warning; they never abort the build.
    fn build<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rule = Self::default();
        for pattern in patterns {
            let pattern = pattern.as_ref();
            if let Err(e) = rule.add_pattern(pattern) {
                log::warn!("Skipping {} entry {:?}: {}", Self::KIND, pattern, e);
            }
        }
        rule
    }
}
