//! GeoIP country classification.
//!
//! The classifier holds the current [`GeoDatabase`] behind an [`ArcSwapOption`].
//! Readers take a snapshot without locking; the refresher builds a complete
//! replacement off to the side and publishes it with a single atomic store.

use ahash::AHashSet;
use arc_swap::ArcSwapOption;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use super::DynamicRule;
use crate::error::{Error, GeoIpRuleError, Result};

/// A source of IP to country mappings.
pub trait CountryDatabase: Send + Sync {
    /// Return the ISO 3166 alpha-2 country code for `ip`, if known.
    fn country(&self, ip: IpAddr) -> Option<String>;
}

impl<S> CountryDatabase for maxminddb::Reader<S>
where
    S: AsRef<[u8]> + Send + Sync,
{
    fn country(&self, ip: IpAddr) -> Option<String> {
        #[derive(serde::Deserialize)]
        struct Country {
            iso_code: Option<String>,
        }

        #[derive(serde::Deserialize)]
        struct GeoIpResponse {
            country: Option<Country>,
        }

        let result: GeoIpResponse = self.lookup(ip).ok()?;
        result.country?.iso_code
    }
}

/// An immutable, fully opened country database.
pub struct GeoDatabase {
    inner: Box<dyn CountryDatabase>,
    source: String,
}

impl GeoDatabase {
    /// Wrap any country database.
    pub fn new(db: impl CountryDatabase + 'static, source: impl Into<String>) -> Self {
        Self {
            inner: Box::new(db),
            source: source.into(),
        }
    }

    /// Open a MaxMind database held in memory.
    ///
    /// Fails if the bytes are not a valid MaxMind DB.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let reader =
            maxminddb::Reader::from_source(data).map_err(|e| Error::GeoIp(e.to_string()))?;
        let source = format!("{} (memory)", reader.metadata.database_type);
        Ok(Self::new(reader, source))
    }

    /// Open a MaxMind database file, memory-mapped.
    pub fn open(path: &Path) -> Result<Self> {
        let reader = maxminddb::Reader::open_mmap(path).map_err(|e| Error::GeoIp(e.to_string()))?;
        let source = format!("{} ({})", reader.metadata.database_type, path.display());
        Ok(Self::new(reader, source))
    }

    /// Where this database came from, for logging.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Look up the country code for an IP address.
    pub fn lookup_country(&self, ip: IpAddr) -> CountryLookup {
        match self.inner.country(ip) {
            Some(code) => CountryLookup::Found(code.to_ascii_uppercase()),
            None => CountryLookup::NotFound,
        }
    }
}

impl fmt::Debug for GeoDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeoDatabase")
            .field("source", &self.source)
            .finish()
    }
}

/// Outcome of a country lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountryLookup {
    /// Uppercase ISO country code
    Found(String),
    /// No database, no entry, or a lookup error
    NotFound,
}

impl fmt::Display for CountryLookup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CountryLookup::Found(code) => write!(f, "{}", code),
            CountryLookup::NotFound => write!(f, "unknown"),
        }
    }
}

/// Swappable handle to the current GeoIP database.
#[derive(Debug, Default)]
pub struct GeoClassifier {
    current: ArcSwapOption<GeoDatabase>,
}

impl GeoClassifier {
    /// Create a classifier with no database loaded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a classifier with an initial database.
    pub fn with_database(db: GeoDatabase) -> Self {
        Self {
            current: ArcSwapOption::from_pointee(db),
        }
    }

    /// Whether a database is currently published.
    pub fn is_loaded(&self) -> bool {
        self.current.load().is_some()
    }

    /// Take a snapshot of whichever database is current.
    pub fn snapshot(&self) -> Option<Arc<GeoDatabase>> {
        self.current.load_full()
    }

    /// Atomically replace the current database, returning the previous one.
    pub fn publish(&self, db: GeoDatabase) -> Option<Arc<GeoDatabase>> {
        log::info!("Publishing GeoIP database: {}", db.source());
        self.current.swap(Some(Arc::new(db)))
    }

    /// Look up the country code for an IP address against the current database.
    pub fn lookup_country(&self, ip: IpAddr) -> CountryLookup {
        match self.current.load().as_ref() {
            Some(db) => db.lookup_country(ip),
            None => CountryLookup::NotFound,
        }
    }
}

/// Set of 2-letter ISO country codes (uppercase).
#[derive(Debug, Clone, Default)]
pub struct CountrySet {
    countries: AHashSet<String>,
}

impl CountrySet {
    /// Get the number of country codes in this set.
    pub fn len(&self) -> usize {
        self.countries.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.countries.is_empty()
    }

    /// Check if a country code is in this set.
    pub fn contains(&self, country: &str) -> bool {
        self.countries.contains(&country.to_ascii_uppercase())
    }
}

impl DynamicRule for CountrySet {
    type Error = GeoIpRuleError;
    const KIND: &'static str = "country";

    fn add_pattern(&mut self, pattern: &str) -> std::result::Result<(), Self::Error> {
        let code = pattern.trim().to_ascii_uppercase();

        if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(GeoIpRuleError::InvalidCountryCode(code));
        }

        self.countries.insert(code);
        Ok(())
    }
}

/// Which countries are acceptable for answer addresses.
#[derive(Debug, Clone, Default)]
pub struct GeoPolicy {
    /// Whether geo classification participates in decisions
    pub enabled: bool,
    /// Acceptable countries
    pub countries: CountrySet,
    /// Optional subscription URL for periodic database refresh
    pub subscribe_url: Option<String>,
}

impl GeoPolicy {
    /// Geo checks only run when enabled with at least one acceptable country.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.countries.is_empty()
    }

    /// Whether a lookup result is acceptable. Unknown is never acceptable.
    pub fn accepts(&self, lookup: &CountryLookup) -> bool {
        match lookup {
            CountryLookup::Found(code) => self.countries.contains(code),
            CountryLookup::NotFound => false,
        }
    }
}
