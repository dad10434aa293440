//! GeoIP database subscription with periodic refresh and hot swap.
//!
//! The refresher alternates between fetching and waiting:
//! - a successful fetch is validated, persisted to `geo.mmdb` and published,
//!   then the next attempt is scheduled for the following local midnight;
//! - any failure leaves the current database in service and retries in 10 minutes.

use chrono::{DateTime, Local, TimeZone};
use flate2::read::GzDecoder;
use reqwest::header::{ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::metadata::UpdateMetadata;
use crate::rule::{GeoClassifier, GeoDatabase};

/// Database file read at startup and replaced after each refresh.
pub const DB_FILE: &str = "geo.mmdb";

/// Staging file written before the atomic rename onto [`DB_FILE`].
pub const DB_NEW_FILE: &str = "geo_new.mmdb";

/// Refresh metadata (ETag, digest, last update).
pub const META_FILE: &str = "geo.mmdb.meta";

/// Delay before retrying after a failed refresh.
pub const RETRY_DELAY: Duration = Duration::from_secs(10 * 60);

/// Upper bound for a single download.
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const ONE_DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Turns downloaded bytes into an opened database.
pub type DatabaseOpener = fn(Vec<u8>) -> Result<GeoDatabase>;

/// Result of one successful refresh cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new database was persisted and published
    Published { bytes: usize },
    /// The server answered 304 Not Modified
    NotModified,
    /// The download was identical to the current database
    Unchanged,
}

impl fmt::Display for RefreshOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshOutcome::Published { bytes } => write!(f, "published {} bytes", bytes),
            RefreshOutcome::NotModified => write!(f, "not modified"),
            RefreshOutcome::Unchanged => write!(f, "unchanged"),
        }
    }
}

/// How long to wait before the next refresh attempt.
///
/// After a success this is the time until the next local midnight of `now`'s
/// time zone; after a failure it is always [`RETRY_DELAY`].
pub fn next_refresh_delay<Tz: TimeZone>(success: bool, now: DateTime<Tz>) -> Duration {
    if !success {
        return RETRY_DELAY;
    }

    let next_midnight = now
        .date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .and_then(|m| now.timezone().from_local_datetime(&m).earliest());

    match next_midnight {
        Some(next) => (next - now).to_std().unwrap_or(ONE_DAY),
        // Midnight skipped by a DST transition
        None => ONE_DAY,
    }
}

/// Load `geo.mmdb` from the application folder into the classifier.
///
/// Returns `true` if a database was published.
pub fn load_cached_database(folder: &Path, classifier: &GeoClassifier) -> bool {
    let path = folder.join(DB_FILE);
    if !path.exists() {
        log::debug!("No cached GeoIP database at {:?}", path);
        return false;
    }
    match GeoDatabase::open(&path) {
        Ok(db) => {
            classifier.publish(db);
            log::info!("Loaded GeoIP database from {:?}", path);
            true
        }
        Err(e) => {
            log::warn!("{:?} is a bad GeoIP database: {}", path, e);
            false
        }
    }
}

/// Check if data is gzip compressed.
fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
}

/// Inflate gzip payloads, pass anything else through.
fn decompress(raw: Vec<u8>) -> Result<Vec<u8>> {
    if !is_gzip(&raw) {
        return Ok(raw);
    }
    let mut decoder = GzDecoder::new(&raw[..]);
    let mut data = Vec::new();
    decoder
        .read_to_end(&mut data)
        .map_err(|e| Error::GeoIp(format!("gzip decompression failed: {}", e)))?;
    Ok(data)
}

/// Background task that keeps the GeoIP database current.
pub struct GeoRefresher {
    url: String,
    folder: PathBuf,
    classifier: Arc<GeoClassifier>,
    /// `None` if the HTTP client could not be built; every refresh then fails
    client: Option<reqwest::Client>,
    opener: DatabaseOpener,
}

impl GeoRefresher {
    /// Create a refresher for `url`, persisting into `folder`.
    pub fn new(url: &str, folder: impl AsRef<Path>, classifier: Arc<GeoClassifier>) -> Self {
        let client = match reqwest::Client::builder().timeout(DOWNLOAD_TIMEOUT).build() {
            Ok(client) => Some(client),
            Err(e) => {
                log::error!("Failed to create GeoIP download client: {}", e);
                None
            }
        };
        Self {
            url: url.to_string(),
            folder: folder.as_ref().to_path_buf(),
            classifier,
            client,
            opener: GeoDatabase::from_bytes,
        }
    }

    /// Replace the function used to validate and open downloads.
    pub fn with_opener(mut self, opener: DatabaseOpener) -> Self {
        self.opener = opener;
        self
    }

    /// Get the URL being used.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Get the path to the GeoIP database file.
    pub fn db_path(&self) -> PathBuf {
        self.folder.join(DB_FILE)
    }

    /// Get the path of the staging file.
    pub fn new_db_path(&self) -> PathBuf {
        self.folder.join(DB_NEW_FILE)
    }

    /// Get the path to the metadata file.
    pub fn metadata_path(&self) -> PathBuf {
        self.folder.join(META_FILE)
    }

    /// Run one fetch cycle.
    ///
    /// The classifier is only touched once the download has been fully read and
    /// successfully opened; on error the current database stays in service.
    pub async fn refresh_once(&self) -> Result<RefreshOutcome> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::GeoIp("no HTTP client available".to_string()))?;
        let meta = self.load_metadata().await;
        let loaded = self.classifier.is_loaded();

        let mut request = client.get(&self.url);
        if let (true, Some(etag)) = (loaded, meta.etag.as_deref()) {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_MODIFIED && loaded {
            return Ok(RefreshOutcome::NotModified);
        }
        if !status.is_success() {
            return Err(Error::HttpStatus(status.as_u16()));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let raw = response.bytes().await?.to_vec();
        let raw_len = raw.len();
        let data = decompress(raw)?;

        if loaded && meta.same_content(&data) {
            self.save_metadata(UpdateMetadata::published(&data, etag)).await?;
            return Ok(RefreshOutcome::Unchanged);
        }

        let db = (self.opener)(data.clone())?;
        log::debug!(
            "Opened downloaded GeoIP database: {} bytes ({} on the wire)",
            data.len(),
            raw_len
        );

        match self.persist(&data).await {
            Ok(()) => {
                if let Err(e) = self.save_metadata(UpdateMetadata::published(&data, etag)).await {
                    log::warn!("Failed to save GeoIP metadata: {}", e);
                }
            }
            Err(e) => log::warn!("Failed to persist GeoIP database: {}", e),
        }

        self.classifier.publish(db);
        Ok(RefreshOutcome::Published { bytes: data.len() })
    }

    async fn load_metadata(&self) -> UpdateMetadata {
        let path = self.metadata_path();
        let loaded = tokio::task::spawn_blocking(move || UpdateMetadata::load(path))
            .await
            .map_err(|e| Error::GeoIp(format!("metadata task failed: {}", e)))
            .and_then(|r| r);
        loaded.unwrap_or_else(|e| {
            log::warn!("Ignoring unreadable GeoIP metadata: {}", e);
            UpdateMetadata::default()
        })
    }

    async fn save_metadata(&self, meta: UpdateMetadata) -> Result<()> {
        let path = self.metadata_path();
        tokio::task::spawn_blocking(move || meta.save(path))
            .await
            .map_err(|e| Error::GeoIp(format!("metadata task failed: {}", e)))?
    }

    /// Write to the staging file, fsync, then rename over `geo.mmdb`.
    async fn persist(&self, data: &[u8]) -> Result<()> {
        tokio::fs::create_dir_all(&self.folder).await?;

        let staging = self.new_db_path();
        let mut file = tokio::fs::File::create(&staging).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&staging, self.db_path()).await?;
        Ok(())
    }

    /// Spawn the refresh loop on the current tokio runtime.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Fetch, wait, repeat until `shutdown` becomes `true` or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        log::info!("GeoIP refresher started for {}", self.url);

        while !*shutdown.borrow() {
            log::info!("Starting download geo database");
            let success = match self.refresh_once().await {
                Ok(outcome) => {
                    log::info!("Geo database refresh succeeded: {}", outcome);
                    true
                }
                Err(e) => {
                    log::warn!("Download geo database failed: {}", e);
                    false
                }
            };

            let delay = next_refresh_delay(success, Local::now());
            log::debug!("Next geo database refresh in {}s", delay.as_secs());
            if !wait_or_shutdown(delay, &mut shutdown).await {
                break;
            }
        }

        log::info!("GeoIP refresher stopped");
    }
}

/// Sleep for `delay`. Returns `false` if shutdown was requested first.
async fn wait_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return true,
            changed = shutdown.changed() => {
                let stop = changed.is_err() || *shutdown.borrow();
                if stop {
                    return false;
                }
            }
        }
    }
}
