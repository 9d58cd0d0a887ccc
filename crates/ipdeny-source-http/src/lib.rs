// # HTTP Snapshot Source
//
// This crate provides the ipdeny.com snapshot source for the ipdeny system.
//
// ## Purpose
//
// - Fetches the country metadata page and extracts `NAME (CC)` pairs
// - Downloads the all-zones archive of one address family
// - Unpacks it into a complete per-country `Snapshot`
//
// ## Archive Layout
//
// Each family is published as one gzipped tarball with a member per
// country (`./us.zone`, `./fr.zone`, ...) holding one CIDR per line, plus an
// `MD5SUM` member that is skipped. Member names are lowercase; codes are
// uppercased on the way in.
//
// ## Architecture
//
// Downloads are single attempts with a request timeout. Decompression runs
// on the blocking pool.

use ipdeny_core::AdapterRegistry;
use ipdeny_core::config::SourceConfig;
use ipdeny_core::model::{AddressFamily, CountryCode, Snapshot, parse_cidr};
use ipdeny_core::traits::{CountryListing, SnapshotSource, SnapshotSourceFactory};
use ipdeny_core::{Error, Result};

use flate2::read::GzDecoder;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Largest metadata page accepted
const MAX_LISTING_BYTES: usize = 4 * 1024 * 1024;

/// Largest archive accepted
const MAX_ARCHIVE_BYTES: usize = 128 * 1024 * 1024;

/// Marker opening one country row on the metadata page
const LISTING_ROW_MARKER: &str = "<tr><td><p>";

/// Checksum member shipped inside every archive
const CHECKSUM_MEMBER: &str = "MD5SUM";

/// ipdeny.com snapshot source
pub struct HttpSnapshotSource {
    /// Country metadata page
    metadata_url: String,

    /// All-zones archive for IPv4
    ipv4_archive_url: String,

    /// All-zones archive for IPv6
    ipv6_archive_url: String,

    /// HTTP client
    client: reqwest::Client,
}

impl HttpSnapshotSource {
    /// Create a new HTTP snapshot source
    ///
    /// # Parameters
    ///
    /// - `metadata_url`: page listing the published countries
    /// - `ipv4_archive_url` / `ipv6_archive_url`: all-zones tarballs
    /// - `request_timeout`: deadline for each HTTP request
    pub fn new(
        metadata_url: String,
        ipv4_archive_url: String,
        ipv6_archive_url: String,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("ipdeny/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            metadata_url,
            ipv4_archive_url,
            ipv6_archive_url,
            client,
        })
    }

    fn archive_url(&self, family: AddressFamily) -> &str {
        match family {
            AddressFamily::V4 => &self.ipv4_archive_url,
            AddressFamily::V6 => &self.ipv6_archive_url,
        }
    }

    /// GET a URL and return its body, refusing bodies over `limit` bytes
    async fn fetch_bytes(&self, url: &str, limit: usize) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::source_fetch(format!("Request to {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::source_fetch(format!(
                "HTTP error from {}: {}",
                url,
                response.status()
            )));
        }

        if let Some(length) = response.content_length() {
            if length > limit as u64 {
                return Err(Error::source_fetch(format!(
                    "{} announced {} bytes, limit is {}",
                    url, length, limit
                )));
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| Error::source_fetch(format!("Failed to read body of {}: {}", url, e)))?;

        if body.len() > limit {
            return Err(Error::source_fetch(format!(
                "{} returned {} bytes, limit is {}",
                url,
                body.len(),
                limit
            )));
        }

        Ok(body.to_vec())
    }
}

#[async_trait::async_trait]
impl SnapshotSource for HttpSnapshotSource {
    async fn list_countries(&self) -> Result<Vec<CountryListing>> {
        let body = self.fetch_bytes(&self.metadata_url, MAX_LISTING_BYTES).await?;
        let page = String::from_utf8_lossy(&body);
        let listings = parse_country_listing(&page);

        if listings.is_empty() {
            return Err(Error::source_fetch(format!(
                "No countries found on {}",
                self.metadata_url
            )));
        }

        info!("Found {} countries on {}", listings.len(), self.metadata_url);
        Ok(listings)
    }

    async fn fetch_snapshot(&self, family: AddressFamily) -> Result<Snapshot> {
        let url = self.archive_url(family).to_string();
        let archive = self.fetch_bytes(&url, MAX_ARCHIVE_BYTES).await?;
        debug!("Downloaded {} archive: {} bytes", family, archive.len());

        tokio::task::spawn_blocking(move || parse_archive(family, &archive))
            .await
            .map_err(|e| Error::source_fetch(format!("Archive extraction task failed: {}", e)))?
    }

    fn source_name(&self) -> &'static str {
        "http"
    }
}

/// Extract `NAME (CC)` pairs from the metadata page
///
/// Rows look like `<tr><td><p>UNITED STATES (US)</p>...`. A row whose name is
/// not followed by a parenthesised two-letter uppercase code on the same line
/// is skipped.
pub fn parse_country_listing(page: &str) -> Vec<CountryListing> {
    page.match_indices(LISTING_ROW_MARKER)
        .filter_map(|(start, marker)| {
            let rest = &page[start + marker.len()..];
            let line = rest.split('\n').next().unwrap_or_default();
            parse_listing_row(line)
        })
        .collect()
}

/// Find the first ` (CC)` in a row and split the name off before it
fn parse_listing_row(line: &str) -> Option<CountryListing> {
    line.match_indices(" (").find_map(|(at, _)| {
        let code = line.get(at + 2..at + 4)?;
        if line.get(at + 4..at + 5)? != ")" || !code.bytes().all(|b| b.is_ascii_uppercase()) {
            return None;
        }
        let name = line[..at].trim();
        if name.is_empty() {
            return None;
        }
        Some(CountryListing {
            name: name.to_string(),
            code: CountryCode::parse(code).ok()?,
        })
    })
}

/// Unpack a gzipped all-zones tarball into a snapshot
///
/// Every country member present in the archive appears in the snapshot,
/// even with no blocks, so an emptied zone file clears that country.
pub fn parse_archive(family: AddressFamily, archive: &[u8]) -> Result<Snapshot> {
    let mut tarball = tar::Archive::new(GzDecoder::new(archive));
    let mut snapshot = Snapshot::new(family);

    let entries = tarball
        .entries()
        .map_err(|e| Error::source_fetch(format!("Unreadable {} archive: {}", family, e)))?;

    for entry in entries {
        let entry = entry
            .map_err(|e| Error::source_fetch(format!("Corrupt {} archive entry: {}", family, e)))?;

        if !entry.header().entry_type().is_file() {
            continue;
        }

        let path = entry
            .path()
            .map_err(|e| Error::source_fetch(format!("Bad member name in {} archive: {}", family, e)))?
            .into_owned();

        let Some(code) = member_country(&path) else {
            if path.file_name().and_then(|n| n.to_str()) != Some(CHECKSUM_MEMBER) {
                warn!("Skipping archive member {} (not a country zone)", path.display());
            }
            continue;
        };

        snapshot.add_country(code);

        for (number, line) in BufReader::new(entry).lines().enumerate() {
            let line = line.map_err(|e| {
                Error::source_fetch(format!("Failed to read {}: {}", path.display(), e))
            })?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            match parse_cidr(line).and_then(|net| snapshot.insert(code, net)) {
                Ok(()) => {}
                Err(e) => warn!(
                    "Skipping {}:{} '{}': {}",
                    path.display(),
                    number + 1,
                    line,
                    e
                ),
            }
        }
    }

    debug!(
        "Parsed {} archive: {} countries, {} blocks",
        family,
        snapshot.country_count(),
        snapshot.block_count()
    );

    Ok(snapshot)
}

/// Country code encoded in a member path (`./us.zone` -> `US`)
fn member_country(path: &Path) -> Option<CountryCode> {
    let name = path.file_name()?.to_str()?;
    if name == CHECKSUM_MEMBER {
        return None;
    }
    let stem = name.split('.').next()?;
    CountryCode::parse(stem).ok()
}

/// Factory for creating HTTP snapshot sources
pub struct HttpSourceFactory;

impl SnapshotSourceFactory for HttpSourceFactory {
    fn create(&self, config: &SourceConfig) -> Result<Box<dyn SnapshotSource>> {
        match config {
            SourceConfig::Http {
                metadata_url,
                ipv4_archive_url,
                ipv6_archive_url,
                request_timeout_secs,
            } => Ok(Box::new(HttpSnapshotSource::new(
                metadata_url.clone(),
                ipv4_archive_url.clone(),
                ipv6_archive_url.clone(),
                Duration::from_secs(*request_timeout_secs),
            )?)),
            _ => Err(Error::config("Invalid config for HTTP snapshot source")),
        }
    }
}

/// Register the HTTP snapshot source with a registry
pub fn register(registry: &AdapterRegistry) {
    registry.register_source("http", Box::new(HttpSourceFactory));
}
