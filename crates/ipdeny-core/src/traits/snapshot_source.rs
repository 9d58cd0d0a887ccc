// # Snapshot Source Trait
//
// Defines the interface for retrieving the published country list and the
// complete per-country block lists of one address family.
//
// ## Implementations
//
// - HTTP (ipdeny.com archives): `ipdeny-source-http` crate
// - Tests: static in-memory sources
//
// ## Usage
//
// ```rust,ignore
// use ipdeny_core::{AddressFamily, SnapshotSource};
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let source = /* SnapshotSource implementation */;
//
//     let countries = source.list_countries().await?;
//     let snapshot = source.fetch_snapshot(AddressFamily::V4).await?;
//     println!("{} countries, {} blocks", countries.len(), snapshot.block_count());
//
//     Ok(())
// }
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::{AddressFamily, CountryCode, Snapshot};

/// One row of the published country metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountryListing {
    /// Display name as published (e.g. "UNITED STATES")
    pub name: String,
    /// Uppercase two-letter code
    pub code: CountryCode,
}

/// Trait for snapshot source implementations
///
/// Sources always publish full snapshots, never deltas: whatever
/// `fetch_snapshot` returns for a country is the complete truth for that
/// country and family.
///
/// # Side Effects
///
/// Sources are read-only. They must not touch the block store; a fetch
/// always completes (or fails) before the engine writes anything, which is
/// what makes a failed fetch safe to retry.
///
/// # Errors
///
/// Network, decoding and archive failures are reported as
/// [`Error::SourceFetch`](crate::Error::SourceFetch). Retrying is the
/// caller's decision; implementations make a single attempt.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Fetch the published country code / name pairs
    async fn list_countries(&self) -> Result<Vec<CountryListing>, crate::Error>;

    /// Fetch the complete block list of every country for one family
    async fn fetch_snapshot(&self, family: AddressFamily) -> Result<Snapshot, crate::Error>;

    /// Get the source name (for logging/debugging)
    fn source_name(&self) -> &'static str;
}

/// Helper trait for constructing snapshot sources from configuration
pub trait SnapshotSourceFactory: Send + Sync {
    /// Create a SnapshotSource instance from configuration
    fn create(
        &self,
        config: &crate::config::SourceConfig,
    ) -> Result<Box<dyn SnapshotSource>, crate::Error>;
}
