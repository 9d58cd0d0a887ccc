//! First-install procedure
//!
//! Seeds the country table from the source's published listing plus a fixed
//! set of corrections, then runs a full reconciliation to load every block.
//!
//! Bootstrap is meant to run once against an empty store. Running it again
//! fails on the country code uniqueness constraint before anything is
//! written; callers that want a soft guard check [`is_bootstrapped`] first.

use crate::engine::{Reconciler, RunReport};
use crate::error::{Error, Result};
use crate::model::{CountryCode, NewCountry};
use crate::traits::{BlockStore, CountryListing, SnapshotSource};
use std::collections::HashSet;
use tracing::{debug, info};

/// Codes the published listing is known to lack, with their display names
///
/// `ZZ` is the sentinel that owns the catch-all blocks; the engine needs it
/// to exist before any orphaned address can be re-homed.
pub const MISSING_COUNTRIES: &[(&str, &str)] = &[
    ("BL", "SAINT BARTHELEMY"),
    ("GG", "GUERNSEY"),
    ("SX", "SINT MAARTEN"),
    ("MF", "SAINT MARTIN"),
    ("BQ", "BONAIRE"),
    ("CW", "CURACAO"),
    ("AP", "ASIA-PACIFIC REGION"),
    ("SS", "SOUTH SUDAN"),
    ("EU", "EUROPE"),
    ("ZZ", "UNALLOCATED"),
];

/// Build the rows to insert: listings first, then the missing corrections
///
/// Each code appears once. A listing repeated by the source keeps its first
/// name.
pub fn seed_list(listings: &[CountryListing]) -> Result<Vec<NewCountry>> {
    let mut seen: HashSet<CountryCode> = HashSet::new();
    let mut seed = Vec::with_capacity(listings.len() + MISSING_COUNTRIES.len());

    for listing in listings {
        if seen.insert(listing.code) {
            seed.push(NewCountry::new(listing.code.as_str(), &listing.name)?);
        } else {
            debug!("Ignoring repeated listing for {}", listing.code);
        }
    }

    for (code, name) in MISSING_COUNTRIES {
        let correction = NewCountry::new(code, name)?;
        if seen.insert(correction.code) {
            seed.push(correction);
        }
    }

    Ok(seed)
}

/// Whether the store already holds any country
pub async fn is_bootstrapped(store: &dyn BlockStore) -> Result<bool> {
    Ok(!store.list_countries().await?.is_empty())
}

/// Seed countries and load every block
///
/// The country insert is a single transaction; if it fails nothing is
/// seeded and no reconciliation runs. Reconciliation failures after that
/// are reported in the returned [`RunReport`] like any other run.
pub async fn bootstrap(
    store: &dyn BlockStore,
    source: &dyn SnapshotSource,
    reconciler: &Reconciler,
) -> Result<RunReport> {
    store.ensure_schema().await?;

    info!("Fetching country listing from {}", source.source_name());
    let listings = source.list_countries().await?;
    let seed = seed_list(&listings)?;

    let inserted = store.insert_countries(&seed).await.map_err(|e| match e {
        Error::Conflict(msg) => Error::conflict(format!("store is already bootstrapped: {}", msg)),
        other => other,
    })?;
    info!(
        "Seeded {} countries ({} listed, {} corrections)",
        inserted.len(),
        listings.len(),
        inserted.len().saturating_sub(listings.len())
    );

    Ok(reconciler.run(source).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(code: &str, name: &str) -> CountryListing {
        CountryListing {
            name: name.to_string(),
            code: CountryCode::parse(code).unwrap(),
        }
    }

    #[test]
    fn test_seed_list_appends_corrections() {
        let seed = seed_list(&[listing("US", "UNITED STATES"), listing("FR", "FRANCE")]).unwrap();

        assert_eq!(seed.len(), 2 + MISSING_COUNTRIES.len());
        assert_eq!(seed[0].code.as_str(), "US");
        assert_eq!(seed[1].code.as_str(), "FR");
        assert_eq!(seed.last().unwrap().code, CountryCode::SENTINEL);
    }

    #[test]
    fn test_seed_list_prefers_published_name() {
        let seed = seed_list(&[listing("EU", "EUROPEAN UNION")]).unwrap();

        let eu: Vec<_> = seed.iter().filter(|c| c.code.as_str() == "EU").collect();
        assert_eq!(eu.len(), 1);
        assert_eq!(eu[0].name, "EUROPEAN UNION");
        assert_eq!(seed.len(), MISSING_COUNTRIES.len());
    }

    #[test]
    fn test_seed_list_drops_repeated_listing() {
        let seed = seed_list(&[listing("US", "UNITED STATES"), listing("US", "USA")]).unwrap();
        let us: Vec<_> = seed.iter().filter(|c| c.code.as_str() == "US").collect();
        assert_eq!(us.len(), 1);
        assert_eq!(us[0].name, "UNITED STATES");
    }

    #[test]
    fn test_corrections_are_valid_codes() {
        for (code, name) in MISSING_COUNTRIES {
            assert!(NewCountry::new(code, name).is_ok(), "{} should parse", code);
        }
    }
}
