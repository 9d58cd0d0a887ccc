//! Test doubles and common utilities for contract tests
//!
//! This module provides minimal sources and store wrappers that let the
//! contract tests drive the engine without a network or a database.

#![allow(dead_code)]

use async_trait::async_trait;
use ipdeny_core::error::{Error, Result};
use ipdeny_core::model::{
    AddressFamily, Block, BlockId, Country, CountryCode, CountryId, NewCountry, ObservedAddress,
    Snapshot,
};
use ipdeny_core::traits::{
    AddressMigration, BlockStore, CountryListing, RemovalPlan, SnapshotSource,
};
use ipdeny_core::{EngineConfig, MemoryBlockStore, Reconciler};
use ipnet::IpNet;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Parse a list of CIDR literals into a set
pub fn nets(cidrs: &[&str]) -> BTreeSet<IpNet> {
    cidrs.iter().map(|c| c.parse().unwrap()).collect()
}

/// Parse a country code literal
pub fn code(raw: &str) -> CountryCode {
    CountryCode::parse(raw).unwrap()
}

/// A memory store with the given countries already inserted
pub async fn seeded_store(codes: &[&str]) -> MemoryBlockStore {
    let store = MemoryBlockStore::new();
    let seed: Vec<NewCountry> = codes
        .iter()
        .map(|c| NewCountry::new(c, &format!("COUNTRY {}", c)).unwrap())
        .collect();
    store.insert_countries(&seed).await.unwrap();
    store
}

/// A reconciler with default settings over `store`
pub fn reconciler(store: Arc<dyn BlockStore>) -> Reconciler {
    let (engine, _rx) = Reconciler::new(store, EngineConfig::default()).unwrap();
    engine
}

/// Stored networks of one (country, family) unit
pub async fn stored_set(
    store: &dyn BlockStore,
    country: &str,
    family: AddressFamily,
) -> BTreeSet<IpNet> {
    let country = store.country_by_code(&code(country)).await.unwrap().unwrap();
    store
        .blocks_for(country.id, family)
        .await
        .unwrap()
        .into_iter()
        .map(|b| b.network)
        .collect()
}

/// Record an observed address under the block that exactly matches `cidr`
pub async fn observe_in(store: &dyn BlockStore, address: &str, cidr: &str) -> ObservedAddress {
    let network: IpNet = cidr.parse().unwrap();
    let block = store
        .covering_blocks(&network)
        .await
        .unwrap()
        .into_iter()
        .find(|b| b.network == network)
        .unwrap();
    store
        .insert_address(address.parse().unwrap(), block.id)
        .await
        .unwrap()
}

/// Assert that every observed address points at an existing block that
/// contains it
pub async fn assert_no_dangling(store: &MemoryBlockStore) {
    for address in store.all_addresses().await {
        let block = store
            .block_by_id(address.block_id)
            .await
            .unwrap()
            .unwrap_or_else(|| panic!("{} points at deleted block {}", address.address, address.block_id));
        assert!(
            block.covers(&address.address),
            "{} points at {} which does not contain it",
            address.address,
            block.network
        );
    }
}

/// A snapshot source serving fixed data, with per-family failure injection
#[derive(Default)]
pub struct StaticSnapshotSource {
    listings: Vec<CountryListing>,
    snapshots: HashMap<AddressFamily, Snapshot>,
    failing: HashSet<AddressFamily>,
    stalled: HashSet<AddressFamily>,
    fetch_count: AtomicUsize,
}

impl StaticSnapshotSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a country in the metadata listing
    pub fn with_country(mut self, raw: &str, name: &str) -> Self {
        self.listings.push(CountryListing {
            name: name.to_string(),
            code: code(raw),
        });
        self
    }

    /// Publish blocks for a country; an empty slice publishes an empty list
    pub fn with_blocks(mut self, family: AddressFamily, raw: &str, cidrs: &[&str]) -> Self {
        let snapshot = self
            .snapshots
            .entry(family)
            .or_insert_with(|| Snapshot::new(family));
        snapshot.add_country(code(raw));
        for cidr in cidrs {
            snapshot.insert(code(raw), cidr.parse().unwrap()).unwrap();
        }
        self
    }

    /// Make fetches of `family` fail
    pub fn failing(mut self, family: AddressFamily) -> Self {
        self.failing.insert(family);
        self
    }

    /// Make fetches of `family` hang well past any engine deadline
    pub fn stalled(mut self, family: AddressFamily) -> Self {
        self.stalled.insert(family);
        self
    }

    /// Number of fetch_snapshot calls so far
    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for StaticSnapshotSource {
    async fn list_countries(&self) -> Result<Vec<CountryListing>> {
        Ok(self.listings.clone())
    }

    async fn fetch_snapshot(&self, family: AddressFamily) -> Result<Snapshot> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        if self.stalled.contains(&family) {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.failing.contains(&family) {
            return Err(Error::source_fetch(format!("{} archive unavailable", family)));
        }
        Ok(self
            .snapshots
            .get(&family)
            .cloned()
            .unwrap_or_else(|| Snapshot::new(family)))
    }

    fn source_name(&self) -> &'static str {
        "static"
    }
}

/// A BlockStore wrapper that counts writes and can fail them per country
#[derive(Clone, Default)]
pub struct FaultyStore {
    inner: MemoryBlockStore,
    failing_countries: Arc<Mutex<HashSet<CountryId>>>,
    removal_calls: Arc<AtomicUsize>,
    insertion_calls: Arc<AtomicUsize>,
}

impl FaultyStore {
    pub fn new(inner: MemoryBlockStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    /// The wrapped store
    pub fn inner(&self) -> &MemoryBlockStore {
        &self.inner
    }

    /// Make every insertion for `country` fail with a storage error
    pub async fn fail_insertions_for(&self, country: &str) {
        let country = self.inner.country_by_code(&code(country)).await.unwrap().unwrap();
        self.failing_countries.lock().unwrap().insert(country.id);
    }

    /// Number of apply_removals calls so far
    pub fn removal_calls(&self) -> usize {
        self.removal_calls.load(Ordering::SeqCst)
    }

    /// Number of apply_insertions calls so far
    pub fn insertion_calls(&self) -> usize {
        self.insertion_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BlockStore for FaultyStore {
    async fn ensure_schema(&self) -> Result<()> {
        self.inner.ensure_schema().await
    }

    async fn insert_countries(&self, countries: &[NewCountry]) -> Result<Vec<Country>> {
        self.inner.insert_countries(countries).await
    }

    async fn country_by_code(&self, code: &CountryCode) -> Result<Option<Country>> {
        self.inner.country_by_code(code).await
    }

    async fn country_by_id(&self, id: CountryId) -> Result<Option<Country>> {
        self.inner.country_by_id(id).await
    }

    async fn list_countries(&self) -> Result<Vec<Country>> {
        self.inner.list_countries().await
    }

    async fn blocks_for(&self, country_id: CountryId, family: AddressFamily) -> Result<Vec<Block>> {
        self.inner.blocks_for(country_id, family).await
    }

    async fn covering_blocks(&self, network: &IpNet) -> Result<Vec<Block>> {
        self.inner.covering_blocks(network).await
    }

    async fn block_by_id(&self, id: BlockId) -> Result<Option<Block>> {
        self.inner.block_by_id(id).await
    }

    async fn address_by_value(&self, address: IpAddr) -> Result<Option<ObservedAddress>> {
        self.inner.address_by_value(address).await
    }

    async fn insert_address(&self, address: IpAddr, block_id: BlockId) -> Result<ObservedAddress> {
        self.inner.insert_address(address, block_id).await
    }

    async fn addresses_in_blocks(&self, block_ids: &[BlockId]) -> Result<Vec<ObservedAddress>> {
        self.inner.addresses_in_blocks(block_ids).await
    }

    async fn apply_removals(&self, plan: &RemovalPlan) -> Result<Vec<AddressMigration>> {
        self.removal_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.apply_removals(plan).await
    }

    async fn apply_insertions(&self, country_id: CountryId, networks: &[IpNet]) -> Result<Vec<Block>> {
        self.insertion_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_countries.lock().unwrap().contains(&country_id) {
            return Err(Error::storage(format!(
                "injected failure inserting for country {}",
                country_id
            )));
        }
        self.inner.apply_insertions(country_id, networks).await
    }
}
