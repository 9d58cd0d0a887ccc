// # Memory Block Store
//
// In-memory implementation of BlockStore.
//
// ## Purpose
//
// Provides a fast store that doesn't persist across restarts, with the same
// integrity rules as the relational schema (unique codes, unique CIDRs per
// country, unique addresses, both foreign keys). Useful for testing and for dry runs
// against a live snapshot source.
//
// ## Transactions
//
// Multi-row writes are staged on a copy of the tables and swapped in only
// when every step succeeded, so a failed `apply_removals` or
// `insert_countries` leaves nothing behind.

use async_trait::async_trait;
use ipnet::IpNet;
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::StoreConfig;
use crate::model::{
    AddressFamily, AddressId, Block, BlockId, Country, CountryCode, CountryId, NewCountry,
    ObservedAddress,
};
use crate::traits::block_store::{
    AddressMigration, BlockStore, BlockStoreFactory, MigrationTarget, RemovalPlan,
};
use crate::Error;

/// In-memory block store implementation
///
/// All tables live behind one RwLock; ids are assigned from per-table
/// sequences starting at 1, like a `SERIAL` column.
///
/// # Example
///
/// ```rust,no_run
/// use ipdeny_core::model::NewCountry;
/// use ipdeny_core::store::MemoryBlockStore;
/// use ipdeny_core::traits::BlockStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryBlockStore::new();
///
///     let countries = store
///         .insert_countries(&[NewCountry::new("US", "UNITED STATES")?])
///         .await?;
///     store
///         .apply_insertions(countries[0].id, &["8.8.8.0/24".parse::<ipnet::IpNet>()?])
///         .await?;
///
///     let covers = store.covering_blocks(&"8.8.8.8/32".parse::<ipnet::IpNet>()?).await?;
///     assert_eq!(covers.len(), 1);
///
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockStore {
    inner: Arc<RwLock<Tables>>,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    countries: BTreeMap<CountryId, Country>,
    blocks: BTreeMap<BlockId, Block>,
    addresses: BTreeMap<AddressId, ObservedAddress>,
    last_country_id: CountryId,
    last_block_id: BlockId,
    last_address_id: AddressId,
}

impl Tables {
    fn insert_country(&mut self, new: &NewCountry) -> Result<Country, Error> {
        if self.countries.values().any(|c| c.code == new.code) {
            return Err(Error::conflict(format!("country {} already exists", new.code)));
        }
        self.last_country_id += 1;
        let country = Country {
            id: self.last_country_id,
            code: new.code,
            name: new.name.clone(),
        };
        self.countries.insert(country.id, country.clone());
        Ok(country)
    }

    fn insert_block(&mut self, country_id: CountryId, network: IpNet) -> Result<Block, Error> {
        if !self.countries.contains_key(&country_id) {
            return Err(Error::storage(format!(
                "foreign key violation: country {} does not exist",
                country_id
            )));
        }
        if self
            .blocks
            .values()
            .any(|b| b.country_id == country_id && b.network == network)
        {
            return Err(Error::conflict(format!(
                "block {} already exists for country {}",
                network, country_id
            )));
        }
        self.last_block_id += 1;
        let block = Block {
            id: self.last_block_id,
            country_id,
            network,
        };
        self.blocks.insert(block.id, block.clone());
        Ok(block)
    }

    fn sentinel_block(
        &mut self,
        country_id: CountryId,
        family: AddressFamily,
    ) -> Result<Block, Error> {
        let catch_all = family.catch_all();
        let existing = self
            .blocks
            .values()
            .find(|b| b.country_id == country_id && b.network == catch_all)
            .cloned();
        match existing {
            Some(block) => Ok(block),
            None => self.insert_block(country_id, catch_all),
        }
    }
}

impl MemoryBlockStore {
    /// Create a new empty memory block store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blocks
    pub async fn block_count(&self) -> usize {
        self.inner.read().await.blocks.len()
    }

    /// Number of stored observed addresses
    pub async fn address_count(&self) -> usize {
        self.inner.read().await.addresses.len()
    }

    /// Snapshot of every observed address, ordered by id
    pub async fn all_addresses(&self) -> Vec<ObservedAddress> {
        self.inner.read().await.addresses.values().cloned().collect()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn ensure_schema(&self) -> Result<(), Error> {
        // Tables exist from construction
        Ok(())
    }

    async fn insert_countries(&self, countries: &[NewCountry]) -> Result<Vec<Country>, Error> {
        let mut guard = self.inner.write().await;
        let mut staged = guard.clone();
        let inserted = countries
            .iter()
            .map(|new| staged.insert_country(new))
            .collect::<Result<Vec<_>, _>>()?;
        *guard = staged;
        Ok(inserted)
    }

    async fn country_by_code(&self, code: &CountryCode) -> Result<Option<Country>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.countries.values().find(|c| c.code == *code).cloned())
    }

    async fn country_by_id(&self, id: CountryId) -> Result<Option<Country>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.countries.get(&id).cloned())
    }

    async fn list_countries(&self) -> Result<Vec<Country>, Error> {
        let guard = self.inner.read().await;
        let mut countries: Vec<Country> = guard.countries.values().cloned().collect();
        countries.sort_by(|a, b| a.code.cmp(&b.code));
        Ok(countries)
    }

    async fn blocks_for(
        &self,
        country_id: CountryId,
        family: AddressFamily,
    ) -> Result<Vec<Block>, Error> {
        let guard = self.inner.read().await;
        Ok(guard
            .blocks
            .values()
            .filter(|b| b.country_id == country_id && b.family() == family)
            .cloned()
            .collect())
    }

    async fn covering_blocks(&self, network: &IpNet) -> Result<Vec<Block>, Error> {
        let guard = self.inner.read().await;
        Ok(guard
            .blocks
            .values()
            .filter(|b| b.contains_net(network))
            .cloned()
            .collect())
    }

    async fn block_by_id(&self, id: BlockId) -> Result<Option<Block>, Error> {
        let guard = self.inner.read().await;
        Ok(guard.blocks.get(&id).cloned())
    }

    async fn address_by_value(&self, address: IpAddr) -> Result<Option<ObservedAddress>, Error> {
        let guard = self.inner.read().await;
        Ok(guard
            .addresses
            .values()
            .find(|a| a.address == address)
            .cloned())
    }

    async fn insert_address(
        &self,
        address: IpAddr,
        block_id: BlockId,
    ) -> Result<ObservedAddress, Error> {
        let mut guard = self.inner.write().await;
        if !guard.blocks.contains_key(&block_id) {
            return Err(Error::not_found(format!("block {} does not exist", block_id)));
        }
        if guard.addresses.values().any(|a| a.address == address) {
            return Err(Error::conflict(format!("address {} already exists", address)));
        }
        guard.last_address_id += 1;
        let observed = ObservedAddress {
            id: guard.last_address_id,
            block_id,
            address,
        };
        guard.addresses.insert(observed.id, observed.clone());
        Ok(observed)
    }

    async fn addresses_in_blocks(
        &self,
        block_ids: &[BlockId],
    ) -> Result<Vec<ObservedAddress>, Error> {
        let wanted: HashSet<BlockId> = block_ids.iter().copied().collect();
        let guard = self.inner.read().await;
        Ok(guard
            .addresses
            .values()
            .filter(|a| wanted.contains(&a.block_id))
            .cloned()
            .collect())
    }

    async fn apply_removals(&self, plan: &RemovalPlan) -> Result<Vec<AddressMigration>, Error> {
        let mut guard = self.inner.write().await;
        let mut staged = guard.clone();
        let mut migrations = Vec::with_capacity(plan.migrations.len());

        for planned in &plan.migrations {
            let to_block = match planned.target {
                MigrationTarget::Block(id) => staged
                    .blocks
                    .get(&id)
                    .cloned()
                    .ok_or_else(|| Error::not_found(format!("target block {} does not exist", id)))?,
                MigrationTarget::Sentinel { country_id, family } => {
                    staged.sentinel_block(country_id, family)?
                }
            };

            let address = staged.addresses.get_mut(&planned.address_id).ok_or_else(|| {
                Error::not_found(format!("address {} does not exist", planned.address_id))
            })?;
            if address.block_id != planned.from_block {
                return Err(Error::conflict(format!(
                    "address {} moved from block {} to {} concurrently",
                    address.address, planned.from_block, address.block_id
                )));
            }
            address.block_id = to_block.id;

            migrations.push(AddressMigration {
                address: address.clone(),
                from_block: planned.from_block,
                to_block,
            });
        }

        for block_id in &plan.deletions {
            if let Some(address) = staged.addresses.values().find(|a| a.block_id == *block_id) {
                return Err(Error::storage(format!(
                    "foreign key violation: block {} is still referenced by address {}",
                    block_id, address.address
                )));
            }
            if staged.blocks.remove(block_id).is_none() {
                return Err(Error::not_found(format!("block {} does not exist", block_id)));
            }
        }

        *guard = staged;
        Ok(migrations)
    }

    async fn apply_insertions(
        &self,
        country_id: CountryId,
        networks: &[IpNet],
    ) -> Result<Vec<Block>, Error> {
        let mut guard = self.inner.write().await;
        let mut staged = guard.clone();
        let inserted = networks
            .iter()
            .map(|network| staged.insert_block(country_id, *network))
            .collect::<Result<Vec<_>, _>>()?;
        *guard = staged;
        Ok(inserted)
    }
}

/// Factory for the `memory` store type
pub struct MemoryBlockStoreFactory;

#[async_trait]
impl BlockStoreFactory for MemoryBlockStoreFactory {
    async fn create(&self, config: &StoreConfig) -> Result<Arc<dyn BlockStore>, Error> {
        match config {
            StoreConfig::Memory => Ok(Arc::new(MemoryBlockStore::new())),
            _ => Err(Error::config("Invalid config for memory block store")),
        }
    }
}
