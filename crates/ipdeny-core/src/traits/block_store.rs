// # Block Store Trait
//
// Defines the storage adapter the core consumes: explicit repository calls
// over the three persisted tables (countries, blocks, observed addresses).
//
// ## Purpose
//
// Every database round trip is a visible call on this trait. There is no
// lazy loading of related rows: a block carries its `country_id`, and the
// country is fetched with `country_by_id` when the caller needs it.
//
// ## Transactions
//
// Reconciliation of one (country, family) unit writes through exactly two
// calls, each of which must be a single durable transaction:
//
// 1. `apply_removals`: re-point dependent addresses, then delete blocks
// 2. `apply_insertions`: insert the new blocks
//
// A crash between them leaves new blocks missing, never a dangling
// address reference.
//
// ## Implementations
//
// - In-memory: `MemoryBlockStore` (this crate)
// - Relational (SQLite / PostgreSQL): `ipdeny-store-sql` crate

use async_trait::async_trait;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;

use crate::model::{
    AddressFamily, AddressId, Block, BlockId, Country, CountryCode, CountryId, NewCountry,
    ObservedAddress,
};

/// Where a dependent address goes when its block is removed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MigrationTarget {
    /// An existing block that survives the removal
    Block(BlockId),
    /// The sentinel country's catch-all block for the family
    ///
    /// The store creates the catch-all inside the removal transaction if it
    /// does not exist yet.
    Sentinel {
        country_id: CountryId,
        family: AddressFamily,
    },
}

/// One planned re-homing of an observed address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedMigration {
    pub address_id: AddressId,
    pub from_block: BlockId,
    pub target: MigrationTarget,
}

/// First-phase write set of a reconciliation unit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemovalPlan {
    /// Addresses to re-point, applied before any deletion
    pub migrations: Vec<PlannedMigration>,
    /// Blocks to delete once nothing references them
    pub deletions: Vec<BlockId>,
}

impl RemovalPlan {
    /// Whether the plan writes nothing
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty() && self.deletions.is_empty()
    }
}

/// A completed re-homing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressMigration {
    /// The address row as it now stands
    pub address: ObservedAddress,
    /// The block it used to point at (now deleted)
    pub from_block: BlockId,
    /// The block it points at now
    pub to_block: Block,
}

/// Trait for block store implementations
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from multiple tasks. The
/// engine itself never reconciles the same (country, family) pair from two
/// tasks; guarding against two processes doing so is left to the operator.
///
/// # Integrity
///
/// Implementations must enforce:
/// - country codes are unique ([`Error::Conflict`](crate::Error::Conflict))
/// - a block's CIDR is unique within its country; the same CIDR may exist
///   under two countries while a transfer is half reconciled
/// - an observed address is unique
/// - every block references an existing country
/// - every observed address references an existing block; deleting a
///   referenced block is refused with [`Error::Storage`](crate::Error::Storage)
///
/// The engine plans migrations so the last rule never fires during
/// reconciliation.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Create the tables if they do not exist
    async fn ensure_schema(&self) -> Result<(), crate::Error>;

    /// Insert countries in a single transaction
    ///
    /// A duplicate code (within the batch or against stored rows) aborts the
    /// whole batch with `Error::Conflict`.
    async fn insert_countries(&self, countries: &[NewCountry])
    -> Result<Vec<Country>, crate::Error>;

    /// Look up a country by code
    async fn country_by_code(&self, code: &CountryCode) -> Result<Option<Country>, crate::Error>;

    /// Look up a country by id
    async fn country_by_id(&self, id: CountryId) -> Result<Option<Country>, crate::Error>;

    /// List all countries, ordered by code
    async fn list_countries(&self) -> Result<Vec<Country>, crate::Error>;

    /// All blocks of one country and family
    async fn blocks_for(
        &self,
        country_id: CountryId,
        family: AddressFamily,
    ) -> Result<Vec<Block>, crate::Error>;

    /// Every stored block whose range contains `network`
    ///
    /// Only blocks of the same family are considered. The result may hold
    /// several overlapping blocks; choosing among them is the caller's job
    /// (see [`select_cover`](crate::model::select_cover)).
    async fn covering_blocks(&self, network: &IpNet) -> Result<Vec<Block>, crate::Error>;

    /// Look up a block by id
    async fn block_by_id(&self, id: BlockId) -> Result<Option<Block>, crate::Error>;

    /// Look up an observed address by exact value
    async fn address_by_value(
        &self,
        address: IpAddr,
    ) -> Result<Option<ObservedAddress>, crate::Error>;

    /// Record a newly observed address
    ///
    /// Fails with `Error::Conflict` if the address already exists and with
    /// `Error::NotFound` if the block does not.
    async fn insert_address(
        &self,
        address: IpAddr,
        block_id: BlockId,
    ) -> Result<ObservedAddress, crate::Error>;

    /// All observed addresses pointing at any of the given blocks
    async fn addresses_in_blocks(
        &self,
        block_ids: &[BlockId],
    ) -> Result<Vec<ObservedAddress>, crate::Error>;

    /// Re-point addresses and delete blocks in one transaction
    ///
    /// Migrations are applied first, then deletions. On any failure nothing
    /// is written.
    async fn apply_removals(
        &self,
        plan: &RemovalPlan,
    ) -> Result<Vec<AddressMigration>, crate::Error>;

    /// Insert blocks for one country in one transaction
    async fn apply_insertions(
        &self,
        country_id: CountryId,
        networks: &[IpNet],
    ) -> Result<Vec<Block>, crate::Error>;
}

/// Helper trait for constructing block stores from configuration
///
/// Construction is async because relational stores connect eagerly.
#[async_trait]
pub trait BlockStoreFactory: Send + Sync {
    /// Create a BlockStore instance from configuration
    async fn create(
        &self,
        config: &crate::config::StoreConfig,
    ) -> Result<Arc<dyn BlockStore>, crate::Error>;
}
