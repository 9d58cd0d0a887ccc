// # SQL Block Store
//
// Relational implementation of BlockStore on SeaORM, for SQLite and
// PostgreSQL.
//
// ## Schema
//
// - `ipdeny_countries (id, shortform UNIQUE, longform)`
// - `ipdeny_blocks (id, country_id -> countries, block, family, range_start,
//   range_end)`, unique on `(country_id, block)`
// - `ipdeny_addresses (id, block_id -> blocks, address UNIQUE, family,
//   address_bytes)`
//
// Range bounds and address bytes are fixed-width big-endian byte strings
// (4 bytes for IPv4, 16 for IPv6). Within one family, containment is then a
// plain byte comparison that both backends evaluate the same way.
//
// ## Transactions
//
// `insert_countries`, `apply_removals` and `apply_insertions` each run in
// one transaction. Any error drops the transaction, which rolls it back.

pub mod entities;

use async_trait::async_trait;
use ipdeny_core::config::StoreConfig;
use ipdeny_core::model::{
    AddressFamily, Block, BlockId, Country, CountryCode, CountryId, NewCountry, ObservedAddress,
};
use ipdeny_core::traits::{
    AddressMigration, BlockStore, BlockStoreFactory, MigrationTarget, RemovalPlan,
};
use ipdeny_core::{AdapterRegistry, Error, Result};
use ipnet::IpNet;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseBackend, DatabaseConnection,
    DbErr, EntityTrait, NotSet, QueryFilter, QueryOrder, Set, SqlErr, Statement,
    TransactionTrait,
};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

use entities::{address, block, country};

/// Block store backed by a SeaORM connection pool
#[derive(Debug, Clone)]
pub struct SqlBlockStore {
    db: DatabaseConnection,
}

impl SqlBlockStore {
    /// Connect and create the tables if needed
    ///
    /// `url` is a `sqlite:` or `postgres:` connection URL. For SQLite use
    /// `?mode=rwc` to create the file on first use.
    pub async fn connect(url: &str) -> Result<Self> {
        info!("Connecting to database: {}", redact(url));
        let db = Database::connect(url).await.map_err(db_err)?;
        let store = Self { db };
        store.create_tables().await?;
        Ok(store)
    }

    /// Wrap an existing connection
    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// The underlying connection
    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    async fn create_tables(&self) -> Result<()> {
        let backend = self.db.get_database_backend();
        for sql in schema(backend) {
            self.db
                .execute(Statement::from_string(backend, sql))
                .await
                .map_err(db_err)?;
        }
        debug!("Schema ready ({:?})", backend);
        Ok(())
    }
}

/// DDL for one backend, in creation order
fn schema(backend: DatabaseBackend) -> Vec<String> {
    let (serial, bigint, bytes) = match backend {
        DatabaseBackend::Postgres => ("BIGSERIAL PRIMARY KEY", "BIGINT", "BYTEA"),
        _ => ("INTEGER PRIMARY KEY AUTOINCREMENT", "INTEGER", "BLOB"),
    };

    vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS ipdeny_countries (
                id {serial},
                shortform TEXT NOT NULL UNIQUE,
                longform TEXT NOT NULL
            )
            "#
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS ipdeny_blocks (
                id {serial},
                country_id {bigint} NOT NULL REFERENCES ipdeny_countries(id),
                block TEXT NOT NULL,
                family INTEGER NOT NULL,
                range_start {bytes} NOT NULL,
                range_end {bytes} NOT NULL,
                UNIQUE(country_id, block)
            )
            "#
        ),
        r#"CREATE INDEX IF NOT EXISTS idx_ipdeny_blocks_range ON ipdeny_blocks(family, range_start, range_end)"#.to_string(),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS ipdeny_addresses (
                id {serial},
                block_id {bigint} NOT NULL REFERENCES ipdeny_blocks(id),
                address TEXT NOT NULL UNIQUE,
                family INTEGER NOT NULL,
                address_bytes {bytes} NOT NULL
            )
            "#
        ),
        r#"CREATE INDEX IF NOT EXISTS idx_ipdeny_addresses_block ON ipdeny_addresses(block_id)"#.to_string(),
    ]
}

/// Map a database error onto the core taxonomy
fn db_err(err: DbErr) -> Error {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(msg)) => Error::conflict(msg),
        Some(SqlErr::ForeignKeyConstraintViolation(msg)) => {
            Error::storage(format!("foreign key violation: {}", msg))
        }
        _ => Error::storage(err.to_string()),
    }
}

/// Hide the password part of a connection URL
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}://***{}", &url[..scheme], &url[at..]),
        _ => url.to_string(),
    }
}

fn addr_bytes(addr: IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

fn family_tag(family: AddressFamily) -> i32 {
    i32::from(family.as_u8())
}

fn to_country(model: country::Model) -> Result<Country> {
    Ok(Country {
        id: model.id,
        code: CountryCode::parse(&model.shortform)
            .map_err(|e| Error::storage(format!("country {}: {}", model.id, e)))?,
        name: model.longform,
    })
}

fn to_block(model: block::Model) -> Result<Block> {
    let network: IpNet = model
        .block
        .parse()
        .map_err(|e| Error::storage(format!("block {} holds '{}': {}", model.id, model.block, e)))?;
    Ok(Block {
        id: model.id,
        country_id: model.country_id,
        network,
    })
}

fn to_address(model: address::Model) -> Result<ObservedAddress> {
    let address: IpAddr = model.address.parse().map_err(|e| {
        Error::storage(format!("address {} holds '{}': {}", model.id, model.address, e))
    })?;
    Ok(ObservedAddress {
        id: model.id,
        block_id: model.block_id,
        address,
    })
}

async fn find_block<C: ConnectionTrait>(db: &C, id: BlockId) -> Result<Option<Block>> {
    block::Entity::find_by_id(id)
        .one(db)
        .await
        .map_err(db_err)?
        .map(to_block)
        .transpose()
}

async fn insert_block<C: ConnectionTrait>(
    db: &C,
    country_id: CountryId,
    network: IpNet,
) -> Result<Block> {
    let row = block::ActiveModel {
        id: NotSet,
        country_id: Set(country_id),
        block: Set(network.to_string()),
        family: Set(family_tag(AddressFamily::of_net(&network))),
        range_start: Set(addr_bytes(network.network())),
        range_end: Set(addr_bytes(network.broadcast())),
    }
    .insert(db)
    .await
    .map_err(db_err)?;
    to_block(row)
}

/// The sentinel's catch-all for a family, created on first use
async fn sentinel_block<C: ConnectionTrait>(
    db: &C,
    country_id: CountryId,
    family: AddressFamily,
) -> Result<Block> {
    let catch_all = family.catch_all();
    let existing = block::Entity::find()
        .filter(block::Column::CountryId.eq(country_id))
        .filter(block::Column::Block.eq(catch_all.to_string()))
        .one(db)
        .await
        .map_err(db_err)?;

    match existing {
        Some(row) => to_block(row),
        None => {
            info!("Creating {} catch-all for country {}", catch_all, country_id);
            insert_block(db, country_id, catch_all).await
        }
    }
}

#[async_trait]
impl BlockStore for SqlBlockStore {
    async fn ensure_schema(&self) -> Result<()> {
        self.create_tables().await
    }

    async fn insert_countries(&self, countries: &[NewCountry]) -> Result<Vec<Country>> {
        let txn = self.db.begin().await.map_err(db_err)?;
        let mut inserted = Vec::with_capacity(countries.len());

        for new in countries {
            let row = country::ActiveModel {
                id: NotSet,
                shortform: Set(new.code.to_string()),
                longform: Set(new.name.clone()),
            }
            .insert(&txn)
            .await
            .map_err(|e| match db_err(e) {
                Error::Conflict(_) => Error::conflict(format!("country {} already exists", new.code)),
                other => other,
            })?;
            inserted.push(to_country(row)?);
        }

        txn.commit().await.map_err(db_err)?;
        Ok(inserted)
    }

    async fn country_by_code(&self, code: &CountryCode) -> Result<Option<Country>> {
        country::Entity::find()
            .filter(country::Column::Shortform.eq(code.as_str()))
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(to_country)
            .transpose()
    }

    async fn country_by_id(&self, id: CountryId) -> Result<Option<Country>> {
        country::Entity::find_by_id(id)
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(to_country)
            .transpose()
    }

    async fn list_countries(&self) -> Result<Vec<Country>> {
        country::Entity::find()
            .order_by_asc(country::Column::Shortform)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(to_country)
            .collect()
    }

    async fn blocks_for(&self, country_id: CountryId, family: AddressFamily) -> Result<Vec<Block>> {
        block::Entity::find()
            .filter(block::Column::CountryId.eq(country_id))
            .filter(block::Column::Family.eq(family_tag(family)))
            .order_by_asc(block::Column::Id)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(to_block)
            .collect()
    }

    async fn covering_blocks(&self, network: &IpNet) -> Result<Vec<Block>> {
        let family = AddressFamily::of_net(network);
        block::Entity::find()
            .filter(block::Column::Family.eq(family_tag(family)))
            .filter(block::Column::RangeStart.lte(addr_bytes(network.network())))
            .filter(block::Column::RangeEnd.gte(addr_bytes(network.broadcast())))
            .order_by_asc(block::Column::Id)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(to_block)
            .collect()
    }

    async fn block_by_id(&self, id: BlockId) -> Result<Option<Block>> {
        find_block(&self.db, id).await
    }

    async fn address_by_value(&self, address: IpAddr) -> Result<Option<ObservedAddress>> {
        address::Entity::find()
            .filter(address::Column::Address.eq(address.to_string()))
            .one(&self.db)
            .await
            .map_err(db_err)?
            .map(to_address)
            .transpose()
    }

    async fn insert_address(&self, address: IpAddr, block_id: BlockId) -> Result<ObservedAddress> {
        if find_block(&self.db, block_id).await?.is_none() {
            return Err(Error::not_found(format!("block {} does not exist", block_id)));
        }

        let row = address::ActiveModel {
            id: NotSet,
            block_id: Set(block_id),
            address: Set(address.to_string()),
            family: Set(family_tag(AddressFamily::of_addr(&address))),
            address_bytes: Set(addr_bytes(address)),
        }
        .insert(&self.db)
        .await
        .map_err(|e| match db_err(e) {
            Error::Conflict(_) => Error::conflict(format!("address {} already exists", address)),
            other => other,
        })?;
        to_address(row)
    }

    async fn addresses_in_blocks(&self, block_ids: &[BlockId]) -> Result<Vec<ObservedAddress>> {
        if block_ids.is_empty() {
            return Ok(Vec::new());
        }
        address::Entity::find()
            .filter(address::Column::BlockId.is_in(block_ids.iter().copied()))
            .order_by_asc(address::Column::Id)
            .all(&self.db)
            .await
            .map_err(db_err)?
            .into_iter()
            .map(to_address)
            .collect()
    }

    async fn apply_removals(&self, plan: &RemovalPlan) -> Result<Vec<AddressMigration>> {
        let txn = self.db.begin().await.map_err(db_err)?;
        let mut migrations = Vec::with_capacity(plan.migrations.len());

        for planned in &plan.migrations {
            let to_block = match planned.target {
                MigrationTarget::Block(id) => find_block(&txn, id).await?.ok_or_else(|| {
                    Error::not_found(format!("target block {} does not exist", id))
                })?,
                MigrationTarget::Sentinel { country_id, family } => {
                    sentinel_block(&txn, country_id, family).await?
                }
            };

            let row = address::Entity::find_by_id(planned.address_id)
                .one(&txn)
                .await
                .map_err(db_err)?
                .ok_or_else(|| {
                    Error::not_found(format!("address {} does not exist", planned.address_id))
                })?;
            if row.block_id != planned.from_block {
                return Err(Error::conflict(format!(
                    "address {} moved from block {} to {} concurrently",
                    row.address, planned.from_block, row.block_id
                )));
            }

            let mut active: address::ActiveModel = row.into();
            active.block_id = Set(to_block.id);
            let updated = active.update(&txn).await.map_err(db_err)?;

            migrations.push(AddressMigration {
                address: to_address(updated)?,
                from_block: planned.from_block,
                to_block,
            });
        }

        for block_id in &plan.deletions {
            let referencing = address::Entity::find()
                .filter(address::Column::BlockId.eq(*block_id))
                .one(&txn)
                .await
                .map_err(db_err)?;
            if let Some(row) = referencing {
                return Err(Error::storage(format!(
                    "foreign key violation: block {} is still referenced by address {}",
                    block_id, row.address
                )));
            }

            let deleted = block::Entity::delete_by_id(*block_id)
                .exec(&txn)
                .await
                .map_err(db_err)?;
            if deleted.rows_affected == 0 {
                return Err(Error::not_found(format!("block {} does not exist", block_id)));
            }
        }

        txn.commit().await.map_err(db_err)?;
        Ok(migrations)
    }

    async fn apply_insertions(&self, country_id: CountryId, networks: &[IpNet]) -> Result<Vec<Block>> {
        let txn = self.db.begin().await.map_err(db_err)?;

        let owner = country::Entity::find_by_id(country_id)
            .one(&txn)
            .await
            .map_err(db_err)?;
        if owner.is_none() {
            return Err(Error::storage(format!(
                "foreign key violation: country {} does not exist",
                country_id
            )));
        }

        let mut inserted = Vec::with_capacity(networks.len());
        for network in networks {
            let block = insert_block(&txn, country_id, *network)
                .await
                .map_err(|e| match e {
                    Error::Conflict(_) => Error::conflict(format!(
                        "block {} already exists for country {}",
                        network, country_id
                    )),
                    other => other,
                })?;
            inserted.push(block);
        }

        txn.commit().await.map_err(db_err)?;
        Ok(inserted)
    }
}

/// Factory for the `sql` store type
pub struct SqlStoreFactory;

#[async_trait]
impl BlockStoreFactory for SqlStoreFactory {
    async fn create(&self, config: &StoreConfig) -> Result<Arc<dyn BlockStore>> {
        match config {
            StoreConfig::Sql { url } => Ok(Arc::new(SqlBlockStore::connect(url).await?)),
            _ => Err(Error::config("Invalid config for SQL block store")),
        }
    }
}

/// Register the SQL block store with a registry
pub fn register(registry: &AdapterRegistry) {
    registry.register_store("sql", Box::new(SqlStoreFactory));
}
