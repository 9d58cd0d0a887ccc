//! Core traits for the ipdeny system
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`BlockStore`]: Relational storage of countries, blocks and observed addresses
//! - [`SnapshotSource`]: Retrieval of the published per-country block lists

pub mod block_store;
pub mod snapshot_source;

pub use block_store::{
    AddressMigration, BlockStore, BlockStoreFactory, MigrationTarget, PlannedMigration,
    RemovalPlan,
};
pub use snapshot_source::{CountryListing, SnapshotSource, SnapshotSourceFactory};
