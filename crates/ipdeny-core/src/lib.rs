// # ipdeny-core
//
// Core library for keeping a per-country IP block database in line with the
// lists published by ipdeny.com style feeds.
//
// ## Architecture Overview
//
// - **SnapshotSource**: Trait for fetching the full published block lists
// - **BlockStore**: Trait for the relational state of record (countries,
//   blocks, observed addresses)
// - **Reconciler**: Core engine that diffs snapshots against the store and
//   re-homes observed addresses before their block disappears
// - **Lookup**: Address-to-block and address-to-country queries
// - **bootstrap**: One-time seeding of the country table
// - **AdapterRegistry**: Plugin-based registry for stores and sources
//
// ## Design Principles
//
// 1. **Separation of Concerns**: Core logic is separate from adapters
// 2. **Full Snapshots**: Sources publish complete lists; the store is diffed
// 3. **No Dangling References**: An observed address always points at an
//    existing block, falling back to the `ZZ` catch-all
// 4. **Library-First**: All core functionality can be used as a library
// 5. **Idempotency**: Reconciling the same snapshot twice writes nothing

pub mod traits;
pub mod model;
pub mod engine;
pub mod lookup;
pub mod bootstrap;
pub mod registry;
pub mod config;
pub mod error;
pub mod store;

// Re-export core types for convenience
pub use traits::{BlockStore, CountryListing, SnapshotSource};
pub use model::{AddressFamily, Block, Country, CountryCode, NewCountry, ObservedAddress, Snapshot};
pub use engine::{ReconcileEvent, ReconcileOutcome, Reconciler, RunReport};
pub use lookup::Lookup;
pub use registry::AdapterRegistry;
pub use config::{EngineConfig, IpdenyConfig, SourceConfig, StoreConfig};
pub use error::{Error, ErrorKind, Result};
pub use store::MemoryBlockStore;
