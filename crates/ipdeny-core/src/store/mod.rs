// # Block Store Implementations
//
// This module provides the in-memory implementation of the BlockStore
// trait. The relational implementation lives in `ipdeny-store-sql`.

pub mod memory;

pub use memory::{MemoryBlockStore, MemoryBlockStoreFactory};
