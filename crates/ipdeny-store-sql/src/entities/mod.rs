//! SeaORM entities for the three ipdeny tables

pub mod address;
pub mod block;
pub mod country;
