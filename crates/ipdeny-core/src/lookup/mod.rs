//! Address-to-country lookup
//!
//! Answers "which block, and therefore which country, does this address
//! belong to" against the stored blocks, and records observed addresses
//! under their covering block.
//!
//! When several stored blocks cover an address the most specific one wins,
//! with the lowest id breaking ties (see [`select_cover`]). The sentinel's
//! catch-all is an ordinary `/0` block here, so it only answers for
//! addresses nothing else covers.

use crate::error::{Error, Result};
use crate::model::{host_net, select_cover, Block, Country, ObservedAddress};
use crate::traits::BlockStore;
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// Read-mostly query service over a [`BlockStore`]
#[derive(Clone)]
pub struct Lookup {
    store: Arc<dyn BlockStore>,
}

impl Lookup {
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        Self { store }
    }

    /// The block covering `address`, if any
    pub async fn find_covering_block(&self, address: IpAddr) -> Result<Option<Block>> {
        self.find_covering_block_for_net(&host_net(address)).await
    }

    /// The block covering every address of `network`, if any
    pub async fn find_covering_block_for_net(&self, network: &IpNet) -> Result<Option<Block>> {
        let candidates = self.store.covering_blocks(network).await?;
        if candidates.len() > 1 {
            debug!("{} candidate blocks cover {}", candidates.len(), network);
        }
        Ok(select_cover(&candidates).cloned())
    }

    /// The country owning the block that covers `address`
    pub async fn country_of(&self, address: IpAddr) -> Result<Option<Country>> {
        let Some(block) = self.find_covering_block(address).await? else {
            return Ok(None);
        };
        let country = self.store.country_by_id(block.country_id).await?;
        if country.is_none() {
            return Err(Error::consistency(format!(
                "block {} references missing country {}",
                block.id, block.country_id
            )));
        }
        Ok(country)
    }

    /// Return the stored row for `address`, recording it first if needed
    ///
    /// An existing row is returned as is, even if a more specific block has
    /// appeared since it was recorded. In particular a row that
    /// reconciliation parked on the sentinel catch-all (`0.0.0.0/0`, `::/0`)
    /// keeps pointing there after a new cover for it is inserted; use
    /// [`Lookup::find_covering_block`] or [`Lookup::country_of`] for the
    /// current owner. A new row points at the current covering block.
    ///
    /// # Errors
    ///
    /// `Error::NoCoveringBlock` if the address is new and no stored block
    /// covers it.
    pub async fn get_or_create_address(&self, address: IpAddr) -> Result<ObservedAddress> {
        if let Some(existing) = self.store.address_by_value(address).await? {
            return Ok(existing);
        }

        let block = self
            .find_covering_block(address)
            .await?
            .ok_or(Error::NoCoveringBlock(address))?;

        match self.store.insert_address(address, block.id).await {
            Ok(created) => {
                debug!("Recorded {} under block {} ({})", address, block.id, block.network);
                Ok(created)
            }
            // Another writer recorded it between our read and insert
            Err(Error::Conflict(_)) => self
                .store
                .address_by_value(address)
                .await?
                .ok_or_else(|| Error::consistency(format!("address {} vanished after conflict", address))),
            Err(e) => Err(e),
        }
    }
}
