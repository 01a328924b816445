//! Operator-facing block list management

use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;

use crate::cache::BlockStatusCache;
use crate::clock::Clock;
use crate::models::BlockedEntry;
use crate::persistence::{BlockStore, PersistenceError};
use crate::resolver::canonical_address;

#[derive(Error, Debug)]
pub enum BlockError {
    #[error("Invalid IP address: {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Adds addresses to the block list and keeps the block-status cache honest
pub struct BlockManager {
    store: Arc<dyn BlockStore>,
    cache: Arc<BlockStatusCache>,
    clock: Arc<dyn Clock>,
}

impl BlockManager {
    pub fn new(
        store: Arc<dyn BlockStore>,
        cache: Arc<BlockStatusCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        BlockManager { store, cache, clock }
    }

    /// Block an address. Returns false if it was already blocked.
    ///
    /// On creation the cached status is invalidated so the block applies to
    /// the very next request.
    pub fn add(&self, address: &str, reason: Option<&str>) -> Result<bool, BlockError> {
        let ip = parse_address(address)?;
        let reason = reason.map(str::trim).filter(|r| !r.is_empty());

        let created = self.store.add_block(&ip, reason, self.clock.now())?;
        if created {
            self.cache.invalidate(&ip);
            log::info!("Blocked IP {} ({})", ip, reason.unwrap_or("no reason given"));
        } else {
            log::info!("IP {} is already blocked", ip);
        }
        Ok(created)
    }

    pub fn get(&self, address: &str) -> Result<Option<BlockedEntry>, BlockError> {
        let ip = parse_address(address)?;
        Ok(self.store.get_block(&ip)?)
    }

    pub fn list(&self) -> Result<Vec<BlockedEntry>, BlockError> {
        Ok(self.store.list_blocks()?)
    }
}

fn parse_address(address: &str) -> Result<IpAddr, BlockError> {
    address
        .trim()
        .parse::<IpAddr>()
        .map(|ip| canonical_address(&ip))
        .map_err(|_| BlockError::InvalidAddress(address.to_string()))
}
