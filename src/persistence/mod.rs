//! Persistence module for request, block and suspicious-address storage
//!
//! Three logical stores are defined as independent traits so that the
//! pipeline and the detector depend only on what they read or write.
//! [`SqliteStore`] implements all of them over a single database.

pub mod sqlite_store;

pub use sqlite_store::SqliteStore;

use crate::models::{BlockedEntry, RequestRecord, SuspiciousEntry};
use serde::Serialize;
use std::net::IpAddr;
use thiserror::Error;

/// Errors that can occur during persistence operations
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data in database: {0}")]
    InvalidData(String),

    #[error("Database connection lock poisoned")]
    LockPoisoned,
}

/// Number of matching request records for one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddressCount {
    pub address: IpAddr,
    pub count: usize,
}

/// Append-only log of allowed requests
pub trait RequestLogStore: Send + Sync {
    /// Persist one request record
    fn append_request(&self, record: &RequestRecord) -> Result<(), PersistenceError>;

    /// Most recent records for an address, newest first
    fn recent_requests(
        &self,
        address: &IpAddr,
        limit: usize,
    ) -> Result<Vec<RequestRecord>, PersistenceError>;

    /// Addresses with more than `more_than` records at or after `since`
    ///
    /// Ordered by count descending, then address.
    fn request_counts_since(
        &self,
        since: i64,
        more_than: usize,
    ) -> Result<Vec<AddressCount>, PersistenceError>;

    /// Addresses with more than `more_than` records at or after `since` whose
    /// path contains `pattern`, compared case-insensitively
    fn path_match_counts_since(
        &self,
        since: i64,
        pattern: &str,
        more_than: usize,
    ) -> Result<Vec<AddressCount>, PersistenceError>;

    /// Remove records older than `before`, returning how many were deleted
    fn prune_requests_before(&self, before: i64) -> Result<usize, PersistenceError>;
}

/// Persistent block list, unique per address
pub trait BlockStore: Send + Sync {
    fn is_blocked(&self, address: &IpAddr) -> Result<bool, PersistenceError>;

    /// Insert a block entry. Returns false if the address was already blocked.
    fn add_block(
        &self,
        address: &IpAddr,
        reason: Option<&str>,
        blocked_at: i64,
    ) -> Result<bool, PersistenceError>;

    fn get_block(&self, address: &IpAddr) -> Result<Option<BlockedEntry>, PersistenceError>;

    /// All block entries, most recently blocked first
    fn list_blocks(&self) -> Result<Vec<BlockedEntry>, PersistenceError>;
}

/// Addresses flagged by the anomaly detector
pub trait SuspiciousStore: Send + Sync {
    /// Whether an unresolved entry flagged at or after `since` exists
    fn has_unresolved_since(
        &self,
        address: &IpAddr,
        since: i64,
    ) -> Result<bool, PersistenceError>;

    /// Create a new unresolved entry
    fn flag_suspicious(
        &self,
        address: &IpAddr,
        reason: &str,
        flagged_at: i64,
    ) -> Result<SuspiciousEntry, PersistenceError>;

    /// Mark an entry as resolved. Returns false if no such entry exists.
    fn resolve_suspicious(&self, id: i64) -> Result<bool, PersistenceError>;

    /// Most recent entries, newest first
    fn recent_suspicious(
        &self,
        limit: usize,
        include_resolved: bool,
    ) -> Result<Vec<SuspiciousEntry>, PersistenceError>;
}

/// Named locks shared by every process using the same store
pub trait LockStore: Send + Sync {
    /// Take the lock `name` for `holder`
    ///
    /// Succeeds if the lock is free or was last taken before `stale_before`.
    /// Returns false while another holder has it.
    fn try_acquire_lock(
        &self,
        name: &str,
        holder: &str,
        now: i64,
        stale_before: i64,
    ) -> Result<bool, PersistenceError>;

    /// Release the lock if `holder` still owns it
    fn release_lock(&self, name: &str, holder: &str) -> Result<(), PersistenceError>;
}
