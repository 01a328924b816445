//! SQLite implementation of the request, block and suspicious stores

use super::{
    AddressCount, BlockStore, LockStore, PersistenceError, RequestLogStore, SuspiciousStore,
};
use crate::models::{BlockedEntry, RequestRecord, SuspiciousEntry};
use rusqlite::{params, Connection, OptionalExtension};
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// How long a write waits for another process holding the database lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-based storage
///
/// All three stores share one connection guarded by a mutex, so every
/// operation is serialised at the connection level.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at the specified path
    ///
    /// Creates the database file and initializes the schema if it doesn't exist.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, PersistenceError> {
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Create an in-memory SQLite database (useful for testing)
    pub fn in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), PersistenceError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("schema.sql"))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, PersistenceError> {
        self.conn.lock().map_err(|_| PersistenceError::LockPoisoned)
    }

    /// Helper to parse IP address from database string
    fn parse_ip(ip_str: &str) -> Result<IpAddr, PersistenceError> {
        IpAddr::from_str(ip_str)
            .map_err(|_| PersistenceError::InvalidData(format!("Invalid IP address: {}", ip_str)))
    }

    fn to_counts(rows: Vec<(String, i64)>) -> Result<Vec<AddressCount>, PersistenceError> {
        rows.into_iter()
            .map(|(ip_str, count)| {
                Ok(AddressCount {
                    address: Self::parse_ip(&ip_str)?,
                    count: usize::try_from(count).unwrap_or(0),
                })
            })
            .collect()
    }

    fn sql_count(value: usize) -> i64 {
        i64::try_from(value).unwrap_or(i64::MAX)
    }
}

impl RequestLogStore for SqliteStore {
    fn append_request(&self, record: &RequestRecord) -> Result<(), PersistenceError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO requests (address, timestamp, path, country, city)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.address.to_string(),
                record.timestamp,
                record.path,
                record.country,
                record.city
            ],
        )?;
        Ok(())
    }

    fn recent_requests(
        &self,
        address: &IpAddr,
        limit: usize,
    ) -> Result<Vec<RequestRecord>, PersistenceError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, path, country, city FROM requests
             WHERE address = ?1
             ORDER BY timestamp DESC, id DESC
             LIMIT ?2",
        )?;

        let records = stmt
            .query_map(params![address.to_string(), Self::sql_count(limit)], |row| {
                Ok(RequestRecord {
                    address: *address,
                    timestamp: row.get(0)?,
                    path: row.get(1)?,
                    country: row.get(2)?,
                    city: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn request_counts_since(
        &self,
        since: i64,
        more_than: usize,
    ) -> Result<Vec<AddressCount>, PersistenceError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT address, COUNT(*) AS request_count FROM requests
             WHERE timestamp >= ?1
             GROUP BY address
             HAVING request_count > ?2
             ORDER BY request_count DESC, address ASC",
        )?;

        let rows = stmt
            .query_map(params![since, Self::sql_count(more_than)], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<Result<Vec<(String, i64)>, _>>()?;

        Self::to_counts(rows)
    }

    fn path_match_counts_since(
        &self,
        since: i64,
        pattern: &str,
        more_than: usize,
    ) -> Result<Vec<AddressCount>, PersistenceError> {
        let conn = self.conn()?;
        // instr() avoids LIKE wildcard interpretation of '%' and '_' in patterns
        let mut stmt = conn.prepare(
            "SELECT address, COUNT(*) AS access_count FROM requests
             WHERE timestamp >= ?1 AND instr(lower(path), ?2) > 0
             GROUP BY address
             HAVING access_count > ?3
             ORDER BY access_count DESC, address ASC",
        )?;

        let rows = stmt
            .query_map(
                params![since, pattern.to_lowercase(), Self::sql_count(more_than)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?
            .collect::<Result<Vec<(String, i64)>, _>>()?;

        Self::to_counts(rows)
    }

    fn prune_requests_before(&self, before: i64) -> Result<usize, PersistenceError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM requests WHERE timestamp < ?1", params![before])?;
        Ok(deleted)
    }
}

impl BlockStore for SqliteStore {
    fn is_blocked(&self, address: &IpAddr) -> Result<bool, PersistenceError> {
        let conn = self.conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM blocked WHERE address = ?1)",
            params![address.to_string()],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn add_block(
        &self,
        address: &IpAddr,
        reason: Option<&str>,
        blocked_at: i64,
    ) -> Result<bool, PersistenceError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO blocked (address, reason, blocked_at) VALUES (?1, ?2, ?3)",
            params![address.to_string(), reason, blocked_at],
        )?;
        Ok(inserted == 1)
    }

    fn get_block(&self, address: &IpAddr) -> Result<Option<BlockedEntry>, PersistenceError> {
        let conn = self.conn()?;
        let entry = conn
            .query_row(
                "SELECT reason, blocked_at FROM blocked WHERE address = ?1",
                params![address.to_string()],
                |row| {
                    Ok(BlockedEntry {
                        address: *address,
                        reason: row.get(0)?,
                        blocked_at: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(entry)
    }

    fn list_blocks(&self) -> Result<Vec<BlockedEntry>, PersistenceError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT address, reason, blocked_at FROM blocked ORDER BY blocked_at DESC, address ASC",
        )?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(ip_str, reason, blocked_at)| {
                Ok(BlockedEntry {
                    address: Self::parse_ip(&ip_str)?,
                    reason,
                    blocked_at,
                })
            })
            .collect()
    }
}

impl SuspiciousStore for SqliteStore {
    fn has_unresolved_since(
        &self,
        address: &IpAddr,
        since: i64,
    ) -> Result<bool, PersistenceError> {
        let conn = self.conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM suspicious
                WHERE address = ?1 AND flagged_at >= ?2 AND resolved = 0
             )",
            params![address.to_string(), since],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn flag_suspicious(
        &self,
        address: &IpAddr,
        reason: &str,
        flagged_at: i64,
    ) -> Result<SuspiciousEntry, PersistenceError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO suspicious (address, reason, flagged_at, resolved) VALUES (?1, ?2, ?3, 0)",
            params![address.to_string(), reason, flagged_at],
        )?;

        Ok(SuspiciousEntry {
            id: conn.last_insert_rowid(),
            address: *address,
            reason: reason.to_string(),
            flagged_at,
            resolved: false,
        })
    }

    fn resolve_suspicious(&self, id: i64) -> Result<bool, PersistenceError> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE suspicious SET resolved = 1 WHERE id = ?1",
            params![id],
        )?;
        Ok(updated > 0)
    }

    fn recent_suspicious(
        &self,
        limit: usize,
        include_resolved: bool,
    ) -> Result<Vec<SuspiciousEntry>, PersistenceError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, address, reason, flagged_at, resolved FROM suspicious
             WHERE ?1 OR resolved = 0
             ORDER BY flagged_at DESC, id DESC
             LIMIT ?2",
        )?;

        let rows = stmt
            .query_map(params![include_resolved, Self::sql_count(limit)], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, bool>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, ip_str, reason, flagged_at, resolved)| {
                Ok(SuspiciousEntry {
                    id,
                    address: Self::parse_ip(&ip_str)?,
                    reason,
                    flagged_at,
                    resolved,
                })
            })
            .collect()
    }
}

impl LockStore for SqliteStore {
    fn try_acquire_lock(
        &self,
        name: &str,
        holder: &str,
        now: i64,
        stale_before: i64,
    ) -> Result<bool, PersistenceError> {
        let conn = self.conn()?;
        // Single statement, so the check and the take are atomic across processes
        let changed = conn.execute(
            "INSERT INTO locks (name, holder, acquired_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE
                SET holder = excluded.holder, acquired_at = excluded.acquired_at
                WHERE locks.acquired_at < ?4",
            params![name, holder, now, stale_before],
        )?;
        Ok(changed == 1)
    }

    fn release_lock(&self, name: &str, holder: &str) -> Result<(), PersistenceError> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM locks WHERE name = ?1 AND holder = ?2",
            params![name, holder],
        )?;
        Ok(())
    }
}
