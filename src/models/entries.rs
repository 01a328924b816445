use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// An address on the block list. Created by block management only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedEntry {
    pub address: IpAddr,
    pub reason: Option<String>,
    pub blocked_at: i64,
}

/// An address flagged by the anomaly detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspiciousEntry {
    pub id: i64,
    pub address: IpAddr,
    pub reason: String,
    pub flagged_at: i64,
    /// Set by an operator once the flag has been reviewed
    pub resolved: bool,
}
