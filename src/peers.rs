//! Peer trust bookkeeping.
//!
//! Every peer carries a signed trust score. The consensus loop weighs
//! opinions by it, the core loop adjusts it on observed misbehavior, and
//! the peer loop persists it back to the peer records. Scores saturate
//! into configured bounds.

use crate::db::Storage;
use crate::types::PeerRecord;
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use tracing::info;

// =============================================================================
// TRUST DELTAS
// =============================================================================

/// Peer served a suggested pool we could not use.
pub const DELTA_BAD_SUGGESTION: i64 = -2_500;
/// Peer served a producer set that omitted our own ip.
pub const DELTA_PRODUCERS_OMIT_SELF: i64 = -2_500;
/// Remote block arrived with an invalid block gap.
pub const DELTA_BAD_GAP: i64 = -25;
/// A transaction inside a remote block failed validation.
pub const DELTA_BAD_TRANSACTION: i64 = -25;
/// Pool-wide spending validation failed on a remote block.
pub const DELTA_OVERSPEND: i64 = -100;
/// Peer claimed to know a block but returned no successors.
pub const DELTA_NO_SUCCESSOR: i64 = -10_000;
/// Peer disagreed with a rollback we then performed.
pub const DELTA_ROLLBACK_DISAGREE: i64 = -100_000;

/// Consecutive failed probes before a peer is pruned from the peer set.
pub const UNREACHABLE_LIMIT: u32 = 3;

// =============================================================================
// TRUST BOOK
// =============================================================================

/// In-memory trust scores, loaded from the peer records and flushed back
/// by the peer loop.
#[derive(Debug, Clone)]
pub struct TrustBook {
    scores: HashMap<IpAddr, i64>,
    default: i64,
    min: i64,
    max: i64,
}

impl TrustBook {
    pub fn new(default: i64, min: i64, max: i64) -> Self {
        Self {
            scores: HashMap::new(),
            default,
            min,
            max,
        }
    }

    /// Seed scores from the persistent peer records.
    pub fn load(&mut self, storage: &Storage) {
        if let Ok(records) = storage.all_peers() {
            for record in records {
                self.scores.insert(record.ip, record.trust);
            }
        }
    }

    pub fn get(&self, ip: IpAddr) -> i64 {
        self.scores.get(&ip).copied().unwrap_or(self.default)
    }

    pub fn set(&mut self, ip: IpAddr, trust: i64) {
        self.scores.insert(ip, trust.clamp(self.min, self.max));
    }

    /// Apply a signed delta, saturating into the configured bounds.
    pub fn adjust(&mut self, ip: IpAddr, delta: i64) {
        let next = self.get(ip).saturating_add(delta).clamp(self.min, self.max);
        info!("Trust of {ip} adjusted by {delta} to {next}");
        self.scores.insert(ip, next);
    }

    pub fn remove(&mut self, ip: IpAddr) {
        self.scores.remove(&ip);
    }

    /// Mean trust across the given participants.
    pub fn average_over<'a>(&self, participants: impl Iterator<Item = &'a IpAddr>) -> i64 {
        let mut sum: i64 = 0;
        let mut count: i64 = 0;
        for ip in participants {
            sum = sum.saturating_add(self.get(*ip));
            count += 1;
        }
        if count == 0 {
            0
        } else {
            sum / count
        }
    }

    /// Snapshot for the `/trust_pool` endpoint.
    pub fn snapshot(&self) -> BTreeMap<String, i64> {
        self.scores
            .iter()
            .map(|(ip, trust)| (ip.to_string(), *trust))
            .collect()
    }

    /// Flush adjusted scores back into the peer records.
    pub fn persist(&self, storage: &Storage) {
        for (ip, trust) in &self.scores {
            let _ = storage.set_peer_trust(*ip, *trust);
        }
    }
}

/// Register a newly discovered peer, keeping an existing record's trust.
pub fn save_new_peer(
    storage: &Storage,
    ip: IpAddr,
    address: String,
    trust: i64,
    overwrite: bool,
) -> Result<(), crate::db::DbError> {
    let record = PeerRecord { ip, address, trust };
    storage.save_peer(&record, overwrite)
}
