//! Insertion-ordered transaction pools keyed by txid.
//!
//! The pools behave as ordered sets: iteration follows insertion order,
//! membership and removal are O(1) on the txid index. All three pools
//! (`user_tx_buffer`, `tx_buffer`, `transaction_pool`) share this type.

use crate::types::{Transaction, Txid};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxPool {
    inner: IndexMap<Txid, Transaction>,
}

impl TxPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a transaction; duplicates by txid are rejected.
    pub fn insert(&mut self, transaction: Transaction) -> bool {
        if self.inner.contains_key(&transaction.txid) {
            return false;
        }
        self.inner.insert(transaction.txid.clone(), transaction);
        true
    }

    /// Remove by txid, preserving the order of the remaining entries.
    pub fn remove(&mut self, txid: &str) -> Option<Transaction> {
        self.inner.shift_remove(txid)
    }

    pub fn contains(&self, txid: &str) -> bool {
        self.inner.contains_key(txid)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.inner.values()
    }

    /// Entries in insertion order.
    pub fn to_vec(&self) -> Vec<Transaction> {
        self.inner.values().cloned().collect()
    }

    /// Entries in canonical pool order (stable by txid).
    pub fn sorted(&self) -> Vec<Transaction> {
        let mut entries = self.to_vec();
        entries.sort_by(|a, b| a.txid.cmp(&b.txid));
        entries
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Rebuild a pool from a suggested snapshot, dropping txid duplicates.
    pub fn from_entries(entries: Vec<Transaction>) -> Self {
        let mut pool = Self::new();
        for tx in entries {
            pool.insert(tx);
        }
        pool
    }
}

/// Move entries from `from` into `to` in insertion order until `from`
/// empties or `to` reaches `limit`. Duplicates by txid are dropped.
/// Survivors stay in `from` for the next period.
pub fn merge_buffer(from: &mut TxPool, to: &mut TxPool, limit: usize) {
    while to.len() < limit {
        let Some(txid) = from.iter().next().map(|tx| tx.txid.clone()) else {
            break;
        };
        let transaction = from.remove(&txid).expect("front entry exists");
        to.insert(transaction);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tx(txid: &str) -> Transaction {
        Transaction {
            sender: "ndo_sender".into(),
            recipient: "ndo_recipient".into(),
            amount: 1,
            timestamp: 0,
            data: json!(""),
            nonce: "00".into(),
            fee: 0,
            public_key: String::new(),
            txid: txid.into(),
            signature: String::new(),
        }
    }

    #[test]
    fn test_insert_preserves_order_and_dedupes() {
        let mut pool = TxPool::new();
        assert!(pool.insert(tx("c")));
        assert!(pool.insert(tx("a")));
        assert!(!pool.insert(tx("c")));

        let order: Vec<String> = pool.iter().map(|t| t.txid.clone()).collect();
        assert_eq!(order, vec!["c", "a"]);
        assert_eq!(pool.sorted()[0].txid, "a");
    }

    #[test]
    fn test_merge_respects_limit() {
        let mut from = TxPool::from_entries(vec![tx("a"), tx("b"), tx("c")]);
        let mut to = TxPool::new();

        merge_buffer(&mut from, &mut to, 2);
        assert_eq!(to.len(), 2);
        assert_eq!(from.len(), 1);
        assert!(to.contains("a") && to.contains("b"));
        assert!(from.contains("c"));

        merge_buffer(&mut from, &mut to, 10);
        assert!(from.is_empty());
        assert_eq!(to.len(), 3);
    }

    #[test]
    fn test_merge_drops_duplicates() {
        let mut from = TxPool::from_entries(vec![tx("a"), tx("b")]);
        let mut to = TxPool::from_entries(vec![tx("a")]);

        merge_buffer(&mut from, &mut to, 10);
        assert_eq!(to.len(), 2);
        assert!(from.is_empty());
    }
}
