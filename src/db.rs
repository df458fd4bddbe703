//! sled-backed persistence: blocks, accounts, transaction index, producer
//! sets, peer records, and chain metadata.
//!
//! One tree per record family. Values are bincode-encoded; bincode is used
//! for local storage only, never on the wire. Logical operations mirror the
//! chain contracts: `save_block`, `get_block`, `get_account`,
//! `change_balance`, `index_transaction`.

use crate::config::Config;
use crate::types::{Account, Address, Block, PeerRecord, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;

const META_LATEST: &str = "latest";
const META_EARLIEST: &str = "earliest";
const META_PRODUCED: &str = "produced";
const META_FEES: &str = "fees";
const META_BURNED: &str = "burned";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("block {0} not found")]
    MissingBlock(String),
    #[error("chain metadata missing: {0}")]
    MissingMeta(&'static str),
    #[error("cannot change balance of {0} into negative")]
    BalanceUnderflow(Address),
    #[error("counter underflow: {0}")]
    CounterUnderflow(&'static str),
}

/// Running supply counters maintained alongside the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub produced: u64,
    pub fees: u64,
    pub burned: u64,
}

pub struct Storage {
    _db: sled::Db,
    blocks: sled::Tree,
    block_numbers: sled::Tree,
    accounts: sled::Tree,
    tx_index: sled::Tree,
    account_tx: sled::Tree,
    producers: sled::Tree,
    peers: sled::Tree,
    meta: sled::Tree,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, DbError> {
    Ok(bincode::serialize(value)?)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DbError> {
    Ok(bincode::deserialize(bytes)?)
}

impl Storage {
    pub fn open(path: &Path) -> Result<Self, DbError> {
        let db = sled::open(path)?;
        Ok(Self {
            blocks: db.open_tree("blocks")?,
            block_numbers: db.open_tree("block_numbers")?,
            accounts: db.open_tree("accounts")?,
            tx_index: db.open_tree("tx_index")?,
            account_tx: db.open_tree("account_tx")?,
            producers: db.open_tree("producers")?,
            peers: db.open_tree("peers")?,
            meta: db.open_tree("meta")?,
            _db: db,
        })
    }

    /// True once a genesis block has been written.
    pub fn is_initialized(&self) -> bool {
        matches!(self.meta.get(META_LATEST), Ok(Some(_)))
    }

    // =========================================================================
    // BLOCKS
    // =========================================================================

    pub fn save_block(&self, block: &Block) -> Result<(), DbError> {
        self.blocks
            .insert(block.block_hash.as_bytes(), encode(block)?)?;
        self.block_numbers
            .insert(block.block_number.to_be_bytes(), block.block_hash.as_bytes())?;
        Ok(())
    }

    pub fn get_block(&self, hash: &str) -> Result<Option<Block>, DbError> {
        match self.blocks.get(hash.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn require_block(&self, hash: &str) -> Result<Block, DbError> {
        self.get_block(hash)?
            .ok_or_else(|| DbError::MissingBlock(hash.to_string()))
    }

    pub fn get_block_by_number(&self, number: u64) -> Result<Option<Block>, DbError> {
        match self.block_numbers.get(number.to_be_bytes())? {
            Some(hash) => self.get_block(&String::from_utf8_lossy(&hash)),
            None => Ok(None),
        }
    }

    pub fn delete_block(&self, block: &Block) -> Result<(), DbError> {
        self.blocks.remove(block.block_hash.as_bytes())?;
        self.block_numbers
            .remove(block.block_number.to_be_bytes())?;
        Ok(())
    }

    /// Point a stored block's `child_hash` at its applied successor.
    pub fn update_child(&self, hash: &str, child: Option<String>) -> Result<(), DbError> {
        let mut block = self.require_block(hash)?;
        block.child_hash = child;
        self.blocks.insert(hash.as_bytes(), encode(&block)?)?;
        Ok(())
    }

    pub fn set_latest_hash(&self, hash: &str) -> Result<(), DbError> {
        self.meta.insert(META_LATEST, hash.as_bytes())?;
        Ok(())
    }

    pub fn set_earliest_hash(&self, hash: &str) -> Result<(), DbError> {
        self.meta.insert(META_EARLIEST, hash.as_bytes())?;
        Ok(())
    }

    pub fn latest_block(&self) -> Result<Block, DbError> {
        let hash = self
            .meta
            .get(META_LATEST)?
            .ok_or(DbError::MissingMeta(META_LATEST))?;
        self.require_block(&String::from_utf8_lossy(&hash))
    }

    pub fn earliest_block(&self) -> Result<Block, DbError> {
        let hash = self
            .meta
            .get(META_EARLIEST)?
            .ok_or(DbError::MissingMeta(META_EARLIEST))?;
        self.require_block(&String::from_utf8_lossy(&hash))
    }

    // =========================================================================
    // ACCOUNTS
    // =========================================================================

    pub fn get_account(&self, address: &str, create: bool) -> Result<Option<Account>, DbError> {
        match self.accounts.get(address.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None if create => {
                let account = Account::new(address.to_string());
                self.put_account(&account)?;
                Ok(Some(account))
            }
            None => Ok(None),
        }
    }

    pub fn put_account(&self, account: &Account) -> Result<(), DbError> {
        self.accounts
            .insert(account.address.as_bytes(), encode(account)?)?;
        Ok(())
    }

    /// Apply a signed delta to an account balance; negative results abort.
    pub fn change_balance(&self, address: &str, delta: i128) -> Result<(), DbError> {
        let mut account = self
            .get_account(address, true)?
            .expect("account created on demand");
        let next = account.balance as i128 + delta;
        if next < 0 {
            return Err(DbError::BalanceUnderflow(address.to_string()));
        }
        account.balance = next as u64;
        self.put_account(&account)
    }

    pub fn change_produced(&self, address: &str, delta: i128) -> Result<(), DbError> {
        let mut account = self
            .get_account(address, true)?
            .expect("account created on demand");
        let next = account.produced as i128 + delta;
        if next < 0 {
            return Err(DbError::CounterUnderflow("produced"));
        }
        account.produced = next as u64;
        self.put_account(&account)
    }

    pub fn change_burned(&self, address: &str, delta: i128) -> Result<(), DbError> {
        let mut account = self
            .get_account(address, true)?
            .expect("account created on demand");
        let next = account.burned as i128 + delta;
        if next < 0 {
            return Err(DbError::CounterUnderflow("burned"));
        }
        account.burned = next as u64;
        self.put_account(&account)
    }

    // =========================================================================
    // SUPPLY COUNTERS
    // =========================================================================

    fn meta_counter(&self, key: &'static str) -> Result<u64, DbError> {
        match self.meta.get(key)? {
            Some(bytes) => Ok(decode(&bytes)?),
            None => Ok(0),
        }
    }

    fn bump_counter(&self, key: &'static str, delta: i128) -> Result<(), DbError> {
        let next = self.meta_counter(key)? as i128 + delta;
        if next < 0 {
            return Err(DbError::CounterUnderflow(key));
        }
        self.meta.insert(key, encode(&(next as u64))?)?;
        Ok(())
    }

    pub fn add_totals(&self, produced: i128, fees: i128, burned: i128) -> Result<(), DbError> {
        self.bump_counter(META_PRODUCED, produced)?;
        self.bump_counter(META_FEES, fees)?;
        self.bump_counter(META_BURNED, burned)
    }

    pub fn fetch_totals(&self) -> Result<Totals, DbError> {
        Ok(Totals {
            produced: self.meta_counter(META_PRODUCED)?,
            fees: self.meta_counter(META_FEES)?,
            burned: self.meta_counter(META_BURNED)?,
        })
    }

    // =========================================================================
    // TRANSACTION INDEX
    // =========================================================================

    fn account_tx_key(address: &str, txid: &str) -> Vec<u8> {
        format!("{address}/{txid}").into_bytes()
    }

    /// Index a transaction under its block for txid and per-account lookup.
    pub fn index_transaction(
        &self,
        transaction: &Transaction,
        block_hash: &str,
        block_number: u64,
    ) -> Result<(), DbError> {
        self.tx_index
            .insert(transaction.txid.as_bytes(), block_hash.as_bytes())?;
        let pointer = encode(&(block_number, block_hash.to_string()))?;
        self.account_tx.insert(
            Self::account_tx_key(&transaction.sender, &transaction.txid),
            pointer.clone(),
        )?;
        self.account_tx.insert(
            Self::account_tx_key(&transaction.recipient, &transaction.txid),
            pointer,
        )?;
        Ok(())
    }

    pub fn unindex_transaction(&self, transaction: &Transaction) -> Result<(), DbError> {
        self.tx_index.remove(transaction.txid.as_bytes())?;
        self.account_tx
            .remove(Self::account_tx_key(&transaction.sender, &transaction.txid))?;
        self.account_tx.remove(Self::account_tx_key(
            &transaction.recipient,
            &transaction.txid,
        ))?;
        Ok(())
    }

    pub fn tx_block_hash(&self, txid: &str) -> Result<Option<String>, DbError> {
        Ok(self
            .tx_index
            .get(txid.as_bytes())?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Resolve a transaction through its block pointer.
    pub fn get_transaction(&self, txid: &str) -> Result<Option<Transaction>, DbError> {
        let Some(block_hash) = self.tx_block_hash(txid)? else {
            return Ok(None);
        };
        let Some(block) = self.get_block(&block_hash)? else {
            return Ok(None);
        };
        Ok(block
            .block_transactions
            .into_iter()
            .find(|tx| tx.txid == txid))
    }

    pub fn transactions_of_account(
        &self,
        address: &str,
        min_block: u64,
    ) -> Result<Vec<Transaction>, DbError> {
        let mut found = Vec::new();
        for entry in self.account_tx.scan_prefix(format!("{address}/").as_bytes()) {
            let (key, value) = entry?;
            let (block_number, _block_hash): (u64, String) = decode(&value)?;
            if block_number < min_block {
                continue;
            }
            let key = String::from_utf8_lossy(&key);
            let Some(txid) = key.rsplit('/').next() else {
                continue;
            };
            if let Some(tx) = self.get_transaction(txid)? {
                found.push(tx);
            }
        }
        found.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.txid.cmp(&b.txid)));
        Ok(found)
    }

    // =========================================================================
    // PRODUCER SETS
    // =========================================================================

    pub fn save_producer_set(
        &self,
        set_hash: &str,
        producers: &BTreeSet<IpAddr>,
    ) -> Result<(), DbError> {
        let listed: Vec<IpAddr> = producers.iter().copied().collect();
        self.producers
            .insert(set_hash.as_bytes(), encode(&listed)?)?;
        Ok(())
    }

    pub fn get_producer_set(&self, set_hash: &str) -> Result<Option<BTreeSet<IpAddr>>, DbError> {
        match self.producers.get(set_hash.as_bytes())? {
            Some(bytes) => {
                let listed: Vec<IpAddr> = decode(&bytes)?;
                Ok(Some(listed.into_iter().collect()))
            }
            None => Ok(None),
        }
    }

    // =========================================================================
    // PEERS
    // =========================================================================

    pub fn save_peer(&self, record: &PeerRecord, overwrite: bool) -> Result<(), DbError> {
        let key = record.ip.to_string();
        if !overwrite && self.peers.contains_key(key.as_bytes())? {
            return Ok(());
        }
        self.peers.insert(key.as_bytes(), encode(record)?)?;
        Ok(())
    }

    pub fn get_peer(&self, ip: IpAddr) -> Result<Option<PeerRecord>, DbError> {
        match self.peers.get(ip.to_string().as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn ip_stored(&self, ip: IpAddr) -> Result<bool, DbError> {
        Ok(self.peers.contains_key(ip.to_string().as_bytes())?)
    }

    pub fn peer_trust(&self, ip: IpAddr, default: i64) -> Result<i64, DbError> {
        Ok(self.get_peer(ip)?.map(|p| p.trust).unwrap_or(default))
    }

    pub fn set_peer_trust(&self, ip: IpAddr, trust: i64) -> Result<(), DbError> {
        if let Some(mut record) = self.get_peer(ip)? {
            record.trust = trust;
            self.save_peer(&record, true)?;
        }
        Ok(())
    }

    pub fn remove_peer(&self, ip: IpAddr) -> Result<(), DbError> {
        self.peers.remove(ip.to_string().as_bytes())?;
        Ok(())
    }

    pub fn all_peers(&self) -> Result<Vec<PeerRecord>, DbError> {
        let mut records = Vec::new();
        for entry in self.peers.iter() {
            let (_, value) = entry?;
            records.push(decode(&value)?);
        }
        Ok(records)
    }

    // =========================================================================
    // GENESIS
    // =========================================================================

    /// First-launch bootstrap: mint the reserve account and write the
    /// genesis block.
    pub fn init_genesis(&self, config: &Config) -> Result<Block, DbError> {
        let account = Account {
            address: config.genesis_address.clone(),
            balance: config.genesis_balance,
            produced: 0,
            burned: 0,
        };
        self.put_account(&account)?;

        let producers: BTreeSet<IpAddr> = [config.genesis_ip].into_iter().collect();
        let producers_hash = crate::chain::producer_set_hash(&producers);
        self.save_producer_set(&producers_hash, &producers)?;

        let genesis = crate::chain::construct_block(
            0,
            config.genesis_timestamp,
            "0".repeat(64),
            config.genesis_ip,
            config.genesis_address.clone(),
            Vec::new(),
            producers_hash,
            0,
            0,
        );

        self.save_block(&genesis)?;
        self.set_latest_hash(&genesis.block_hash)?;
        self.set_earliest_hash(&genesis.block_hash)?;
        Ok(genesis)
    }
}
