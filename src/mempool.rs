//! Transaction mempool for Miniroha
//!
//! Pending validated transactions keyed by hash, held in a stable
//! ascending-nonce order (insertion order breaks ties). The pool offers
//! transactions to the block producer without removing them; removal happens
//! only after durable commit, or through capacity and age eviction.

use crate::transaction::types::Transaction;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Default capacity bound.
pub const DEFAULT_MAX_SIZE: usize = 10_000;

/// Rejection reasons on insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MempoolError {
    /// A transaction with this hash is already pending.
    DuplicateHash(String),
    /// A pending transaction from the same signer carries the same nonce.
    NonceConflict { signer_id: String, nonce: u64 },
}

impl fmt::Display for MempoolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MempoolError::DuplicateHash(hash) => {
                write!(f, "transaction {} already in mempool", hash)
            }
            MempoolError::NonceConflict { signer_id, nonce } => {
                write!(f, "pending transaction from {} with nonce {}", signer_id, nonce)
            }
        }
    }
}

impl std::error::Error for MempoolError {}

#[derive(Debug, Clone)]
struct PoolEntry {
    tx: Transaction,
    hash: String,
    bytes: usize,
    /// Monotonic insertion counter, the tie-breaker within a nonce.
    seq: u64,
}

/// Bounded, nonce-ordered transaction pool.
#[derive(Debug, Clone)]
pub struct Mempool {
    /// Entries sorted by `(nonce, seq)`.
    entries: Vec<PoolEntry>,
    by_hash: HashSet<String>,
    by_signer_nonce: HashMap<(String, u64), String>,
    max_size: usize,
    next_seq: u64,
}

impl Mempool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_SIZE)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Mempool {
            entries: Vec::new(),
            by_hash: HashSet::new(),
            by_signer_nonce: HashMap::new(),
            max_size: max_size.max(1),
            next_seq: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.by_hash.contains(hash)
    }

    pub fn get(&self, hash: &str) -> Option<&Transaction> {
        self.entries.iter().find(|e| e.hash == hash).map(|e| &e.tx)
    }

    /// All pending transactions in offer order.
    pub fn transactions(&self) -> Vec<Transaction> {
        self.entries.iter().map(|e| e.tx.clone()).collect()
    }

    /// Inserts a validated transaction. At capacity the oldest entry (front
    /// of the ordered sequence) is evicted to make room. Returns the
    /// transaction hash.
    pub fn add(&mut self, tx: Transaction) -> Result<String, MempoolError> {
        let hash = match tx.hash() {
            Ok(hash) => hash,
            Err(e) => return Err(MempoolError::DuplicateHash(format!("unhashable: {}", e))),
        };
        if self.by_hash.contains(&hash) {
            return Err(MempoolError::DuplicateHash(hash));
        }
        let signer_nonce = (tx.body.signer_id.clone(), tx.body.nonce);
        if self.by_signer_nonce.contains_key(&signer_nonce) {
            return Err(MempoolError::NonceConflict {
                signer_id: signer_nonce.0,
                nonce: signer_nonce.1,
            });
        }

        if self.entries.len() >= self.max_size {
            let evicted = self.entries.remove(0);
            self.forget(&evicted);
        }

        let entry = PoolEntry {
            bytes: tx.byte_len(),
            hash: hash.clone(),
            seq: self.next_seq,
            tx,
        };
        self.next_seq += 1;

        // Stable position: after every entry with nonce <= ours.
        let nonce = entry.tx.body.nonce;
        let pos = self
            .entries
            .partition_point(|e| e.tx.body.nonce <= nonce);
        self.by_hash.insert(hash.clone());
        self.by_signer_nonce
            .insert((entry.tx.body.signer_id.clone(), nonce), hash.clone());
        self.entries.insert(pos, entry);
        Ok(hash)
    }

    /// A prefix of the ordered sequence bounded by count and total bytes.
    /// Entries are not removed; call [`Mempool::remove_committed`] once the
    /// block is durable.
    pub fn take_for_block(&self, max_count: usize, max_bytes: usize) -> Vec<Transaction> {
        let mut out = Vec::new();
        let mut total = 0usize;
        for entry in &self.entries {
            if out.len() >= max_count {
                break;
            }
            if total + entry.bytes > max_bytes && !out.is_empty() {
                break;
            }
            if entry.bytes > max_bytes {
                break;
            }
            total += entry.bytes;
            out.push(entry.tx.clone());
        }
        out
    }

    /// Drops entries whose hashes were committed in a block.
    pub fn remove_committed(&mut self, hashes: &[String]) {
        let committed: HashSet<&str> = hashes.iter().map(String::as_str).collect();
        let removed: Vec<PoolEntry> = self
            .entries
            .iter()
            .filter(|e| committed.contains(e.hash.as_str()))
            .cloned()
            .collect();
        self.entries.retain(|e| !committed.contains(e.hash.as_str()));
        for entry in &removed {
            self.forget(entry);
        }
    }

    /// Evicts entries whose `created_at` is older than `now_ms - age_ms`.
    /// Returns the number removed.
    pub fn evict_older_than(&mut self, age_ms: u64, now_ms: u64) -> usize {
        let cutoff = now_ms.saturating_sub(age_ms);
        let stale: Vec<PoolEntry> = self
            .entries
            .iter()
            .filter(|e| e.tx.body.created_at < cutoff)
            .cloned()
            .collect();
        self.entries.retain(|e| e.tx.body.created_at >= cutoff);
        for entry in &stale {
            self.forget(entry);
        }
        stale.len()
    }

    fn forget(&mut self, entry: &PoolEntry) {
        self.by_hash.remove(&entry.hash);
        self.by_signer_nonce
            .remove(&(entry.tx.body.signer_id.clone(), entry.tx.body.nonce));
    }
}

impl Default for Mempool {
    fn default() -> Self {
        Self::new()
    }
}
