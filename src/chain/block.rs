//! Block structure, hashing, and signing
//!
//! Blocks are content-addressed by the SHA-512 hash of the canonical header
//! and chained through `prev_hash`. The proposer signs the canonical form of
//! `{header, transactions, proposer_id}`.

use crate::crypto::{canonical, canonical_hash, KeyPair};
use crate::error::StorageError;
use crate::transaction::types::Transaction;
use serde::{Deserialize, Serialize};
use std::fmt;

/// `prev_hash` of the first block.
pub const GENESIS_PREV_HASH: &str = "";

/// Proposer id recorded on the genesis block.
pub const GENESIS_PROPOSER: &str = "genesis";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    pub prev_hash: String,
    pub timestamp: u64,
}

impl BlockHeader {
    /// The block's content address: `hash(canonical(header))`.
    pub fn hash(&self) -> Result<String, serde_json::Error> {
        canonical_hash(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
    pub proposer_id: String,
    pub signature: String,
}

/// The signed portion of a block, in canonical field order.
#[derive(Serialize)]
struct SigningPayload<'a> {
    header: &'a BlockHeader,
    transactions: &'a [Transaction],
    proposer_id: &'a str,
}

impl Block {
    pub fn hash(&self) -> Result<String, serde_json::Error> {
        self.header.hash()
    }

    fn signing_bytes(
        header: &BlockHeader,
        transactions: &[Transaction],
        proposer_id: &str,
    ) -> Result<String, serde_json::Error> {
        canonical(&SigningPayload {
            header,
            transactions,
            proposer_id,
        })
    }

    /// Assembles and signs a block with the proposer's key.
    pub fn sign(
        header: BlockHeader,
        transactions: Vec<Transaction>,
        proposer_id: String,
        keypair: &KeyPair,
    ) -> Result<Self, serde_json::Error> {
        let message = Self::signing_bytes(&header, &transactions, &proposer_id)?;
        let signature = keypair.sign(message.as_bytes());
        Ok(Block {
            header,
            transactions,
            proposer_id,
            signature,
        })
    }

    /// Verifies the proposer signature against the given wire-form key.
    pub fn verify_signature(&self, public_key: &str) -> bool {
        let Ok(message) =
            Self::signing_bytes(&self.header, &self.transactions, &self.proposer_id)
        else {
            return false;
        };
        crate::crypto::verify(public_key, &self.signature, message.as_bytes())
    }
}

/// Failures in the block pipeline: production, verification, linkage.
#[derive(Debug, Clone)]
pub enum BlockError {
    /// The producer refuses to build an empty block.
    EmptyMempool,
    UnknownProposer(String),
    InvalidSignature(String),
    InvalidHeight { expected: u64, got: u64 },
    InvalidLinkage { expected: String, got: String },
    Malformed(String),
    Storage(StorageError),
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockError::EmptyMempool => write!(f, "refusing to produce an empty block"),
            BlockError::UnknownProposer(id) => write!(f, "unknown proposer: {}", id),
            BlockError::InvalidSignature(id) => {
                write!(f, "invalid block signature from {}", id)
            }
            BlockError::InvalidHeight { expected, got } => {
                write!(f, "invalid block height: expected {}, got {}", expected, got)
            }
            BlockError::InvalidLinkage { expected, got } => {
                write!(f, "invalid prev_hash: expected {}, got {}", expected, got)
            }
            BlockError::Malformed(msg) => write!(f, "malformed block: {}", msg),
            BlockError::Storage(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for BlockError {}

impl From<StorageError> for BlockError {
    fn from(err: StorageError) -> Self {
        BlockError::Storage(err)
    }
}

impl From<serde_json::Error> for BlockError {
    fn from(err: serde_json::Error) -> Self {
        BlockError::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> BlockHeader {
        BlockHeader {
            height: 2,
            prev_hash: "prevhash".into(),
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_header_hash_is_stable() {
        let a = header().hash().unwrap();
        let b = header().hash().unwrap();
        assert_eq!(a, b);

        let mut changed = header();
        changed.timestamp += 1;
        assert_ne!(a, changed.hash().unwrap());
    }

    #[test]
    fn test_sign_then_verify() {
        let keypair = KeyPair::generate();
        let block = Block::sign(header(), vec![], "node1".into(), &keypair).unwrap();
        assert!(block.verify_signature(&keypair.public_key()));
        assert!(!block.verify_signature(&KeyPair::generate().public_key()));
    }

    #[test]
    fn test_signature_covers_proposer_id() {
        let keypair = KeyPair::generate();
        let mut block = Block::sign(header(), vec![], "node1".into(), &keypair).unwrap();
        block.proposer_id = "node2".into();
        assert!(!block.verify_signature(&keypair.public_key()));
    }

    #[test]
    fn test_block_hash_ignores_transactions() {
        // The content address covers the header only; transaction integrity
        // is enforced by the proposer signature.
        let keypair = KeyPair::generate();
        let a = Block::sign(header(), vec![], "node1".into(), &keypair).unwrap();
        assert_eq!(a.hash().unwrap(), header().hash().unwrap());
    }
}
