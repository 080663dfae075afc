//! Block production, verification, and atomic apply
//!
//! The producer assembles and signs a block from mempool contents; the
//! verifier checks proposer signature and chain linkage; the applier
//! re-executes every transaction and commits all effects in one batch.

use crate::chain::block::{Block, BlockError, BlockHeader, GENESIS_PREV_HASH};
use crate::crypto::KeyPair;
use crate::error::{StorageError, StorageResult};
use crate::mempool::Mempool;
use crate::state::{execute_instruction, keys, ExecError, StateStore, WorkingState};
use tracing::{debug, warn};

/// Builds and signs the next block from the mempool's offered prefix.
///
/// Refuses with [`BlockError::EmptyMempool`] when nothing is pending; a
/// proposer that cannot produce votes nil instead.
pub fn produce_block(
    state: &StateStore,
    mempool: &Mempool,
    proposer_id: &str,
    keypair: &KeyPair,
    max_tx: usize,
    max_bytes: usize,
    now_ms: u64,
) -> Result<Block, BlockError> {
    let transactions = mempool.take_for_block(max_tx, max_bytes);
    if transactions.is_empty() {
        return Err(BlockError::EmptyMempool);
    }

    let last_height = state.last_height()?;
    let prev_hash = if last_height == 0 {
        GENESIS_PREV_HASH.to_string()
    } else {
        let last_block = state
            .get_block(last_height)?
            .ok_or_else(|| BlockError::Malformed(format!("missing block {}", last_height)))?;
        last_block.hash()?
    };

    let header = BlockHeader {
        height: last_height + 1,
        prev_hash,
        timestamp: now_ms,
    };
    Ok(Block::sign(
        header,
        transactions,
        proposer_id.to_string(),
        keypair,
    )?)
}

/// Verifies a block received from a proposer: height continuity, linkage to
/// the stored predecessor, and the proposer signature against the registered
/// validator key.
///
/// Transactions are not re-validated here; they were validated on mempool
/// admission and are re-executed on apply.
pub fn verify_block(state: &StateStore, block: &Block) -> Result<(), BlockError> {
    let last_height = state.last_height()?;
    if block.header.height != last_height + 1 {
        return Err(BlockError::InvalidHeight {
            expected: last_height + 1,
            got: block.header.height,
        });
    }

    let expected_prev = if last_height == 0 {
        GENESIS_PREV_HASH.to_string()
    } else {
        state
            .get_block(last_height)?
            .ok_or_else(|| BlockError::Malformed(format!("missing block {}", last_height)))?
            .hash()?
    };
    if block.header.prev_hash != expected_prev {
        return Err(BlockError::InvalidLinkage {
            expected: expected_prev,
            got: block.header.prev_hash.clone(),
        });
    }

    if block.header.timestamp == 0 {
        return Err(BlockError::Malformed("zero timestamp".into()));
    }

    let validator = state
        .get_validator(&block.proposer_id)?
        .ok_or_else(|| BlockError::UnknownProposer(block.proposer_id.clone()))?;
    if !block.verify_signature(&validator.public_key) {
        return Err(BlockError::InvalidSignature(block.proposer_id.clone()));
    }
    Ok(())
}

/// Result of a committed block apply.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub height: u64,
    pub block_hash: String,
    /// Hashes of transactions whose effects were committed.
    pub applied: Vec<String>,
    /// Transactions dropped because an instruction failed at apply time.
    pub dropped: usize,
}

/// Re-executes the block's transactions in order and commits every effect,
/// the transaction records, nonce updates, the block itself, and
/// `last_height` as one atomic batch.
///
/// A transaction whose instruction list fails mid-way is rolled back
/// in-memory and dropped; the rest of the block still applies. Only a
/// backing-store failure aborts the whole apply, and then nothing is
/// committed.
pub fn apply_block(state: &StateStore, block: &Block) -> StorageResult<ApplyOutcome> {
    let mut ws = WorkingState::new(state, block.header.timestamp);
    let mut applied = Vec::new();
    let mut dropped = 0usize;

    for tx in &block.transactions {
        let tx_hash = tx.hash().map_err(StorageError::from)?;
        let savepoint = ws.savepoint();
        let mut failure = None;

        for instruction in &tx.body.instructions {
            match execute_instruction(&mut ws, instruction) {
                Ok(()) => {}
                Err(ExecError::State(err)) => {
                    failure = Some(err);
                    break;
                }
                Err(ExecError::Storage(err)) => return Err(err),
            }
        }

        match failure {
            Some(err) => {
                // State moved since admission; drop just this transaction.
                ws.rollback_to(savepoint);
                dropped += 1;
                warn!(tx_hash = %tx_hash, error = %err, "transaction dropped at apply");
            }
            None => {
                ws.put(keys::transaction(&tx_hash), tx)?;
                let signer = &tx.body.signer_id;
                if tx.body.nonce > ws.last_seen_nonce(signer)? {
                    ws.put(keys::nonce(signer), &tx.body.nonce)?;
                }
                applied.push(tx_hash);
            }
        }
    }

    let height = block.header.height;
    let block_hash = block.hash().map_err(StorageError::from)?;
    ws.put(keys::block(height), block)?;
    ws.put(keys::block_by_hash(&block_hash), &height)?;
    ws.put(keys::LAST_HEIGHT.to_string(), &height)?;

    state.kv().apply(ws.into_batch())?;
    debug!(height, applied = applied.len(), dropped, "block committed");

    Ok(ApplyOutcome {
        height,
        block_hash,
        applied,
        dropped,
    })
}
