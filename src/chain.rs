// Thin re-export module: implementation is split across block structure
// (`block`), production/verification/apply (`producer`), and the genesis
// bootstrap (`genesis`).

pub mod block;
pub mod genesis;
pub mod producer;

pub use block::*;
pub use producer::{apply_block, produce_block, verify_block, ApplyOutcome};
