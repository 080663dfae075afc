// Thin re-export module: message types in `types`, the round state machine
// in `engine`.

pub mod engine;
pub mod types;

pub use engine::{ConsensusConfig, ConsensusEngine, Transport};
pub use types::*;
