//! Configuration management for Miniroha
//!
//! All settings come from the environment; every variable has a default so a
//! bare `miniroha-node` starts a single-node dev chain.

use crate::consensus::ConsensusConfig;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// `PORT`: HTTP listen port.
    pub port: u16,
    /// `DB_PATH`: SQLite database path.
    pub db_path: String,
    /// `USE_BFT`: `true` runs the consensus engine; anything else runs the
    /// timer-driven single-node producer.
    pub use_bft: bool,
    /// `GENESIS_PATH`: genesis config consumed on first start.
    pub genesis_path: String,
    /// `NODE_ID`: this validator's id; required with `USE_BFT=true`.
    pub node_id: Option<String>,
    /// `PRIVATE_KEY`: base58 keypair bytes; required with `USE_BFT=true`.
    pub private_key: Option<String>,
    /// `PEERS`: comma-separated peer base URLs for consensus fan-out.
    pub peers: Vec<String>,
    pub propose_timeout: Duration,
    pub prevote_timeout: Duration,
    pub precommit_timeout: Duration,
    pub block_interval: Duration,
    /// `MEMPOOL_MAX`: mempool capacity.
    pub mempool_max: usize,
    /// `MEMPOOL_TTL_MS`: age after which pending transactions are swept.
    pub mempool_ttl: Duration,
    pub max_block_txs: usize,
    pub max_block_bytes: usize,
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(key, default_ms))
}

impl Config {
    pub fn from_env() -> Self {
        Config {
            port: env_parse("PORT", 3000),
            db_path: env_string("DB_PATH", "./miniroha-db"),
            use_bft: env_string("USE_BFT", "false") == "true",
            genesis_path: env_string("GENESIS_PATH", "./genesis.json"),
            node_id: env::var("NODE_ID").ok().filter(|v| !v.is_empty()),
            private_key: env::var("PRIVATE_KEY").ok().filter(|v| !v.is_empty()),
            peers: env::var("PEERS")
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            propose_timeout: env_millis("PROPOSE_TIMEOUT_MS", 3_000),
            prevote_timeout: env_millis("PREVOTE_TIMEOUT_MS", 2_000),
            precommit_timeout: env_millis("PRECOMMIT_TIMEOUT_MS", 2_000),
            block_interval: env_millis("BLOCK_INTERVAL_MS", 10_000),
            mempool_max: env_parse("MEMPOOL_MAX", 10_000),
            mempool_ttl: env_millis("MEMPOOL_TTL_MS", 3_600_000),
            max_block_txs: env_parse("MAX_BLOCK_TXS", 100),
            max_block_bytes: env_parse("MAX_BLOCK_BYTES", 1 << 20),
        }
    }

    pub fn consensus(&self) -> ConsensusConfig {
        ConsensusConfig {
            propose_timeout: self.propose_timeout,
            prevote_timeout: self.prevote_timeout,
            precommit_timeout: self.precommit_timeout,
            block_interval: self.block_interval,
            max_block_txs: self.max_block_txs,
            max_block_bytes: self.max_block_bytes,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        // Defaults only; does not consult the environment.
        Config {
            port: 3000,
            db_path: "./miniroha-db".into(),
            use_bft: false,
            genesis_path: "./genesis.json".into(),
            node_id: None,
            private_key: None,
            peers: Vec::new(),
            propose_timeout: Duration::from_secs(3),
            prevote_timeout: Duration::from_secs(2),
            precommit_timeout: Duration::from_secs(2),
            block_interval: Duration::from_secs(10),
            mempool_max: 10_000,
            mempool_ttl: Duration::from_secs(3_600),
            max_block_txs: 100,
            max_block_bytes: 1 << 20,
        }
    }
}
