//! Node orchestration
//!
//! Wires the store, genesis bootstrap, mempool, API server, and either the
//! BFT consensus engine (`USE_BFT=true`) or the timer-driven single-node
//! producer. Only one of the two may ever call the block applier.

use crate::api::{run_api_server, ApiContext};
use crate::chain::genesis::{self, GenesisConfig};
use crate::chain::producer::{apply_block, produce_block};
use crate::config::Config;
use crate::consensus::{ConsensusEngine, ConsensusMessage, Transport};
use crate::crypto::KeyPair;
use crate::mempool::Mempool;
use crate::state::StateStore;
use crate::store::{KvStore, MemoryStore, SqliteStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Fans consensus messages out to every configured peer over HTTP.
/// Fire-and-forget: a dead peer only costs a log line.
pub struct HttpTransport {
    client: reqwest::Client,
    peers: Vec<String>,
}

impl HttpTransport {
    pub fn new(peers: Vec<String>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .connect_timeout(Duration::from_secs(2))
            .build()?;
        Ok(HttpTransport { client, peers })
    }
}

impl Transport for HttpTransport {
    fn broadcast(&self, message: ConsensusMessage) {
        for peer in &self.peers {
            let client = self.client.clone();
            let url = format!("{}/consensus", peer.trim_end_matches('/'));
            let message = message.clone();
            tokio::spawn(async move {
                if let Err(err) = client.post(&url).json(&message).send().await {
                    warn!(%url, error = %err, "consensus broadcast failed");
                }
            });
        }
    }
}

pub struct Node {
    pub config: Config,
    pub state: StateStore,
    pub mempool: Arc<RwLock<Mempool>>,
    pub engine: Option<Arc<ConsensusEngine>>,
    /// Signing identity of the local producer (simple mode) or validator.
    keypair: KeyPair,
    node_id: String,
}

impl Node {
    pub async fn init(config: Config) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        info!(db_path = %config.db_path, use_bft = config.use_bft, "starting miniroha node");

        let kv: Arc<dyn KvStore> = match SqliteStore::open(&config.db_path) {
            Ok(store) => Arc::new(store),
            Err(err) => {
                warn!(
                    db_path = %config.db_path,
                    error = %err,
                    "failed to open database, falling back to in-memory store"
                );
                Arc::new(MemoryStore::new())
            }
        };
        let state = StateStore::new(kv);

        if !genesis::is_bootstrapped(&state)? {
            let raw = std::fs::read_to_string(&config.genesis_path).map_err(|err| {
                format!(
                    "chain is not bootstrapped and genesis config {} is unreadable: {}",
                    config.genesis_path, err
                )
            })?;
            let genesis_config: GenesisConfig = serde_json::from_str(&raw)?;
            genesis::bootstrap(&state, &genesis_config)?;
            info!(chain_id = %genesis_config.chain_id, "genesis installed");
        }

        let keypair = match &config.private_key {
            Some(encoded) => {
                KeyPair::from_encoded(encoded).ok_or("PRIVATE_KEY is not a valid keypair")?
            }
            None => {
                if config.use_bft {
                    return Err("USE_BFT=true requires PRIVATE_KEY".into());
                }
                KeyPair::generate()
            }
        };
        let node_id = match &config.node_id {
            Some(id) => id.clone(),
            None => {
                if config.use_bft {
                    return Err("USE_BFT=true requires NODE_ID".into());
                }
                "local".to_string()
            }
        };

        let mempool = Arc::new(RwLock::new(Mempool::with_capacity(config.mempool_max)));

        let engine = if config.use_bft {
            let transport = Arc::new(HttpTransport::new(config.peers.clone())?);
            let engine = ConsensusEngine::new(
                state.clone(),
                mempool.clone(),
                transport,
                keypair.clone(),
                node_id.clone(),
                state.validators()?,
                config.consensus(),
            )?;
            Some(engine)
        } else {
            None
        };

        Ok(Node {
            config,
            state,
            mempool,
            engine,
            keypair,
            node_id,
        })
    }

    pub async fn start(self: Arc<Self>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ctx = Arc::new(ApiContext {
            state: self.state.clone(),
            mempool: self.mempool.clone(),
            engine: self.engine.clone(),
            node_id: self.node_id.clone(),
        });
        let port = self.config.port;
        tokio::spawn(async move {
            if let Err(err) = run_api_server(ctx, port).await {
                error!(error = %err, "api server failed");
            }
        });

        match &self.engine {
            Some(engine) => {
                engine.start().await?;
            }
            None => {
                // Single-node dev mode: produce and self-commit on a timer.
                // Gated off whenever the consensus engine runs.
                let node = self.clone();
                tokio::spawn(async move {
                    node.simple_producer_loop().await;
                });
            }
        }

        // Age out stale mempool entries in the background.
        let node = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let now_ms = chrono::Utc::now().timestamp_millis() as u64;
                let ttl_ms = node.config.mempool_ttl.as_millis() as u64;
                let removed = node.mempool.write().await.evict_older_than(ttl_ms, now_ms);
                if removed > 0 {
                    info!(removed, "mempool ttl sweep");
                }
            }
        });

        tokio::signal::ctrl_c().await?;
        info!("shutting down");
        if let Some(engine) = &self.engine {
            engine.stop().await;
        }
        Ok(())
    }

    async fn simple_producer_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.block_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;

            let produced = {
                let mempool = self.mempool.read().await;
                if mempool.is_empty() {
                    continue;
                }
                produce_block(
                    &self.state,
                    &mempool,
                    &self.node_id,
                    &self.keypair,
                    self.config.max_block_txs,
                    self.config.max_block_bytes,
                    chrono::Utc::now().timestamp_millis() as u64,
                )
            };

            let block = match produced {
                Ok(block) => block,
                Err(err) => {
                    warn!(error = %err, "block production failed");
                    continue;
                }
            };

            match apply_block(&self.state, &block) {
                Ok(outcome) => {
                    let included: Vec<String> = block
                        .transactions
                        .iter()
                        .filter_map(|tx| tx.hash().ok())
                        .collect();
                    self.mempool.write().await.remove_committed(&included);
                    info!(
                        height = outcome.height,
                        applied = outcome.applied.len(),
                        dropped = outcome.dropped,
                        "block produced and committed"
                    );
                }
                Err(err) => {
                    error!(error = %err, "block apply failed");
                }
            }
        }
    }
}
