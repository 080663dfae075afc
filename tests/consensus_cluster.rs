//! Multi-validator consensus integration tests
//!
//! Four engines wired through an in-process loopback transport, each with
//! its own store bootstrapped from the same genesis. Checks liveness (every
//! honest node commits) and safety (no two nodes commit different blocks at
//! the same height).

use miniroha::chain::genesis::{
    bootstrap, GenesisAccount, GenesisConfig, GenesisRole, GenesisValidator,
};
use miniroha::consensus::{ConsensusConfig, ConsensusEngine, ConsensusMessage, Transport};
use miniroha::crypto::KeyPair;
use miniroha::mempool::Mempool;
use miniroha::state::StateStore;
use miniroha::store::MemoryStore;
use miniroha::transaction::{Instruction, Transaction, TransactionBody};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::RwLock;

/// Routes every broadcast to every other engine in the cluster.
struct Hub {
    engines: Mutex<Vec<(String, Weak<ConsensusEngine>)>>,
}

struct LoopbackTransport {
    hub: Arc<Hub>,
    self_id: String,
}

impl Transport for LoopbackTransport {
    fn broadcast(&self, message: ConsensusMessage) {
        let engines = self.hub.engines.lock().expect("hub lock");
        for (id, engine) in engines.iter() {
            if *id == self.self_id {
                continue;
            }
            let Some(engine) = engine.upgrade() else {
                continue;
            };
            let message = message.clone();
            tokio::spawn(async move {
                let _ = engine.handle_message(message).await;
            });
        }
    }
}

struct ClusterNode {
    id: String,
    state: StateStore,
    mempool: Arc<RwLock<Mempool>>,
    engine: Arc<ConsensusEngine>,
}

fn fast_config() -> ConsensusConfig {
    ConsensusConfig {
        propose_timeout: Duration::from_millis(300),
        prevote_timeout: Duration::from_millis(300),
        precommit_timeout: Duration::from_millis(300),
        block_interval: Duration::from_millis(150),
        ..ConsensusConfig::default()
    }
}

/// Builds `n` validators sharing one genesis, each with a private store.
fn cluster(n: usize) -> (Vec<ClusterNode>, KeyPair) {
    let admin = KeyPair::generate();
    let validator_keys: Vec<(String, KeyPair)> = (1..=n)
        .map(|i| (format!("node{}", i), KeyPair::generate()))
        .collect();

    let config = GenesisConfig {
        chain_id: "miniroha-test".into(),
        domains: vec!["root".into()],
        accounts: vec![GenesisAccount {
            id: "admin@root".into(),
            public_key: admin.public_key(),
            roles: vec!["admin".into()],
        }],
        assets: vec![],
        balances: vec![],
        roles: vec![GenesisRole {
            id: "admin".into(),
            permissions: vec!["*".into()],
        }],
        validators: validator_keys
            .iter()
            .map(|(id, key)| GenesisValidator {
                id: id.clone(),
                public_key: key.public_key(),
            })
            .collect(),
    };

    let hub = Arc::new(Hub {
        engines: Mutex::new(Vec::new()),
    });

    let mut nodes = Vec::with_capacity(n);
    for (id, keypair) in validator_keys {
        let state = StateStore::new(Arc::new(MemoryStore::new()));
        bootstrap(&state, &config).unwrap();
        let mempool = Arc::new(RwLock::new(Mempool::new()));
        let engine = ConsensusEngine::new(
            state.clone(),
            mempool.clone(),
            Arc::new(LoopbackTransport {
                hub: hub.clone(),
                self_id: id.clone(),
            }),
            keypair,
            id.clone(),
            state.validators().unwrap(),
            fast_config(),
        )
        .unwrap();
        hub.engines
            .lock()
            .unwrap()
            .push((id.clone(), Arc::downgrade(&engine)));
        nodes.push(ClusterNode {
            id,
            state,
            mempool,
            engine,
        });
    }
    (nodes, admin)
}

fn domain_tx(admin: &KeyPair, nonce: u64, domain: &str) -> Transaction {
    Transaction::sign(
        TransactionBody {
            chain_id: "miniroha-test".into(),
            signer_id: "admin@root".into(),
            nonce,
            created_at: chrono::Utc::now().timestamp_millis() as u64,
            instructions: vec![Instruction::RegisterDomain {
                domain_id: domain.into(),
            }],
        },
        admin,
    )
    .unwrap()
}

async fn wait_for_height(nodes: &[ClusterNode], height: u64) {
    let deadline = Duration::from_secs(20);
    tokio::time::timeout(deadline, async {
        loop {
            let reached = nodes
                .iter()
                .all(|node| node.state.last_height().unwrap() >= height);
            if reached {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        let heights: Vec<(String, u64)> = nodes
            .iter()
            .map(|n| (n.id.clone(), n.state.last_height().unwrap()))
            .collect();
        panic!("cluster did not reach height {}: {:?}", height, heights);
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_four_validators_commit_identical_blocks() {
    let (nodes, admin) = cluster(4);
    for node in &nodes {
        node.engine.start().await.unwrap();
    }

    // Every node hears the transaction, whoever ends up proposing.
    let tx = domain_tx(&admin, 1, "finance");
    for node in &nodes {
        node.mempool.write().await.add(tx.clone()).unwrap();
    }

    wait_for_height(&nodes, 2).await;

    // Safety: one block at height 2, everywhere.
    let reference = nodes[0].state.get_block(2).unwrap().unwrap();
    for node in &nodes[1..] {
        let block = node.state.get_block(2).unwrap().unwrap();
        assert_eq!(
            block.hash().unwrap(),
            reference.hash().unwrap(),
            "{} committed a different block",
            node.id
        );
        assert!(node.state.get_domain("finance").unwrap().is_some());
    }

    for node in &nodes {
        node.engine.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_advances_across_heights() {
    let (nodes, admin) = cluster(4);
    for node in &nodes {
        node.engine.start().await.unwrap();
    }

    let tx = domain_tx(&admin, 1, "finance");
    for node in &nodes {
        node.mempool.write().await.add(tx.clone()).unwrap();
    }
    wait_for_height(&nodes, 2).await;

    let tx = domain_tx(&admin, 2, "trade");
    for node in &nodes {
        node.mempool.write().await.add(tx.clone()).unwrap();
    }
    wait_for_height(&nodes, 3).await;

    for node in &nodes {
        let block2 = node.state.get_block(2).unwrap().unwrap();
        let block3 = node.state.get_block(3).unwrap().unwrap();
        assert_eq!(block3.header.prev_hash, block2.hash().unwrap());
        assert!(node.state.get_domain("trade").unwrap().is_some());
    }

    for node in &nodes {
        node.engine.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_faulty_node_does_not_break_safety() {
    // f = 1 for n = 4: stopping one node must not stop the rest, and the
    // survivors must stay consistent.
    let (nodes, admin) = cluster(4);
    for node in &nodes {
        node.engine.start().await.unwrap();
    }

    // Crash-stop one non-proposer immediately.
    nodes[3].engine.stop().await;

    let tx = domain_tx(&admin, 1, "finance");
    for node in &nodes[..3] {
        node.mempool.write().await.add(tx.clone()).unwrap();
    }

    wait_for_height(&nodes[..3], 2).await;

    let reference = nodes[0].state.get_block(2).unwrap().unwrap();
    for node in &nodes[1..3] {
        let block = node.state.get_block(2).unwrap().unwrap();
        assert_eq!(block.hash().unwrap(), reference.hash().unwrap());
    }

    for node in &nodes[..3] {
        node.engine.stop().await;
    }
}
