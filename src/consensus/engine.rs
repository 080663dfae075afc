//! Round-based BFT consensus engine
//!
//! Three phases per round: propose, prevote, precommit. The proposer for
//! `(height, round)` is the validator at `(height + round) mod n` in id
//! order. Progress requires `2f + 1` matching votes where `f = (n-1)/3`.
//! A prevote quorum locks the candidate block; a precommit quorum for the
//! locked hash commits it through the block applier.
//!
//! Every handler runs behind one engine lock, so observable behavior matches
//! a single-threaded event loop. Message-level errors are logged and the
//! message is dropped; nothing propagates across the loop. Timeouts take the
//! nil branch of whichever step they fire in.

use crate::chain::producer::{apply_block, produce_block, verify_block};
use crate::chain::block::Block;
use crate::consensus::types::{
    ConsensusMessage, Proposal, Vote, PRECOMMIT_TYPE, PREVOTE_TYPE,
};
use crate::crypto::KeyPair;
use crate::entities::Validator;
use crate::error::{ConsensusError, StorageResult};
use crate::mempool::Mempool;
use crate::state::StateStore;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Outbound fan-out to the other validators. Implementations must not block;
/// delivery is fire-and-forget.
pub trait Transport: Send + Sync {
    fn broadcast(&self, message: ConsensusMessage);
}

/// Transport that drops every message; a single-validator chain reaches
/// quorum on its own votes.
pub struct NullTransport;

impl Transport for NullTransport {
    fn broadcast(&self, _message: ConsensusMessage) {}
}

#[derive(Debug, Clone)]
pub struct ConsensusConfig {
    pub propose_timeout: Duration,
    pub prevote_timeout: Duration,
    pub precommit_timeout: Duration,
    /// Idle time between committing a block and starting the next height.
    pub block_interval: Duration,
    pub max_block_txs: usize,
    pub max_block_bytes: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            propose_timeout: Duration::from_secs(3),
            prevote_timeout: Duration::from_secs(2),
            precommit_timeout: Duration::from_secs(2),
            block_interval: Duration::from_secs(10),
            max_block_txs: 100,
            max_block_bytes: 1 << 20,
        }
    }
}

/// The static validator set, id-sorted for deterministic proposer rotation.
struct ValidatorSet {
    ids: Vec<String>,
    keys_by_id: HashMap<String, String>,
}

impl ValidatorSet {
    fn new(mut validators: Vec<Validator>) -> Self {
        validators.sort_by(|a, b| a.id.cmp(&b.id));
        let keys_by_id = validators
            .iter()
            .map(|v| (v.id.clone(), v.public_key.clone()))
            .collect();
        ValidatorSet {
            ids: validators.into_iter().map(|v| v.id).collect(),
            keys_by_id,
        }
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    /// `2f + 1` with `f = (n - 1) / 3`.
    fn quorum(&self) -> usize {
        let f = (self.len().saturating_sub(1)) / 3;
        2 * f + 1
    }

    fn proposer_for(&self, height: u64, round: u64) -> &str {
        let idx = (height.wrapping_add(round) % self.ids.len() as u64) as usize;
        &self.ids[idx]
    }

    fn public_key(&self, validator_id: &str) -> Option<&str> {
        self.keys_by_id.get(validator_id).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Propose,
    Prevote,
    Precommit,
    /// Between heights: the block is committed and the next round starts
    /// after the block interval.
    Commit,
}

/// Where an inbound message sits relative to the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Current,
    Future,
    Stale,
}

/// Bound on buffered future-round messages.
const MAX_PENDING_MESSAGES: usize = 256;

#[derive(Default)]
struct RoundVotes {
    prevotes: HashMap<String, Vote>,
    precommits: HashMap<String, Vote>,
}

struct EngineInner {
    height: u64,
    round: u64,
    step: Step,
    locked_block: Option<Block>,
    locked_round: Option<u64>,
    valid_block: Option<Block>,
    valid_round: Option<u64>,
    votes: RoundVotes,
    /// Messages for rounds we have not reached yet, replayed on round entry.
    pending: Vec<ConsensusMessage>,
    /// Message hashes already dispatched, for endpoint idempotence.
    seen: HashSet<String>,
    timer: Option<JoinHandle<()>>,
    timer_gen: u64,
}

impl EngineInner {
    fn new() -> Self {
        EngineInner {
            height: 1,
            round: 0,
            step: Step::Commit,
            locked_block: None,
            locked_round: None,
            valid_block: None,
            valid_round: None,
            votes: RoundVotes::default(),
            pending: Vec::new(),
            seen: HashSet::new(),
            timer: None,
            timer_gen: 0,
        }
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Vote tallies for one map: the strongest non-nil candidate and the nil
/// count.
fn tally(votes: &HashMap<String, Vote>) -> (Option<(String, usize)>, usize) {
    let mut counts: HashMap<Option<&str>, usize> = HashMap::new();
    for vote in votes.values() {
        *counts.entry(vote.block_hash.as_deref()).or_default() += 1;
    }
    let nil = counts.get(&None).copied().unwrap_or(0);
    let best = counts
        .into_iter()
        .filter_map(|(hash, count)| hash.map(|h| (h.to_string(), count)))
        .max_by_key(|(_, count)| *count);
    (best, nil)
}

pub struct ConsensusEngine {
    state: StateStore,
    mempool: Arc<RwLock<Mempool>>,
    transport: Arc<dyn Transport>,
    keypair: KeyPair,
    node_id: String,
    validators: ValidatorSet,
    config: ConsensusConfig,
    inner: Mutex<EngineInner>,
    stopped: AtomicBool,
    commits: broadcast::Sender<u64>,
    /// Handle to ourselves for spawned timer tasks.
    weak_self: Weak<ConsensusEngine>,
}

impl ConsensusEngine {
    /// Builds an engine for a validator that must be part of the given set,
    /// with a signing key matching its registered one.
    pub fn new(
        state: StateStore,
        mempool: Arc<RwLock<Mempool>>,
        transport: Arc<dyn Transport>,
        keypair: KeyPair,
        node_id: String,
        validators: Vec<Validator>,
        config: ConsensusConfig,
    ) -> Result<Arc<Self>, ConsensusError> {
        let validators = ValidatorSet::new(validators);
        let Some(registered) = validators.public_key(&node_id) else {
            return Err(ConsensusError::UnknownValidator(node_id));
        };
        if registered != keypair.public_key() {
            return Err(ConsensusError::InvalidSignature(node_id));
        }
        let (commits, _) = broadcast::channel(64);
        Ok(Arc::new_cyclic(|weak_self| ConsensusEngine {
            state,
            mempool,
            transport,
            keypair,
            node_id,
            validators,
            config,
            inner: Mutex::new(EngineInner::new()),
            stopped: AtomicBool::new(false),
            commits,
            weak_self: weak_self.clone(),
        }))
    }

    /// Heights this engine has committed, for observers.
    pub fn subscribe_commits(&self) -> broadcast::Receiver<u64> {
        self.commits.subscribe()
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Resumes from the persisted chain tip and starts round 0.
    pub async fn start(&self) -> StorageResult<()> {
        let next_height = self.state.last_height()? + 1;
        let mut inner = self.inner.lock().await;
        inner.height = next_height;
        info!(height = next_height, validators = self.validators.len(), "consensus engine starting");
        self.begin_round(&mut inner, 0).await;
        self.advance(&mut inner).await;
        Ok(())
    }

    /// Cancels any pending timer and prevents further round starts.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock().await;
        inner.timer_gen += 1;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        info!("consensus engine stopped");
    }

    /// Dispatches one inbound message. Errors are logged here and reported
    /// to the caller, but never alter engine state; duplicate deliveries
    /// (same message hash) are ignored. Messages for rounds this node has
    /// not reached yet are buffered and replayed when the round starts, so
    /// a node lagging one quorum behind its peers does not lose them.
    pub async fn handle_message(
        &self,
        message: ConsensusMessage,
    ) -> Result<(), ConsensusError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        let Ok(message_hash) = message.message_hash() else {
            return Ok(());
        };
        let mut inner = self.inner.lock().await;
        if !inner.seen.insert(message_hash) {
            return Ok(());
        }

        match self.classify(&inner, &message) {
            Disposition::Stale => {
                let err = ConsensusError::StaleMessage {
                    height: message.height(),
                    round: message.round(),
                };
                debug!(error = %err, "consensus message dropped");
                Err(err)
            }
            Disposition::Future => {
                if inner.pending.len() < MAX_PENDING_MESSAGES {
                    inner.pending.push(message);
                }
                Ok(())
            }
            Disposition::Current => {
                let result = self.absorb(&mut inner, message);
                if let Err(err) = &result {
                    debug!(error = %err, "consensus message dropped");
                }
                // Absorbing may have recorded a vote or cast our own nil
                // prevote; either can complete a quorum.
                self.advance(&mut inner).await;
                result
            }
        }
    }

    // ------------------------------------------------------------------
    // Message handlers (engine lock held)
    // ------------------------------------------------------------------

    /// Where a message sits relative to our `(height, round, step)`.
    fn classify(&self, inner: &EngineInner, message: &ConsensusMessage) -> Disposition {
        let height = message.height();
        let round = message.round();
        if height < inner.height {
            return Disposition::Stale;
        }
        // During the between-heights idle step every message for the
        // upcoming round is early, not late.
        if height > inner.height || round > inner.round || inner.step == Step::Commit {
            return Disposition::Future;
        }
        if round < inner.round {
            return Disposition::Stale;
        }
        Disposition::Current
    }

    /// Validates and applies a message known to belong to the current
    /// round. Does not run quorum transitions; callers follow up with
    /// [`Self::advance`].
    fn absorb(
        &self,
        inner: &mut EngineInner,
        message: ConsensusMessage,
    ) -> Result<(), ConsensusError> {
        match message {
            ConsensusMessage::Proposal(p) => self.absorb_proposal(inner, p),
            ConsensusMessage::PreVote(v) => {
                self.check_vote(inner, &v, PREVOTE_TYPE)?;
                inner
                    .votes
                    .prevotes
                    .entry(v.validator_id.clone())
                    .or_insert(v);
                Ok(())
            }
            ConsensusMessage::PreCommit(v) => {
                self.check_vote(inner, &v, PRECOMMIT_TYPE)?;
                inner
                    .votes
                    .precommits
                    .entry(v.validator_id.clone())
                    .or_insert(v);
                Ok(())
            }
        }
    }

    fn absorb_proposal(
        &self,
        inner: &mut EngineInner,
        proposal: Proposal,
    ) -> Result<(), ConsensusError> {
        let Some(public_key) = self.validators.public_key(&proposal.validator_id) else {
            return Err(ConsensusError::UnknownValidator(proposal.validator_id));
        };
        // A proposal landing after we already prevoted this round is late.
        if inner.step != Step::Propose {
            return Err(ConsensusError::StaleMessage {
                height: proposal.height,
                round: proposal.round,
            });
        }
        let expected = self.validators.proposer_for(inner.height, inner.round);
        if expected != proposal.validator_id {
            return Err(ConsensusError::InvalidProposer {
                expected: expected.to_string(),
                got: proposal.validator_id,
            });
        }
        if !proposal.verify_signature(public_key) {
            return Err(ConsensusError::InvalidSignature(proposal.validator_id));
        }

        // From here on the proposal is authentic; a block that fails
        // verification earns a nil prevote rather than a silent drop.
        let verified = proposal
            .block
            .hash()
            .ok()
            .filter(|h| *h == proposal.block_hash)
            .map(|_| verify_block(&self.state, &proposal.block))
            .unwrap_or_else(|| {
                Err(crate::chain::block::BlockError::Malformed(
                    "block hash mismatch".into(),
                ))
            });

        match verified {
            Ok(()) => {
                inner.valid_block = Some(proposal.block);
                inner.valid_round = Some(inner.round);
                // Once locked, only the locked block may earn our prevote.
                let vote = match &inner.locked_block {
                    Some(locked) if locked.hash().ok().as_deref() != Some(&proposal.block_hash) => {
                        None
                    }
                    _ => Some(proposal.block_hash),
                };
                self.enter_prevote(inner, vote);
                Ok(())
            }
            Err(err) => {
                warn!(proposer = %proposal.validator_id, error = %err, "proposal rejected, prevoting nil");
                self.enter_prevote(inner, None);
                Err(ConsensusError::BlockVerificationFailed(err.to_string()))
            }
        }
    }

    fn check_vote(
        &self,
        inner: &EngineInner,
        vote: &Vote,
        msg_type: &str,
    ) -> Result<(), ConsensusError> {
        let Some(public_key) = self.validators.public_key(&vote.validator_id) else {
            return Err(ConsensusError::UnknownValidator(vote.validator_id.clone()));
        };
        debug_assert!(vote.height == inner.height && vote.round == inner.round);
        if !vote.verify_signature(msg_type, public_key) {
            return Err(ConsensusError::InvalidSignature(vote.validator_id.clone()));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Round state machine (engine lock held)
    // ------------------------------------------------------------------

    /// Clears the round's votes, then proposes (when we are the proposer
    /// and production succeeds), prevotes nil (proposer with nothing to
    /// propose), or arms the proposal timeout (everyone else).
    async fn begin_round(&self, inner: &mut EngineInner, round: u64) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        inner.round = round;
        inner.step = Step::Propose;
        inner.votes = RoundVotes::default();

        let proposer = self.validators.proposer_for(inner.height, round);
        debug!(height = inner.height, round, proposer, "round started");
        if proposer == self.node_id {
            let produced = {
                let mempool = self.mempool.read().await;
                produce_block(
                    &self.state,
                    &mempool,
                    &self.node_id,
                    &self.keypair,
                    self.config.max_block_txs,
                    self.config.max_block_bytes,
                    now_ms(),
                )
            };
            match produced {
                Ok(block) => {
                    inner.valid_block = Some(block.clone());
                    inner.valid_round = Some(round);
                    match Proposal::sign(
                        inner.height,
                        round,
                        self.node_id.clone(),
                        block,
                        &self.keypair,
                    ) {
                        Ok(proposal) => {
                            let block_hash = proposal.block_hash.clone();
                            info!(height = inner.height, round, %block_hash, "proposing block");
                            self.transport
                                .broadcast(ConsensusMessage::Proposal(proposal));
                            self.enter_prevote(inner, Some(block_hash));
                        }
                        Err(err) => {
                            error!(error = %err, "failed to sign proposal");
                            self.enter_prevote(inner, None);
                        }
                    }
                }
                Err(err) => {
                    // Cannot produce (empty mempool, etc.): vote nil at the
                    // prevote step right away.
                    debug!(height = inner.height, round, reason = %err, "nothing to propose");
                    self.enter_prevote(inner, None);
                }
            }
        } else {
            self.arm_timer(inner, self.config.propose_timeout);
        }

        self.replay_pending(inner);
    }

    /// Re-dispatches buffered messages that belong to the round we just
    /// entered; messages still in the future stay buffered, stale ones are
    /// discarded.
    fn replay_pending(&self, inner: &mut EngineInner) {
        let pending = std::mem::take(&mut inner.pending);
        let mut kept = Vec::new();
        for message in pending {
            match self.classify(inner, &message) {
                Disposition::Current => {
                    if let Err(err) = self.absorb(inner, message) {
                        debug!(error = %err, "buffered message dropped");
                    }
                }
                Disposition::Future => kept.push(message),
                Disposition::Stale => {}
            }
        }
        inner.pending = kept;
    }

    /// Broadcasts and records our prevote, then waits for a prevote quorum.
    fn enter_prevote(&self, inner: &mut EngineInner, block_hash: Option<String>) {
        inner.step = Step::Prevote;
        self.cast_vote(inner, PREVOTE_TYPE, block_hash);
        self.arm_timer(inner, self.config.prevote_timeout);
    }

    /// Broadcasts and records our precommit, then waits for a precommit
    /// quorum.
    fn enter_precommit(&self, inner: &mut EngineInner, block_hash: Option<String>) {
        inner.step = Step::Precommit;
        self.cast_vote(inner, PRECOMMIT_TYPE, block_hash);
        self.arm_timer(inner, self.config.precommit_timeout);
    }

    fn cast_vote(&self, inner: &mut EngineInner, msg_type: &str, block_hash: Option<String>) {
        let vote = match Vote::sign(
            msg_type,
            inner.height,
            inner.round,
            self.node_id.clone(),
            block_hash,
            &self.keypair,
        ) {
            Ok(vote) => vote,
            Err(err) => {
                error!(error = %err, "failed to sign vote");
                return;
            }
        };
        let (map, message) = match msg_type {
            PREVOTE_TYPE => (
                &mut inner.votes.prevotes,
                ConsensusMessage::PreVote(vote.clone()),
            ),
            _ => (
                &mut inner.votes.precommits,
                ConsensusMessage::PreCommit(vote.clone()),
            ),
        };
        map.entry(self.node_id.clone()).or_insert(vote);
        self.transport.broadcast(message);
    }

    /// Runs quorum-driven transitions until the state stops changing:
    /// prevote quorum → lock and precommit, precommit quorum → commit or
    /// next round. Iterative so a single-validator chain cascades straight
    /// through to commit.
    async fn advance(&self, inner: &mut EngineInner) {
        let mut nil_restarts = 0u32;
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            let quorum = self.validators.quorum();
            match inner.step {
                Step::Prevote => {
                    let (best, nil) = tally(&inner.votes.prevotes);
                    if let Some((hash, count)) = best.filter(|(_, c)| *c >= quorum) {
                        let candidate = inner
                            .valid_block
                            .as_ref()
                            .filter(|b| b.hash().ok().as_deref() == Some(&hash))
                            .cloned();
                        let vote = match candidate {
                            Some(block) => {
                                inner.locked_block = Some(block);
                                inner.locked_round = Some(inner.round);
                                debug!(height = inner.height, round = inner.round, %hash, "locked");
                                Some(hash)
                            }
                            // Quorum on a block we never received; we cannot
                            // lock what we cannot apply.
                            None => None,
                        };
                        self.enter_precommit(inner, vote);
                        continue;
                    }
                    if nil >= quorum {
                        self.enter_precommit(inner, None);
                        continue;
                    }
                    return;
                }
                Step::Precommit => {
                    let (best, nil) = tally(&inner.votes.precommits);
                    let locked_hash = inner
                        .locked_block
                        .as_ref()
                        .and_then(|b| b.hash().ok());
                    if let Some((hash, _)) = best.filter(|(_, c)| *c >= quorum) {
                        if locked_hash.as_deref() == Some(&hash) {
                            self.commit_locked(inner).await;
                            return;
                        }
                        // A quorum committed a block we are not locked on:
                        // unreachable with <= f faults, so just log it.
                        warn!(height = inner.height, %hash, "precommit quorum for unlocked block");
                        return;
                    }
                    if nil >= quorum {
                        // A lone validator reaches every nil quorum on its
                        // own vote; after one synchronous restart, defer to
                        // the precommit timeout (also a restart path) so an
                        // idle chain does not spin through rounds while
                        // holding the engine lock.
                        if self.validators.len() == 1 && nil_restarts > 0 {
                            self.arm_timer(inner, self.config.precommit_timeout);
                            return;
                        }
                        nil_restarts += 1;
                        let next = inner.round + 1;
                        self.begin_round(inner, next).await;
                        continue;
                    }
                    return;
                }
                Step::Propose | Step::Commit => return,
            }
        }
    }

    /// Applies the locked block, advances the height, notifies observers,
    /// and idles until the next round.
    async fn commit_locked(&self, inner: &mut EngineInner) {
        let Some(block) = inner.locked_block.clone() else {
            return;
        };
        inner.step = Step::Commit;

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
                    block_hash = %outcome.block_hash,
                    applied = outcome.applied.len(),
                    dropped = outcome.dropped,
                    "block committed"
                );
                let _ = self.commits.send(outcome.height);

                inner.height += 1;
                inner.round = 0;
                inner.locked_block = None;
                inner.locked_round = None;
                inner.valid_block = None;
                inner.valid_round = None;
                inner.votes = RoundVotes::default();
                inner.seen.clear();
                self.arm_timer(inner, self.config.block_interval);
            }
            Err(err) => {
                // The store is untouched; stay locked and let the precommit
                // timeout retry through another round.
                error!(height = inner.height, error = %err, "block apply failed");
                inner.step = Step::Precommit;
                self.arm_timer(inner, self.config.precommit_timeout);
            }
        }
    }

    /// Replaces the pending timer. Firing takes the nil branch of the step
    /// it finds, or starts the next round from the idle step.
    fn arm_timer(&self, inner: &mut EngineInner, duration: Duration) {
        inner.timer_gen += 1;
        let gen = inner.timer_gen;
        if let Some(old) = inner.timer.take() {
            old.abort();
        }
        let Some(engine) = self.weak_self.upgrade() else {
            return;
        };
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            engine.on_timeout(gen).await;
        }));
    }

    async fn on_timeout(&self, gen: u64) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.lock().await;
        if inner.timer_gen != gen {
            return;
        }
        match inner.step {
            Step::Propose => {
                debug!(height = inner.height, round = inner.round, "propose timeout");
                self.enter_prevote(&mut inner, None);
            }
            Step::Prevote => {
                debug!(height = inner.height, round = inner.round, "prevote timeout");
                self.enter_precommit(&mut inner, None);
            }
            Step::Precommit => {
                debug!(height = inner.height, round = inner.round, "precommit timeout");
                let next = inner.round + 1;
                self.begin_round(&mut inner, next).await;
            }
            Step::Commit => {
                let round = 0;
                self.begin_round(&mut inner, round).await;
            }
        }
        self.advance(&mut inner).await;
    }
}
