//! Consensus wire messages
//!
//! Proposals carry the full candidate block; votes carry an optional block
//! hash where `None` is the nil vote. Every message is signed over the
//! canonical `{type, height, round, block_hash}` payload.

use crate::chain::block::Block;
use crate::crypto::{canonical, canonical_hash, KeyPair};
use serde::{Deserialize, Serialize};

/// Wire tag of a proposal's signing payload.
pub const PROPOSAL_TYPE: &str = "proposal";
/// Wire tag of a prevote's signing payload.
pub const PREVOTE_TYPE: &str = "prevote";
/// Wire tag of a precommit's signing payload.
pub const PRECOMMIT_TYPE: &str = "precommit";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub height: u64,
    pub round: u64,
    pub validator_id: String,
    pub block_hash: String,
    pub block: Block,
    pub signature: String,
}

/// A prevote or precommit; which one is determined by the enclosing
/// [`ConsensusMessage`] variant. `block_hash: None` denotes nil.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub height: u64,
    pub round: u64,
    pub validator_id: String,
    pub block_hash: Option<String>,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ConsensusMessage {
    Proposal(Proposal),
    PreVote(Vote),
    PreCommit(Vote),
}

#[derive(Serialize)]
struct SigningPayload<'a> {
    #[serde(rename = "type")]
    msg_type: &'a str,
    height: u64,
    round: u64,
    block_hash: Option<&'a str>,
}

fn signing_bytes(
    msg_type: &str,
    height: u64,
    round: u64,
    block_hash: Option<&str>,
) -> Result<String, serde_json::Error> {
    canonical(&SigningPayload {
        msg_type,
        height,
        round,
        block_hash,
    })
}

impl Proposal {
    pub fn sign(
        height: u64,
        round: u64,
        validator_id: String,
        block: Block,
        keypair: &KeyPair,
    ) -> Result<Self, serde_json::Error> {
        let block_hash = block.hash()?;
        let message = signing_bytes(PROPOSAL_TYPE, height, round, Some(&block_hash))?;
        Ok(Proposal {
            height,
            round,
            validator_id,
            signature: keypair.sign(message.as_bytes()),
            block_hash,
            block,
        })
    }

    pub fn verify_signature(&self, public_key: &str) -> bool {
        let Ok(message) = signing_bytes(
            PROPOSAL_TYPE,
            self.height,
            self.round,
            Some(&self.block_hash),
        ) else {
            return false;
        };
        crate::crypto::verify(public_key, &self.signature, message.as_bytes())
    }
}

impl Vote {
    pub fn sign(
        msg_type: &str,
        height: u64,
        round: u64,
        validator_id: String,
        block_hash: Option<String>,
        keypair: &KeyPair,
    ) -> Result<Self, serde_json::Error> {
        let message = signing_bytes(msg_type, height, round, block_hash.as_deref())?;
        Ok(Vote {
            height,
            round,
            validator_id,
            block_hash,
            signature: keypair.sign(message.as_bytes()),
        })
    }

    pub fn verify_signature(&self, msg_type: &str, public_key: &str) -> bool {
        let Ok(message) = signing_bytes(
            msg_type,
            self.height,
            self.round,
            self.block_hash.as_deref(),
        ) else {
            return false;
        };
        crate::crypto::verify(public_key, &self.signature, message.as_bytes())
    }

    pub fn is_nil(&self) -> bool {
        self.block_hash.is_none()
    }
}

impl ConsensusMessage {
    pub fn height(&self) -> u64 {
        match self {
            ConsensusMessage::Proposal(p) => p.height,
            ConsensusMessage::PreVote(v) | ConsensusMessage::PreCommit(v) => v.height,
        }
    }

    pub fn round(&self) -> u64 {
        match self {
            ConsensusMessage::Proposal(p) => p.round,
            ConsensusMessage::PreVote(v) | ConsensusMessage::PreCommit(v) => v.round,
        }
    }

    pub fn validator_id(&self) -> &str {
        match self {
            ConsensusMessage::Proposal(p) => &p.validator_id,
            ConsensusMessage::PreVote(v) | ConsensusMessage::PreCommit(v) => &v.validator_id,
        }
    }

    /// Content hash used for delivery idempotence on the consensus endpoint.
    pub fn message_hash(&self) -> Result<String, serde_json::Error> {
        canonical_hash(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::block::BlockHeader;

    fn block() -> Block {
        Block {
            header: BlockHeader {
                height: 2,
                prev_hash: "prev".into(),
                timestamp: 5,
            },
            transactions: vec![],
            proposer_id: "node1".into(),
            signature: "sig".into(),
        }
    }

    #[test]
    fn test_proposal_sign_verify() {
        let keypair = KeyPair::generate();
        let proposal = Proposal::sign(2, 0, "node1".into(), block(), &keypair).unwrap();
        assert_eq!(proposal.block_hash, block().hash().unwrap());
        assert!(proposal.verify_signature(&keypair.public_key()));
        assert!(!proposal.verify_signature(&KeyPair::generate().public_key()));
    }

    #[test]
    fn test_vote_sign_verify_and_type_domain() {
        let keypair = KeyPair::generate();
        let vote = Vote::sign(
            PREVOTE_TYPE,
            2,
            0,
            "node1".into(),
            Some("h".into()),
            &keypair,
        )
        .unwrap();
        assert!(vote.verify_signature(PREVOTE_TYPE, &keypair.public_key()));
        // A prevote signature does not verify as a precommit.
        assert!(!vote.verify_signature(PRECOMMIT_TYPE, &keypair.public_key()));
    }

    #[test]
    fn test_nil_vote() {
        let keypair = KeyPair::generate();
        let vote = Vote::sign(PRECOMMIT_TYPE, 2, 1, "node1".into(), None, &keypair).unwrap();
        assert!(vote.is_nil());
        assert!(vote.verify_signature(PRECOMMIT_TYPE, &keypair.public_key()));
    }

    #[test]
    fn test_message_hash_idempotence_key() {
        let keypair = KeyPair::generate();
        let vote = Vote::sign(PREVOTE_TYPE, 2, 0, "node1".into(), None, &keypair).unwrap();
        let a = ConsensusMessage::PreVote(vote.clone());
        let b = ConsensusMessage::PreVote(vote);
        assert_eq!(a.message_hash().unwrap(), b.message_hash().unwrap());

        let other = Vote::sign(PREVOTE_TYPE, 2, 1, "node1".into(), None, &keypair).unwrap();
        assert_ne!(
            a.message_hash().unwrap(),
            ConsensusMessage::PreVote(other).message_hash().unwrap()
        );
    }

    #[test]
    fn test_wire_tags() {
        let keypair = KeyPair::generate();
        let vote = Vote::sign(PREVOTE_TYPE, 2, 0, "node1".into(), None, &keypair).unwrap();
        let json = serde_json::to_value(ConsensusMessage::PreVote(vote)).unwrap();
        assert_eq!(json["type"], "PreVote");
        assert_eq!(json["block_hash"], serde_json::Value::Null);
    }
}
