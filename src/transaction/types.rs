/// Transaction types for Miniroha
use crate::crypto::{canonical_hash, KeyPair};
use serde::{Deserialize, Serialize};

/// One of the eight state-change operations carried inside a transaction.
///
/// The wire form tags each variant with its exact name under `type`; the
/// dispatcher in the instruction engine matches exhaustively, so adding a
/// variant without handling it is a compile error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Instruction {
    RegisterDomain {
        domain_id: String,
    },
    RegisterAccount {
        account_id: String,
        public_key: String,
    },
    RegisterAsset {
        asset_id: String,
        precision: u32,
    },
    MintAsset {
        asset_id: String,
        account_id: String,
        amount: String,
    },
    BurnAsset {
        asset_id: String,
        account_id: String,
        amount: String,
    },
    TransferAsset {
        asset_id: String,
        src_account_id: String,
        dest_account_id: String,
        amount: String,
    },
    GrantRole {
        role_id: String,
        account_id: String,
    },
    RevokeRole {
        role_id: String,
        account_id: String,
    },
}

impl Instruction {
    /// Wire tags of every variant, in declaration order. Used to tell an
    /// unknown instruction kind apart from other malformed input before
    /// typed deserialization rejects both.
    pub const KINDS: [&'static str; 8] = [
        "RegisterDomain",
        "RegisterAccount",
        "RegisterAsset",
        "MintAsset",
        "BurnAsset",
        "TransferAsset",
        "GrantRole",
        "RevokeRole",
    ];

    /// The variant name, which doubles as the permission token required to
    /// execute it.
    pub fn kind(&self) -> &'static str {
        match self {
            Instruction::RegisterDomain { .. } => "RegisterDomain",
            Instruction::RegisterAccount { .. } => "RegisterAccount",
            Instruction::RegisterAsset { .. } => "RegisterAsset",
            Instruction::MintAsset { .. } => "MintAsset",
            Instruction::BurnAsset { .. } => "BurnAsset",
            Instruction::TransferAsset { .. } => "TransferAsset",
            Instruction::GrantRole { .. } => "GrantRole",
            Instruction::RevokeRole { .. } => "RevokeRole",
        }
    }

    pub fn required_permission(&self) -> &'static str {
        self.kind()
    }
}

/// The signed portion of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionBody {
    pub chain_id: String,
    pub signer_id: String,
    pub nonce: u64,
    pub created_at: u64,
    pub instructions: Vec<Instruction>,
}

/// Detached signature plus the key that produced it, both base58; the public
/// key carries the `ed25519:` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionSignature {
    pub public_key: String,
    pub signature: String,
}

/// A signed envelope carrying a nonced, chain-scoped instruction list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub body: TransactionBody,
    pub signature: TransactionSignature,
}

impl Transaction {
    /// Signs a body with the given keypair, producing a complete transaction.
    pub fn sign(body: TransactionBody, keypair: &KeyPair) -> Result<Self, serde_json::Error> {
        let message = crate::crypto::canonical(&body)?;
        let signature = keypair.sign(message.as_bytes());
        Ok(Transaction {
            body,
            signature: TransactionSignature {
                public_key: keypair.public_key(),
                signature,
            },
        })
    }

    /// Content hash identifying this transaction: the hash of the canonical
    /// body.
    pub fn hash(&self) -> Result<String, serde_json::Error> {
        canonical_hash(&self.body)
    }

    /// Checks the carried signature over the canonical body against the
    /// carried public key. Key registration is checked separately by the
    /// validator.
    pub fn verify_signature(&self) -> bool {
        let Ok(message) = crate::crypto::canonical(&self.body) else {
            return false;
        };
        crate::crypto::verify(
            &self.signature.public_key,
            &self.signature.signature,
            message.as_bytes(),
        )
    }

    /// Size of the wire form in bytes; used for block byte budgets.
    pub fn byte_len(&self) -> usize {
        serde_json::to_string(self).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(nonce: u64) -> TransactionBody {
        TransactionBody {
            chain_id: "miniroha-test".into(),
            signer_id: "alice@root".into(),
            nonce,
            created_at: 1_700_000_000_000,
            instructions: vec![Instruction::TransferAsset {
                asset_id: "usd#root".into(),
                src_account_id: "alice@root".into(),
                dest_account_id: "bob@root".into(),
                amount: "100".into(),
            }],
        }
    }

    #[test]
    fn test_sign_then_verify() {
        let keypair = KeyPair::generate();
        let tx = Transaction::sign(body(1), &keypair).unwrap();
        assert!(tx.verify_signature());
    }

    #[test]
    fn test_mutated_body_fails_verification() {
        let keypair = KeyPair::generate();
        let mut tx = Transaction::sign(body(1), &keypair).unwrap();
        tx.body.nonce = 2;
        assert!(!tx.verify_signature());
    }

    #[test]
    fn test_hash_depends_only_on_body() {
        let keypair = KeyPair::generate();
        let other = KeyPair::generate();
        let a = Transaction::sign(body(1), &keypair).unwrap();
        let b = Transaction::sign(body(1), &other).unwrap();
        assert_eq!(a.hash().unwrap(), b.hash().unwrap());
        let c = Transaction::sign(body(2), &keypair).unwrap();
        assert_ne!(a.hash().unwrap(), c.hash().unwrap());
    }

    #[test]
    fn test_instruction_wire_tag_is_variant_name() {
        let instruction = Instruction::MintAsset {
            asset_id: "usd#root".into(),
            account_id: "alice@root".into(),
            amount: "1".into(),
        };
        let json = serde_json::to_value(&instruction).unwrap();
        assert_eq!(json["type"], "MintAsset");
        assert_eq!(instruction.required_permission(), "MintAsset");

        let back: Instruction = serde_json::from_value(json).unwrap();
        assert_eq!(back, instruction);
    }

    #[test]
    fn test_unknown_instruction_tag_rejected() {
        let result: Result<Instruction, _> =
            serde_json::from_str(r#"{"type":"DestroyDomain","domain_id":"root"}"#);
        assert!(result.is_err());
        assert!(!Instruction::KINDS.contains(&"DestroyDomain"));
    }

    #[test]
    fn test_kinds_match_variant_names() {
        let samples = [
            Instruction::RegisterDomain {
                domain_id: "d".into(),
            },
            Instruction::RegisterAccount {
                account_id: "a@d".into(),
                public_key: "ed25519:k".into(),
            },
            Instruction::RegisterAsset {
                asset_id: "x#d".into(),
                precision: 0,
            },
            Instruction::MintAsset {
                asset_id: "x#d".into(),
                account_id: "a@d".into(),
                amount: "1".into(),
            },
            Instruction::BurnAsset {
                asset_id: "x#d".into(),
                account_id: "a@d".into(),
                amount: "1".into(),
            },
            Instruction::TransferAsset {
                asset_id: "x#d".into(),
                src_account_id: "a@d".into(),
                dest_account_id: "b@d".into(),
                amount: "1".into(),
            },
            Instruction::GrantRole {
                role_id: "r".into(),
                account_id: "a@d".into(),
            },
            Instruction::RevokeRole {
                role_id: "r".into(),
                account_id: "a@d".into(),
            },
        ];
        let kinds: Vec<&str> = samples.iter().map(|i| i.kind()).collect();
        assert_eq!(kinds, Instruction::KINDS);
    }
}
