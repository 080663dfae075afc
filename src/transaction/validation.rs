/// Admission checks for transactions, separated from type definitions
///
/// Checks run in a fixed order, stopping at the first failure: signature,
/// structure, nonce, permissions, then per-instruction shape validation.
/// Validation is read-only; the persisted per-signer nonce is the source of
/// truth, not the mempool.
use crate::crypto::decode_public_key;
use crate::entities::{
    is_valid_amount_str, is_valid_domain_id, parse_account_id, parse_asset_id,
    WILDCARD_PERMISSION, MAX_DOMAIN_ID_LEN, MAX_PRECISION,
};
use crate::error::{StorageError, ValidationError};
use crate::state::StateStore;
use crate::transaction::types::{Instruction, Transaction};
use std::collections::HashSet;
use std::fmt;

/// Outcome of admission: a typed rejection the client can act on, or a
/// backing-store failure that aborts the handler.
#[derive(Debug)]
pub enum AdmissionError {
    Rejected(ValidationError),
    Storage(StorageError),
}

impl From<ValidationError> for AdmissionError {
    fn from(err: ValidationError) -> Self {
        AdmissionError::Rejected(err)
    }
}

impl From<StorageError> for AdmissionError {
    fn from(err: StorageError) -> Self {
        AdmissionError::Storage(err)
    }
}

impl fmt::Display for AdmissionError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AdmissionError::Rejected(e) => write!(f, "{}", e),
            AdmissionError::Storage(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for AdmissionError {}

/// Read-only transaction validator over committed state.
pub struct TransactionValidator<'a> {
    state: &'a StateStore,
}

impl<'a> TransactionValidator<'a> {
    pub fn new(state: &'a StateStore) -> Self {
        TransactionValidator { state }
    }

    pub fn validate(&self, tx: &Transaction) -> Result<(), AdmissionError> {
        self.check_signature(tx)?;
        self.check_structure(tx)?;
        self.check_nonce(tx)?;
        self.check_permissions(tx)?;
        for instruction in &tx.body.instructions {
            validate_instruction(instruction)?;
        }
        Ok(())
    }

    /// The signature must verify over the canonical body and the carried
    /// public key must be the signer account's registered key. A signer not
    /// yet in state is rejected outright; genesis paths do not come through
    /// here.
    fn check_signature(&self, tx: &Transaction) -> Result<(), AdmissionError> {
        let Some(account) = self.state.get_account(&tx.body.signer_id)? else {
            return Err(ValidationError::InvalidSignature.into());
        };
        if account.public_key != tx.signature.public_key {
            return Err(ValidationError::InvalidSignature.into());
        }
        if !tx.verify_signature() {
            return Err(ValidationError::InvalidSignature.into());
        }
        Ok(())
    }

    fn check_structure(&self, tx: &Transaction) -> Result<(), AdmissionError> {
        let body = &tx.body;
        if body.chain_id.is_empty() {
            return Err(ValidationError::MissingChainId.into());
        }
        if body.signer_id.is_empty() {
            return Err(ValidationError::MissingSignerId.into());
        }
        if parse_account_id(&body.signer_id).is_none() {
            return Err(ValidationError::InvalidSignerFormat(body.signer_id.clone()).into());
        }
        if body.instructions.is_empty() {
            return Err(ValidationError::InvalidInstructions.into());
        }
        if body.created_at == 0 {
            return Err(ValidationError::InvalidCreatedAt.into());
        }
        Ok(())
    }

    /// Strict monotonicity per signer, persisted across blocks and restarts.
    fn check_nonce(&self, tx: &Transaction) -> Result<(), AdmissionError> {
        let last_seen = self.state.last_seen_nonce(&tx.body.signer_id)?;
        if tx.body.nonce <= last_seen {
            return Err(ValidationError::InvalidNonce {
                submitted: tx.body.nonce,
                last_seen,
            }
            .into());
        }
        Ok(())
    }

    /// Every instruction's required permission must lie in the union of the
    /// signer's role permissions; the wildcard passes everything.
    fn check_permissions(&self, tx: &Transaction) -> Result<(), AdmissionError> {
        let role_ids = self.state.get_account_roles(&tx.body.signer_id)?;
        let mut permissions: HashSet<String> = HashSet::new();
        for role_id in &role_ids {
            if let Some(role) = self.state.get_role(role_id)? {
                permissions.extend(role.permissions);
            }
        }
        if permissions.contains(WILDCARD_PERMISSION) {
            return Ok(());
        }
        for instruction in &tx.body.instructions {
            let required = instruction.required_permission();
            if !permissions.contains(required) {
                return Err(ValidationError::PermissionDenied(required.to_string()).into());
            }
        }
        Ok(())
    }
}

fn validate_domain_id_shape(domain_id: &str) -> Result<(), ValidationError> {
    if domain_id.is_empty() || domain_id.chars().count() > MAX_DOMAIN_ID_LEN {
        return Err(ValidationError::InvalidDomainLength(domain_id.to_string()));
    }
    if !is_valid_domain_id(domain_id) {
        return Err(ValidationError::InvalidDomainId(domain_id.to_string()));
    }
    Ok(())
}

fn validate_account_id_shape(
    account_id: &str,
    err: fn(String) -> ValidationError,
) -> Result<(), ValidationError> {
    if account_id.is_empty() {
        return Err(ValidationError::InvalidAccountId(account_id.to_string()));
    }
    if parse_account_id(account_id).is_none() {
        return Err(err(account_id.to_string()));
    }
    Ok(())
}

fn validate_asset_id_shape(asset_id: &str) -> Result<(), ValidationError> {
    if asset_id.is_empty() {
        return Err(ValidationError::InvalidAssetId(asset_id.to_string()));
    }
    if parse_asset_id(asset_id).is_none() {
        return Err(ValidationError::InvalidAssetFormat(asset_id.to_string()));
    }
    Ok(())
}

fn validate_amount_shape(amount: &str) -> Result<(), ValidationError> {
    if amount.is_empty() {
        return Err(ValidationError::InvalidAmount(amount.to_string()));
    }
    if !is_valid_amount_str(amount) {
        return Err(ValidationError::InvalidAmountFormat(amount.to_string()));
    }
    Ok(())
}

/// Stateless shape checks for one instruction: identifier grammars, precision
/// range, amount syntax. Existence and balance checks belong to the engine.
pub fn validate_instruction(instruction: &Instruction) -> Result<(), ValidationError> {
    match instruction {
        Instruction::RegisterDomain { domain_id } => validate_domain_id_shape(domain_id),

        Instruction::RegisterAccount {
            account_id,
            public_key,
        } => {
            validate_account_id_shape(account_id, ValidationError::InvalidAccountFormat)?;
            if decode_public_key(public_key).is_none() {
                return Err(ValidationError::InvalidPublicKey(public_key.clone()));
            }
            Ok(())
        }

        Instruction::RegisterAsset {
            asset_id,
            precision,
        } => {
            validate_asset_id_shape(asset_id)?;
            if *precision > MAX_PRECISION {
                return Err(ValidationError::InvalidPrecision(*precision));
            }
            Ok(())
        }

        Instruction::MintAsset {
            asset_id,
            account_id,
            amount,
        }
        | Instruction::BurnAsset {
            asset_id,
            account_id,
            amount,
        } => {
            validate_asset_id_shape(asset_id)?;
            validate_account_id_shape(account_id, ValidationError::InvalidAccountFormat)?;
            validate_amount_shape(amount)
        }

        Instruction::TransferAsset {
            asset_id,
            src_account_id,
            dest_account_id,
            amount,
        } => {
            validate_asset_id_shape(asset_id)?;
            validate_account_id_shape(src_account_id, ValidationError::InvalidSrcAccount)?;
            validate_account_id_shape(dest_account_id, ValidationError::InvalidDestAccount)?;
            validate_amount_shape(amount)
        }

        Instruction::GrantRole {
            role_id,
            account_id,
        }
        | Instruction::RevokeRole {
            role_id,
            account_id,
        } => {
            if role_id.is_empty() {
                return Err(ValidationError::InvalidRoleId(role_id.clone()));
            }
            validate_account_id_shape(account_id, ValidationError::InvalidAccountFormat)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{canonical, KeyPair};
    use crate::entities::{Account, Domain, Role};
    use crate::state::keys;
    use crate::store::{KvStore, MemoryStore};
    use crate::transaction::types::{TransactionBody, TransactionSignature};
    use std::sync::Arc;

    fn put<T: serde::Serialize>(kv: &dyn KvStore, key: &str, value: &T) {
        kv.put(key, &canonical(value).unwrap()).unwrap();
    }

    /// One account `alice@root` holding `user = [TransferAsset]`, signed by
    /// `keypair`.
    fn fixture() -> (StateStore, KeyPair) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let keypair = KeyPair::generate();
        put(kv.as_ref(), keys::CHAIN_ID, &"miniroha-test");
        put(
            kv.as_ref(),
            &keys::domain("root"),
            &Domain {
                id: "root".into(),
                created_at: 1,
            },
        );
        put(
            kv.as_ref(),
            &keys::account("alice@root"),
            &Account {
                id: "alice@root".into(),
                public_key: keypair.public_key(),
                created_at: 1,
            },
        );
        put(
            kv.as_ref(),
            &keys::role("user"),
            &Role {
                id: "user".into(),
                permissions: vec!["TransferAsset".into()],
            },
        );
        put(
            kv.as_ref(),
            &keys::account_roles("alice@root"),
            &vec!["user".to_string()],
        );
        (StateStore::new(kv), keypair)
    }

    fn transfer_body(nonce: u64) -> TransactionBody {
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

    fn rejected(result: Result<(), AdmissionError>) -> ValidationError {
        match result {
            Err(AdmissionError::Rejected(e)) => e,
            other => panic!("expected rejection, got {:?}", other.err().map(|e| e.to_string())),
        }
    }

    #[test]
    fn test_valid_transaction_passes() {
        let (state, keypair) = fixture();
        let tx = Transaction::sign(transfer_body(1), &keypair).unwrap();
        TransactionValidator::new(&state).validate(&tx).unwrap();
    }

    #[test]
    fn test_unknown_signer_rejected_at_signature_step() {
        let (state, keypair) = fixture();
        let mut body = transfer_body(1);
        body.signer_id = "ghost@root".into();
        let tx = Transaction::sign(body, &keypair).unwrap();
        let err = rejected(TransactionValidator::new(&state).validate(&tx));
        assert_eq!(err, ValidationError::InvalidSignature);
    }

    #[test]
    fn test_foreign_key_rejected() {
        let (state, _) = fixture();
        let other = KeyPair::generate();
        let tx = Transaction::sign(transfer_body(1), &other).unwrap();
        let err = rejected(TransactionValidator::new(&state).validate(&tx));
        assert_eq!(err, ValidationError::InvalidSignature);
    }

    #[test]
    fn test_tampered_body_rejected() {
        let (state, keypair) = fixture();
        let mut tx = Transaction::sign(transfer_body(1), &keypair).unwrap();
        tx.body.created_at += 1;
        let err = rejected(TransactionValidator::new(&state).validate(&tx));
        assert_eq!(err, ValidationError::InvalidSignature);
    }

    #[test]
    fn test_empty_instructions_rejected() {
        let (state, keypair) = fixture();
        let mut body = transfer_body(1);
        body.instructions.clear();
        let tx = Transaction::sign(body, &keypair).unwrap();
        let err = rejected(TransactionValidator::new(&state).validate(&tx));
        assert_eq!(err, ValidationError::InvalidInstructions);
    }

    #[test]
    fn test_zero_created_at_rejected() {
        let (state, keypair) = fixture();
        let mut body = transfer_body(1);
        body.created_at = 0;
        let tx = Transaction::sign(body, &keypair).unwrap();
        let err = rejected(TransactionValidator::new(&state).validate(&tx));
        assert_eq!(err, ValidationError::InvalidCreatedAt);
    }

    #[test]
    fn test_nonce_must_strictly_increase() {
        let (state, keypair) = fixture();
        state
            .kv()
            .put(&keys::nonce("alice@root"), "5")
            .unwrap();

        let tx = Transaction::sign(transfer_body(5), &keypair).unwrap();
        let err = rejected(TransactionValidator::new(&state).validate(&tx));
        assert_eq!(
            err,
            ValidationError::InvalidNonce {
                submitted: 5,
                last_seen: 5
            }
        );

        let tx = Transaction::sign(transfer_body(6), &keypair).unwrap();
        TransactionValidator::new(&state).validate(&tx).unwrap();
        // Gaps above the last seen nonce are fine.
        let tx = Transaction::sign(transfer_body(100), &keypair).unwrap();
        TransactionValidator::new(&state).validate(&tx).unwrap();
    }

    #[test]
    fn test_permission_denied_without_role() {
        let (state, keypair) = fixture();
        let mut body = transfer_body(1);
        body.instructions = vec![Instruction::MintAsset {
            asset_id: "usd#root".into(),
            account_id: "alice@root".into(),
            amount: "1".into(),
        }];
        let tx = Transaction::sign(body, &keypair).unwrap();
        let err = rejected(TransactionValidator::new(&state).validate(&tx));
        assert_eq!(err, ValidationError::PermissionDenied("MintAsset".into()));
    }

    #[test]
    fn test_wildcard_passes_everything() {
        let (state, keypair) = fixture();
        put(
            state.kv().as_ref(),
            &keys::role("admin"),
            &Role {
                id: "admin".into(),
                permissions: vec!["*".into()],
            },
        );
        put(
            state.kv().as_ref(),
            &keys::account_roles("alice@root"),
            &vec!["admin".to_string()],
        );
        let mut body = transfer_body(1);
        body.instructions = vec![
            Instruction::RegisterDomain {
                domain_id: "finance".into(),
            },
            Instruction::MintAsset {
                asset_id: "usd#root".into(),
                account_id: "alice@root".into(),
                amount: "1".into(),
            },
        ];
        let tx = Transaction::sign(body, &keypair).unwrap();
        TransactionValidator::new(&state).validate(&tx).unwrap();
    }

    #[test]
    fn test_per_instruction_shape_checked_last() {
        let (state, keypair) = fixture();
        let mut body = transfer_body(1);
        body.instructions = vec![Instruction::TransferAsset {
            asset_id: "usd#root".into(),
            src_account_id: "alice@root".into(),
            dest_account_id: "bob@root".into(),
            amount: "10.2.3".into(),
        }];
        let tx = Transaction::sign(body, &keypair).unwrap();
        let err = rejected(TransactionValidator::new(&state).validate(&tx));
        assert_eq!(err, ValidationError::InvalidAmountFormat("10.2.3".into()));
    }

    #[test]
    fn test_instruction_shapes() {
        assert!(validate_instruction(&Instruction::RegisterDomain {
            domain_id: "finance".into()
        })
        .is_ok());
        assert_eq!(
            validate_instruction(&Instruction::RegisterDomain {
                domain_id: "bad@domain".into()
            }),
            Err(ValidationError::InvalidDomainId("bad@domain".into()))
        );
        assert_eq!(
            validate_instruction(&Instruction::RegisterDomain {
                domain_id: "x".repeat(65)
            }),
            Err(ValidationError::InvalidDomainLength("x".repeat(65)))
        );
        assert_eq!(
            validate_instruction(&Instruction::RegisterAccount {
                account_id: "no-at-sign".into(),
                public_key: "ed25519:whatever".into(),
            }),
            Err(ValidationError::InvalidAccountFormat("no-at-sign".into()))
        );
        assert_eq!(
            validate_instruction(&Instruction::RegisterAccount {
                account_id: "dave@root".into(),
                public_key: "not-a-key".into(),
            }),
            Err(ValidationError::InvalidPublicKey("not-a-key".into()))
        );
        assert_eq!(
            validate_instruction(&Instruction::RegisterAsset {
                asset_id: "usd-root".into(),
                precision: 2,
            }),
            Err(ValidationError::InvalidAssetFormat("usd-root".into()))
        );
        assert_eq!(
            validate_instruction(&Instruction::RegisterAsset {
                asset_id: "usd#root".into(),
                precision: 42,
            }),
            Err(ValidationError::InvalidPrecision(42))
        );
        assert_eq!(
            validate_instruction(&Instruction::TransferAsset {
                asset_id: "usd#root".into(),
                src_account_id: "bad".into(),
                dest_account_id: "bob@root".into(),
                amount: "1".into(),
            }),
            Err(ValidationError::InvalidSrcAccount("bad".into()))
        );
        assert_eq!(
            validate_instruction(&Instruction::GrantRole {
                role_id: "".into(),
                account_id: "alice@root".into(),
            }),
            Err(ValidationError::InvalidRoleId("".into()))
        );
    }
}
