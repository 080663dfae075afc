//! Genesis bootstrap
//!
//! Installs block 1 and the initial entity set from a genesis config in one
//! atomic batch. Bootstrapping an already-bootstrapped store is a no-op, so
//! node start is idempotent.

use crate::chain::block::{Block, BlockHeader, GENESIS_PREV_HASH, GENESIS_PROPOSER};
use crate::crypto::decode_public_key;
use crate::entities::{
    is_valid_domain_id, parse_account_id, parse_asset_id, Account, Asset, Balance, Domain, Role,
    Validator, MAX_PRECISION, WILDCARD_PERMISSION,
};
use crate::error::{StorageError, StorageResult};
use crate::state::{keys, StateStore, WorkingState};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Role name that must exist in every genesis config and carry the wildcard.
pub const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisAccount {
    pub id: String,
    pub public_key: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisAsset {
    pub id: String,
    pub precision: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisBalance {
    pub asset_id: String,
    pub account_id: String,
    /// Decimal integer, already in the asset's smallest unit.
    pub amount: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisRole {
    pub id: String,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisValidator {
    pub id: String,
    pub public_key: String,
}

/// Complete initial chain state: namespaces, identities, assets, holdings,
/// roles, and the validator set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub chain_id: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub accounts: Vec<GenesisAccount>,
    #[serde(default)]
    pub assets: Vec<GenesisAsset>,
    #[serde(default)]
    pub balances: Vec<GenesisBalance>,
    #[serde(default)]
    pub roles: Vec<GenesisRole>,
    #[serde(default)]
    pub validators: Vec<GenesisValidator>,
}

#[derive(Debug, Clone)]
pub enum GenesisError {
    Invalid(String),
    Storage(StorageError),
}

impl fmt::Display for GenesisError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GenesisError::Invalid(msg) => write!(f, "invalid genesis config: {}", msg),
            GenesisError::Storage(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for GenesisError {}

impl From<StorageError> for GenesisError {
    fn from(err: StorageError) -> Self {
        GenesisError::Storage(err)
    }
}

fn invalid(msg: impl Into<String>) -> GenesisError {
    GenesisError::Invalid(msg.into())
}

/// A chain exists once block 1 does.
pub fn is_bootstrapped(state: &StateStore) -> StorageResult<bool> {
    Ok(state.last_height()? > 0)
}

/// Referential-integrity validation of the config itself, before anything is
/// written.
pub fn validate(config: &GenesisConfig) -> Result<(), GenesisError> {
    if config.chain_id.is_empty() {
        return Err(invalid("chain_id must be non-empty"));
    }

    let mut domains = HashSet::new();
    for domain in &config.domains {
        if !is_valid_domain_id(domain) {
            return Err(invalid(format!("bad domain id {}", domain)));
        }
        if !domains.insert(domain.as_str()) {
            return Err(invalid(format!("duplicate domain {}", domain)));
        }
    }

    let mut roles = HashSet::new();
    for role in &config.roles {
        if role.id.is_empty() {
            return Err(invalid("role id must be non-empty"));
        }
        if !roles.insert(role.id.as_str()) {
            return Err(invalid(format!("duplicate role {}", role.id)));
        }
    }
    let admin_has_wildcard = config
        .roles
        .iter()
        .any(|r| r.id == ADMIN_ROLE && r.permissions.iter().any(|p| p == WILDCARD_PERMISSION));
    if !admin_has_wildcard {
        return Err(invalid("an admin role containing * is required"));
    }

    let mut accounts = HashSet::new();
    let mut admin_held = false;
    for account in &config.accounts {
        let parsed = parse_account_id(&account.id)
            .ok_or_else(|| invalid(format!("bad account id {}", account.id)))?;
        if !domains.contains(parsed.domain) {
            return Err(invalid(format!(
                "account {} references missing domain {}",
                account.id, parsed.domain
            )));
        }
        if decode_public_key(&account.public_key).is_none() {
            return Err(invalid(format!("bad public key on account {}", account.id)));
        }
        if !accounts.insert(account.id.as_str()) {
            return Err(invalid(format!("duplicate account {}", account.id)));
        }
        for role in &account.roles {
            if !roles.contains(role.as_str()) {
                return Err(invalid(format!(
                    "account {} references missing role {}",
                    account.id, role
                )));
            }
            if role == ADMIN_ROLE {
                admin_held = true;
            }
        }
    }
    if !admin_held {
        return Err(invalid("at least one account must hold the admin role"));
    }

    let mut assets = HashSet::new();
    for asset in &config.assets {
        let parsed = parse_asset_id(&asset.id)
            .ok_or_else(|| invalid(format!("bad asset id {}", asset.id)))?;
        if !domains.contains(parsed.domain) {
            return Err(invalid(format!(
                "asset {} references missing domain {}",
                asset.id, parsed.domain
            )));
        }
        if asset.precision > MAX_PRECISION {
            return Err(invalid(format!("asset {} precision out of range", asset.id)));
        }
        if !assets.insert(asset.id.as_str()) {
            return Err(invalid(format!("duplicate asset {}", asset.id)));
        }
    }

    for balance in &config.balances {
        if !assets.contains(balance.asset_id.as_str()) {
            return Err(invalid(format!(
                "balance references missing asset {}",
                balance.asset_id
            )));
        }
        if !accounts.contains(balance.account_id.as_str()) {
            return Err(invalid(format!(
                "balance references missing account {}",
                balance.account_id
            )));
        }
        if balance.amount.is_empty() || !balance.amount.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid(format!(
                "balance amount {} is not a decimal integer",
                balance.amount
            )));
        }
    }

    if config.validators.is_empty() {
        return Err(invalid("at least one validator is required"));
    }
    let mut validators = HashSet::new();
    for validator in &config.validators {
        if validator.id.is_empty() {
            return Err(invalid("validator id must be non-empty"));
        }
        if decode_public_key(&validator.public_key).is_none() {
            return Err(invalid(format!(
                "bad public key on validator {}",
                validator.id
            )));
        }
        if !validators.insert(validator.id.as_str()) {
            return Err(invalid(format!("duplicate validator {}", validator.id)));
        }
    }

    Ok(())
}

/// Installs the genesis state and block 1 in one atomic batch.
///
/// Returns `false` without touching the store when the chain already exists.
/// Entity timestamps and the block timestamp are fixed at zero so every node
/// bootstrapping from the same config derives the identical block.
pub fn bootstrap(state: &StateStore, config: &GenesisConfig) -> Result<bool, GenesisError> {
    if is_bootstrapped(state)? {
        return Ok(false);
    }
    validate(config)?;

    let mut ws = WorkingState::new(state, 0);

    for domain in &config.domains {
        ws.put(
            keys::domain(domain),
            &Domain {
                id: domain.clone(),
                created_at: 0,
            },
        )?;
    }
    for role in &config.roles {
        ws.put(
            keys::role(&role.id),
            &Role {
                id: role.id.clone(),
                permissions: role.permissions.clone(),
            },
        )?;
    }
    for account in &config.accounts {
        ws.put(
            keys::account(&account.id),
            &Account {
                id: account.id.clone(),
                public_key: account.public_key.clone(),
                created_at: 0,
            },
        )?;
        if !account.roles.is_empty() {
            ws.put(keys::account_roles(&account.id), &account.roles)?;
        }
    }
    for asset in &config.assets {
        ws.put(
            keys::asset(&asset.id),
            &Asset {
                id: asset.id.clone(),
                precision: asset.precision,
                created_at: 0,
            },
        )?;
    }
    for balance in &config.balances {
        let amount = BigUint::parse_bytes(balance.amount.as_bytes(), 10)
            .ok_or_else(|| invalid(format!("balance amount {}", balance.amount)))?;
        if amount == BigUint::default() {
            continue;
        }
        ws.put(
            keys::balance(&balance.asset_id, &balance.account_id),
            &Balance {
                asset_id: balance.asset_id.clone(),
                account_id: balance.account_id.clone(),
                amount,
            },
        )?;
    }
    for validator in &config.validators {
        ws.put(
            keys::validator(&validator.id),
            &Validator {
                id: validator.id.clone(),
                public_key: validator.public_key.clone(),
            },
        )?;
    }

    let genesis_block = Block {
        header: BlockHeader {
            height: 1,
            prev_hash: GENESIS_PREV_HASH.to_string(),
            timestamp: 0,
        },
        transactions: vec![],
        proposer_id: GENESIS_PROPOSER.to_string(),
        signature: String::new(),
    };
    let block_hash = genesis_block.hash().map_err(StorageError::from)?;

    ws.put(keys::block(1), &genesis_block)?;
    ws.put(keys::block_by_hash(&block_hash), &1u64)?;
    ws.put(keys::CHAIN_ID.to_string(), &config.chain_id)?;
    ws.put(keys::LAST_HEIGHT.to_string(), &1u64)?;

    state.kv().apply(ws.into_batch()).map_err(GenesisError::from)?;
    Ok(true)
}
