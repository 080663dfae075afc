//! Error types for Miniroha
//!
//! Errors form a flat taxonomy, one enum per component boundary: transaction
//! admission (`ValidationError`), instruction execution (`StateError`),
//! consensus message handling (`ConsensusError`), and the backing store
//! (`StorageError`).

use std::fmt;

/// Rejection reasons reported by the transaction validator.
///
/// Each variant carries a stable code that is surfaced verbatim on the API so
/// clients can match on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    InvalidSignature,
    MissingChainId,
    MissingSignerId,
    InvalidNonce { submitted: u64, last_seen: u64 },
    InvalidCreatedAt,
    InvalidInstructions,
    InvalidSignerFormat(String),
    InvalidDomainId(String),
    InvalidDomainLength(String),
    InvalidAccountId(String),
    InvalidAccountFormat(String),
    InvalidPublicKey(String),
    InvalidAssetId(String),
    InvalidAssetFormat(String),
    InvalidPrecision(u32),
    InvalidAmount(String),
    InvalidAmountFormat(String),
    InvalidSrcAccount(String),
    InvalidDestAccount(String),
    InvalidRoleId(String),
    PermissionDenied(String),
    UnknownInstruction(String),
}

impl ValidationError {
    /// Stable machine-readable code for this rejection.
    pub fn code(&self) -> &'static str {
        match self {
            ValidationError::InvalidSignature => "INVALID_SIGNATURE",
            ValidationError::MissingChainId => "MISSING_CHAIN_ID",
            ValidationError::MissingSignerId => "MISSING_SIGNER_ID",
            ValidationError::InvalidNonce { .. } => "INVALID_NONCE",
            ValidationError::InvalidCreatedAt => "INVALID_CREATED_AT",
            ValidationError::InvalidInstructions => "INVALID_INSTRUCTIONS",
            ValidationError::InvalidSignerFormat(_) => "INVALID_SIGNER_FORMAT",
            ValidationError::InvalidDomainId(_) => "INVALID_DOMAIN_ID",
            ValidationError::InvalidDomainLength(_) => "INVALID_DOMAIN_LENGTH",
            ValidationError::InvalidAccountId(_) => "INVALID_ACCOUNT_ID",
            ValidationError::InvalidAccountFormat(_) => "INVALID_ACCOUNT_FORMAT",
            ValidationError::InvalidPublicKey(_) => "INVALID_PUBLIC_KEY",
            ValidationError::InvalidAssetId(_) => "INVALID_ASSET_ID",
            ValidationError::InvalidAssetFormat(_) => "INVALID_ASSET_FORMAT",
            ValidationError::InvalidPrecision(_) => "INVALID_PRECISION",
            ValidationError::InvalidAmount(_) => "INVALID_AMOUNT",
            ValidationError::InvalidAmountFormat(_) => "INVALID_AMOUNT_FORMAT",
            ValidationError::InvalidSrcAccount(_) => "INVALID_SRC_ACCOUNT",
            ValidationError::InvalidDestAccount(_) => "INVALID_DEST_ACCOUNT",
            ValidationError::InvalidRoleId(_) => "INVALID_ROLE_ID",
            ValidationError::PermissionDenied(_) => "PERMISSION_DENIED",
            ValidationError::UnknownInstruction(_) => "UNKNOWN_INSTRUCTION",
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValidationError::InvalidSignature => write!(f, "signature verification failed"),
            ValidationError::MissingChainId => write!(f, "chain id is missing"),
            ValidationError::MissingSignerId => write!(f, "signer id is missing"),
            ValidationError::InvalidNonce { submitted, last_seen } => write!(
                f,
                "nonce {} is not greater than last seen nonce {}",
                submitted, last_seen
            ),
            ValidationError::InvalidCreatedAt => write!(f, "created_at must be positive"),
            ValidationError::InvalidInstructions => {
                write!(f, "instructions must be a non-empty list")
            }
            ValidationError::InvalidSignerFormat(id) => {
                write!(f, "signer id {} is not of the form name@domain", id)
            }
            ValidationError::InvalidDomainId(id) => write!(f, "invalid domain id: {}", id),
            ValidationError::InvalidDomainLength(id) => {
                write!(f, "domain id length out of range: {}", id)
            }
            ValidationError::InvalidAccountId(id) => write!(f, "invalid account id: {}", id),
            ValidationError::InvalidAccountFormat(id) => {
                write!(f, "account id {} is not of the form name@domain", id)
            }
            ValidationError::InvalidPublicKey(key) => write!(f, "invalid public key: {}", key),
            ValidationError::InvalidAssetId(id) => write!(f, "invalid asset id: {}", id),
            ValidationError::InvalidAssetFormat(id) => {
                write!(f, "asset id {} is not of the form symbol#domain", id)
            }
            ValidationError::InvalidPrecision(p) => {
                write!(f, "precision {} is outside [0, 18]", p)
            }
            ValidationError::InvalidAmount(a) => write!(f, "invalid amount: {}", a),
            ValidationError::InvalidAmountFormat(a) => {
                write!(f, "amount {} is not a decimal number", a)
            }
            ValidationError::InvalidSrcAccount(id) => {
                write!(f, "invalid source account id: {}", id)
            }
            ValidationError::InvalidDestAccount(id) => {
                write!(f, "invalid destination account id: {}", id)
            }
            ValidationError::InvalidRoleId(id) => write!(f, "invalid role id: {}", id),
            ValidationError::PermissionDenied(perm) => {
                write!(f, "signer lacks permission {}", perm)
            }
            ValidationError::UnknownInstruction(kind) => {
                write!(f, "unknown instruction kind: {}", kind)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Failures raised by the instruction engine while executing against state.
///
/// A failing instruction fails its whole transaction; the block applier
/// recovers by dropping that transaction and keeping the rest of the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    AlreadyExists(String),
    NotFound(String),
    DomainNotFound(String),
    MalformedId(String),
    InvalidPrecision(u32),
    InvalidAmount(String),
    PrecisionExceeded { amount: String, precision: u32 },
    InsufficientBalance {
        asset_id: String,
        account_id: String,
        needed: String,
        available: String,
    },
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StateError::AlreadyExists(id) => write!(f, "{} already exists", id),
            StateError::NotFound(id) => write!(f, "{} not found", id),
            StateError::DomainNotFound(id) => write!(f, "domain {} not found", id),
            StateError::MalformedId(id) => write!(f, "malformed id: {}", id),
            StateError::InvalidPrecision(p) => write!(f, "precision {} is outside [0, 18]", p),
            StateError::InvalidAmount(a) => write!(f, "invalid amount: {}", a),
            StateError::PrecisionExceeded { amount, precision } => write!(
                f,
                "amount {} has more fractional digits than precision {}",
                amount, precision
            ),
            StateError::InsufficientBalance {
                asset_id,
                account_id,
                needed,
                available,
            } => write!(
                f,
                "insufficient balance of {} on {}: need {}, have {}",
                asset_id, account_id, needed, available
            ),
        }
    }
}

impl std::error::Error for StateError {}

/// Reasons for dropping a consensus message.
///
/// These are logged and discarded; the engine never propagates them across
/// its event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    UnknownValidator(String),
    InvalidProposer { expected: String, got: String },
    InvalidSignature(String),
    StaleMessage { height: u64, round: u64 },
    BlockVerificationFailed(String),
}

impl fmt::Display for ConsensusError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConsensusError::UnknownValidator(id) => write!(f, "unknown validator: {}", id),
            ConsensusError::InvalidProposer { expected, got } => {
                write!(f, "invalid proposer: expected {}, got {}", expected, got)
            }
            ConsensusError::InvalidSignature(id) => {
                write!(f, "invalid consensus signature from {}", id)
            }
            ConsensusError::StaleMessage { height, round } => {
                write!(f, "stale message for height {} round {}", height, round)
            }
            ConsensusError::BlockVerificationFailed(msg) => {
                write!(f, "block verification failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConsensusError {}

/// Failure of the backing key-value store. Always fatal to the current
/// handler; the store's atomic batches guarantee no partial effect.
#[derive(Debug, Clone)]
pub struct StorageError(pub String);

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "storage error: {}", self.0)
    }
}

impl std::error::Error for StorageError {}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError(format!("serialization: {}", err))
    }
}

/// Convenience alias for fallible store operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
