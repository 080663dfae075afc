//! Ledger entities and identifier parsing
//!
//! Domains, accounts, assets, balances, roles, and validators, plus the
//! identifier grammar (`name@domain`, `symbol#domain`) and the conversion of
//! decimal amount strings into integer smallest units.

use crate::error::StateError;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};

/// Maximum domain id length in characters.
pub const MAX_DOMAIN_ID_LEN: usize = 64;

/// Maximum asset precision (decimal places).
pub const MAX_PRECISION: u32 = 18;

/// Permission token granting every instruction.
pub const WILDCARD_PERMISSION: &str = "*";

/// A top-level namespace containing accounts and assets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub id: String,
    pub created_at: u64,
}

/// A named identity within a domain, bound to a public key.
///
/// Role membership lives under a separate `account_roles/<id>` key so that
/// grant/revoke does not rewrite the account record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub public_key: String,
    pub created_at: u64,
}

/// A fungible token class scoped to a domain, with fixed decimal precision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub precision: u32,
    pub created_at: u64,
}

/// A per-account holding of one asset, in that asset's smallest unit.
///
/// The amount is arbitrary-precision; it is serialized as a decimal string so
/// the canonical JSON form never overflows a machine integer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub asset_id: String,
    pub account_id: String,
    #[serde(with = "biguint_decimal")]
    pub amount: BigUint,
}

/// A named set of permission tokens. A token is either `*` or the exact name
/// of an instruction variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: String,
    pub permissions: Vec<String>,
}

impl Role {
    pub fn allows(&self, permission: &str) -> bool {
        self.permissions
            .iter()
            .any(|p| p == WILDCARD_PERMISSION || p == permission)
    }
}

/// A consensus participant: stable id plus signing key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    pub id: String,
    pub public_key: String,
}

/// A parsed `name@domain` account identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountId<'a> {
    pub name: &'a str,
    pub domain: &'a str,
}

/// A parsed `symbol#domain` asset identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetId<'a> {
    pub symbol: &'a str,
    pub domain: &'a str,
}

/// Splits `name@domain`, requiring exactly one `@` and both parts non-empty.
pub fn parse_account_id(id: &str) -> Option<AccountId<'_>> {
    let mut parts = id.split('@');
    let name = parts.next()?;
    let domain = parts.next()?;
    if parts.next().is_some() || name.is_empty() || domain.is_empty() {
        return None;
    }
    Some(AccountId { name, domain })
}

/// Splits `symbol#domain`, requiring exactly one `#` and both parts non-empty.
pub fn parse_asset_id(id: &str) -> Option<AssetId<'_>> {
    let mut parts = id.split('#');
    let symbol = parts.next()?;
    let domain = parts.next()?;
    if parts.next().is_some() || symbol.is_empty() || domain.is_empty() {
        return None;
    }
    Some(AssetId { symbol, domain })
}

/// Checks the domain id grammar: 1..=64 printable characters, no `@` or `#`.
pub fn is_valid_domain_id(id: &str) -> bool {
    !id.is_empty()
        && id.chars().count() <= MAX_DOMAIN_ID_LEN
        && id
            .chars()
            .all(|c| !c.is_control() && !c.is_whitespace() && c != '@' && c != '#')
}

/// Checks the amount grammar `^\d+(\.\d+)?$` without converting.
pub fn is_valid_amount_str(amount: &str) -> bool {
    let (int_part, frac_part) = match amount.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (amount, None),
    };
    if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    match frac_part {
        Some(f) => !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()),
        None => true,
    }
}

/// Converts a decimal amount string into smallest units for an asset with the
/// given precision.
///
/// The fractional tail may not exceed the precision; it is right-padded with
/// zeros to exactly `precision` digits, concatenated onto the integer part,
/// and parsed as an arbitrary-precision integer.
pub fn parse_amount(amount: &str, precision: u32) -> Result<BigUint, StateError> {
    if !is_valid_amount_str(amount) {
        return Err(StateError::InvalidAmount(amount.to_string()));
    }
    let (int_part, frac_part) = match amount.split_once('.') {
        Some((i, f)) => (i, f),
        None => (amount, ""),
    };
    if frac_part.len() > precision as usize {
        return Err(StateError::PrecisionExceeded {
            amount: amount.to_string(),
            precision,
        });
    }
    let mut digits = String::with_capacity(int_part.len() + precision as usize);
    digits.push_str(int_part);
    digits.push_str(frac_part);
    for _ in frac_part.len()..precision as usize {
        digits.push('0');
    }
    BigUint::parse_bytes(digits.as_bytes(), 10)
        .ok_or_else(|| StateError::InvalidAmount(amount.to_string()))
}

/// Serde adapter storing a `BigUint` as a decimal string.
pub mod biguint_decimal {
    use num_bigint::BigUint;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_str_radix(10))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigUint, D::Error> {
        let text = String::deserialize(deserializer)?;
        BigUint::parse_bytes(text.as_bytes(), 10)
            .ok_or_else(|| de::Error::custom(format!("not a decimal integer: {}", text)))
    }
}
