//! Miniroha - a permissioned ledger engine with a BFT consensus core
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Deterministic State Machine
//! - [`entities`] - Domains, accounts, assets, balances, roles, validators
//! - [`state`] - Typed state access and the instruction engine
//! - [`transaction`] - Transaction types and admission validation
//!
//! ## Block Pipeline
//! - [`chain`] - Blocks, production, verification, atomic apply, genesis
//! - [`mempool`] - Pending transaction pool
//!
//! ## Consensus
//! - [`consensus`] - Round-based BFT agreement (propose/prevote/precommit)
//!
//! ## Cryptography
//! - [`crypto`] - Ed25519 signatures, base58 encodings, canonical JSON
//!
//! ## Persistence
//! - [`store`] - Key-value store with atomic write batches
//!
//! ## Integration
//! - [`api`] - REST surface (submit, queries, consensus endpoint)
//! - [`node`] - Process orchestration
//!
//! ## Configuration & Utilities
//! - [`config`] - Environment-driven configuration
//! - [`error`] - Error taxonomy

#![forbid(unsafe_code)]

// ============================================================================
// Deterministic State Machine
// ============================================================================
pub mod entities;
pub mod state;
pub mod transaction;

// ============================================================================
// Block Pipeline
// ============================================================================
pub mod chain;
pub mod mempool;

// ============================================================================
// Consensus
// ============================================================================
pub mod consensus;

// ============================================================================
// Cryptography
// ============================================================================
pub mod crypto;

// ============================================================================
// Persistence
// ============================================================================
pub mod store;

// ============================================================================
// Integration
// ============================================================================
pub mod api;
pub mod node;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;
