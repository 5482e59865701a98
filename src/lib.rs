// src/lib.rs
//! # vc-trust-engine
//!
//! Verifier engine for W3C verifiable credentials anchored in an on-chain
//! revocation registry.
//!
//! ## Architecture Overview
//! 1. **Blockchain Layer**: rate-limited JSON-RPC ledger client and the transaction orchestrator
//! 2. **Identity Layer**: local Identity Agent (keys, proofs, DIDComm packing) and the cached DID resolver
//! 3. **Services Layer**: credential protocol, ownership challenges, messaging and the REST API
//! 4. **Storage Layer**: IPFS archive for issued credentials

pub mod blockchain;
pub mod config;
pub mod contracts;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;
pub mod utils;
pub mod wallet;

#[cfg(test)]
pub(crate) mod test_support;
