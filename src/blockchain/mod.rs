// src/blockchain/mod.rs
//! Ledger access and transaction orchestration.

pub mod ledger;
pub mod transaction;
