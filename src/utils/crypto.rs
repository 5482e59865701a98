// src/utils/crypto.rs
//! Hashing and signature helpers shared with the on-chain registry.
//!
//! All hashes are Keccak-256 so the contract can re-derive them with
//! Solidity's `keccak256(abi.encodePacked(...))`.

use std::collections::BTreeMap;

use ethers_core::abi::{encode_packed, Token};
use ethers_core::types::{Address, Signature, H256, U256};
use ethers_core::utils::keccak256;
use serde_json::{Map, Value};

use crate::error::TransactionError;

/// Domain tag appended to every signed revocation authorization.
pub const REVOKE_DOMAIN_TAG: &str = "REVOKE";

/// Computes a Keccak-256 hash of the input data (Ethereum-compatible).
pub fn hash_data(data: &[u8]) -> [u8; 32] {
    keccak256(data)
}

/// Bytes packed for a signed revocation, in the registry's field order:
/// `(address registry, uint256 nonce, address holder, string vcID, string "REVOKE")`.
pub fn revocation_preimage(
    registry: Address,
    nonce: U256,
    holder: Address,
    credential_id: &str,
) -> Result<Vec<u8>, TransactionError> {
    encode_packed(&[
        Token::Address(registry),
        Token::Uint(nonce),
        Token::Address(holder),
        Token::String(credential_id.to_string()),
        Token::String(REVOKE_DOMAIN_TAG.to_string()),
    ])
    .map_err(|e| TransactionError::Encoding(e.to_string()))
}

/// Packed Keccak-256 hash the issuer signs to authorize a delegated revocation.
pub fn revocation_hash(
    registry: Address,
    nonce: U256,
    holder: Address,
    credential_id: &str,
) -> Result<H256, TransactionError> {
    let packed = revocation_preimage(registry, nonce, holder, credential_id)?;
    Ok(H256::from(hash_data(&packed)))
}

/// Hash of the fixed authentication string the registry expects before
/// disclosing a holder's credentials.
pub fn authentication_hash(holder_did: &str) -> H256 {
    H256::from(hash_data(format!("Authentication Request for {}", holder_did).as_bytes()))
}

/// Keccak-256 of the compact JSON of an identity object, keys sorted.
pub fn identity_hash(identity: &Map<String, Value>) -> Result<H256, serde_json::Error> {
    let sorted: BTreeMap<&String, &Value> = identity.iter().collect();
    Ok(H256::from(hash_data(&serde_json::to_vec(&sorted)?)))
}

/// Splits a recoverable signature into the `(v, r, s)` triple Solidity's `ecrecover` takes.
pub fn split_signature(signature: &Signature) -> (u8, [u8; 32], [u8; 32]) {
    let mut r = [0u8; 32];
    let mut s = [0u8; 32];
    signature.r.to_big_endian(&mut r);
    signature.s.to_big_endian(&mut s);
    // Legacy signers return 0/1, ecrecover wants 27/28
    let v = if signature.v < 27 { signature.v + 27 } else { signature.v };
    (v as u8, r, s)
}
