// src/contracts/credential_registry.rs
//! Credential Revocation Registry contract interface.
//!
//! Wire-level helpers for the registry: function names, argument tuples in the
//! exact order the contract expects, and decoding of its view results.
//! Transactions themselves go through the orchestrator.

use ethers_core::abi::Token;
use ethers_core::types::{Address, H256, U256};

use super::ContractRef;
use crate::error::{ConfigError, TransactionError};
use crate::models::credential::RevocationRecord;

pub const ISSUE_CREDENTIAL: &str = "issueCredential";
pub const REVOKE_CREDENTIAL: &str = "revokeCredential";
pub const REVOKE_CREDENTIAL_WITH_SIGNATURE: &str = "revokeCredentialWithSignature";
pub const IS_REVOKED: &str = "isRevoked";
pub const GET_NONCE: &str = "getNonce";
pub const GET_CREDENTIALS_FOR_HOLDER: &str = "getCredentialsForHolder";

pub fn revocation_registry(address: Address) -> Result<ContractRef, ConfigError> {
    ContractRef::from_json(
        "CredentialRevocationRegistry",
        address,
        include_bytes!("abi/CredentialRevocationRegistry.json"),
    )
}

/// `issueCredential(address holder, string vcID, uint256 ttl)`; `ttl` carries the expiration timestamp.
pub fn issue_args(holder: Address, credential_id: &str, expiration_timestamp: u64) -> Vec<Token> {
    vec![
        Token::Address(holder),
        Token::String(credential_id.to_string()),
        Token::Uint(U256::from(expiration_timestamp)),
    ]
}

/// `revokeCredential(address holder, string vcID)`
pub fn revoke_args(holder: Address, credential_id: &str) -> Vec<Token> {
    vec![Token::Address(holder), Token::String(credential_id.to_string())]
}

/// `revokeCredentialWithSignature(address holder, string vcID, uint256 nonce, uint8 v, bytes32 r, bytes32 s)`
pub fn signed_revoke_args(
    holder: Address,
    credential_id: &str,
    nonce: U256,
    v: u8,
    r: [u8; 32],
    s: [u8; 32],
) -> Vec<Token> {
    vec![
        Token::Address(holder),
        Token::String(credential_id.to_string()),
        Token::Uint(nonce),
        Token::Uint(U256::from(v)),
        Token::FixedBytes(r.to_vec()),
        Token::FixedBytes(s.to_vec()),
    ]
}

/// `getCredentialsForHolder(address holder, uint8 v, bytes32 r, bytes32 s, bytes32 messageHash)`
pub fn holder_query_args(holder: Address, v: u8, r: [u8; 32], s: [u8; 32], message_hash: H256) -> Vec<Token> {
    vec![
        Token::Address(holder),
        Token::Uint(U256::from(v)),
        Token::FixedBytes(r.to_vec()),
        Token::FixedBytes(s.to_vec()),
        Token::FixedBytes(message_hash.as_bytes().to_vec()),
    ]
}

/// Reads a single `bool` output.
pub fn parse_bool(tokens: Vec<Token>) -> Result<bool, TransactionError> {
    match tokens.into_iter().next() {
        Some(Token::Bool(value)) => Ok(value),
        other => Err(TransactionError::BadData(format!("expected bool, got {:?}", other))),
    }
}

/// Reads a single `uint256` output.
pub fn parse_uint(tokens: Vec<Token>) -> Result<U256, TransactionError> {
    match tokens.into_iter().next() {
        Some(Token::Uint(value)) => Ok(value),
        other => Err(TransactionError::BadData(format!("expected uint256, got {:?}", other))),
    }
}

/// Reads the `Credential[]` tuple array returned by `getCredentialsForHolder`.
pub fn parse_records(tokens: Vec<Token>) -> Result<Vec<RevocationRecord>, TransactionError> {
    let items = match tokens.into_iter().next() {
        Some(Token::Array(items)) => items,
        None => return Ok(Vec::new()),
        other => {
            return Err(TransactionError::BadData(format!("expected tuple[], got {:?}", other)));
        }
    };

    items.into_iter().map(parse_record).collect()
}

fn parse_record(token: Token) -> Result<RevocationRecord, TransactionError> {
    let fields = match token {
        Token::Tuple(fields) => fields,
        other => return Err(TransactionError::BadData(format!("expected tuple, got {:?}", other))),
    };

    match fields.as_slice() {
        [Token::String(vc_id), Token::Address(issuer), Token::Address(holder), Token::Uint(ttl), Token::Bool(revoked)] => {
            let ttl = u64::try_from(*ttl)
                .map_err(|_| TransactionError::BadData(format!("expiry of {} out of range: {}", vc_id, ttl)))?;
            Ok(RevocationRecord {
                vc_id: vc_id.clone(),
                issuer: *issuer,
                holder: *holder,
                ttl,
                revoked: *revoked,
            })
        }
        _ => Err(TransactionError::BadData(format!("unexpected credential tuple: {:?}", fields))),
    }
}
