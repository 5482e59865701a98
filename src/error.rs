// src/error.rs
//! Error taxonomy for the verifier engine.
//!
//! Every component owns an error enum. Helpers bubble their failures with `?`
//! up to the operation boundary (issue / revoke / verify / challenge), which
//! decides how to report them.

use ethers_core::types::{H256, U256};
use thiserror::Error;

// =========================================================================
// CONFIGURATION
// =========================================================================

/// Startup configuration problems. These are fatal: the process must not start.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required key is absent from the environment
    #[error("Missing required setting: {0}")]
    Missing(String),

    /// A key is present but cannot be interpreted
    #[error("Invalid setting '{key}': {reason}")]
    Invalid { key: String, reason: String },

    #[error(transparent)]
    Source(#[from] config::ConfigError),
}

// =========================================================================
// RESOLUTION
// =========================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    /// No document could be produced for the DID
    #[error("DID document not found: {0}")]
    NotFound(String),

    /// The resolver failed for a reason other than absence
    #[error("Failed to resolve DID '{did}': {reason}")]
    Failed { did: String, reason: String },

    #[error("Invalid DID: {0}")]
    InvalidDid(String),

    /// The document has no recovery-capable verification method with a chain account
    #[error("No blockchain address found in DID document of {0}")]
    AddressNotFound(String),
}

// =========================================================================
// IDENTITY AGENT
// =========================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// The DID is not controlled by this agent
    #[error("DID not managed by the local agent: {0}")]
    NotManaged(String),

    #[error("No Secp256k1 signing key found for {0}")]
    NoSigningKey(String),

    #[error("No X25519 key agreement key found for {0}")]
    NoKeyAgreementKey(String),

    #[error("Unknown key reference: {0}")]
    UnknownKey(String),

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Failed to pack message: {0}")]
    Packing(String),

    #[error("Failed to unpack message: {0}")]
    Unpacking(String),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

// =========================================================================
// LEDGER
// =========================================================================

#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    /// The node answered with an error or could not be reached
    #[error("RPC error: {0}")]
    Rpc(String),

    /// No receipt with enough confirmations arrived in time
    #[error("Timed out waiting for transaction {tx_hash:?}")]
    Timeout { tx_hash: H256 },
}

/// Failures of the transaction orchestrator.
///
/// Variants split into three groups:
/// - definitely failed: nothing landed on chain, or it landed and reverted
/// - unknown outcome: [`TransactionError::Timeout`] and
///   [`TransactionError::ConfirmationUnknown`], both carrying the broadcast hash
/// - recoverable conflict: [`TransactionError::NonceConflict`]
#[derive(Error, Debug, Clone)]
pub enum TransactionError {
    #[error("Sender DID not managed by the local agent: {0}")]
    SenderNotManaged(String),

    #[error("No signing key found for sender {0}")]
    NoSigningKeyFound(String),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("Contract has no function named '{0}'")]
    UnknownFunction(String),

    #[error("Failed to encode call data: {0}")]
    Encoding(String),

    /// Empty or undecodable return data from a view call
    #[error("Contract returned no usable data: {0}")]
    BadData(String),

    #[error("Gas estimation failed: {0}")]
    EstimationFailed(String),

    #[error("Insufficient balance. Required: {required} wei, Available: {available} wei")]
    InsufficientBalance { required: U256, available: U256 },

    /// Another transaction or signed authorization consumed the nonce first
    #[error("Nonce conflict: {0}")]
    NonceConflict(String),

    #[error("Broadcast rejected: {0}")]
    BroadcastRejected(String),

    #[error("Transaction reverted: {tx_hash:?}")]
    TransactionReverted { tx_hash: H256 },

    #[error("Timed out waiting for confirmation of {tx_hash:?}; outcome unknown")]
    Timeout { tx_hash: H256 },

    /// The node stopped answering after the broadcast was accepted
    #[error("Lost track of {tx_hash:?} after broadcast ({reason}); outcome unknown")]
    ConfirmationUnknown { tx_hash: H256, reason: String },

    #[error("Signing failed: {0}")]
    Signing(String),

    #[error("Ledger error: {0}")]
    Ledger(String),
}

impl TransactionError {
    /// The transaction may still confirm; callers must re-query chain state.
    pub fn is_outcome_unknown(&self) -> bool {
        matches!(
            self,
            TransactionError::Timeout { .. } | TransactionError::ConfirmationUnknown { .. }
        )
    }

    /// Hash of a broadcast transaction whose fate is not known.
    pub fn pending_hash(&self) -> Option<H256> {
        match self {
            TransactionError::Timeout { tx_hash } | TransactionError::ConfirmationUnknown { tx_hash, .. } => {
                Some(*tx_hash)
            }
            _ => None,
        }
    }

    /// Retrying after refreshing nonces can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransactionError::NonceConflict(_))
    }
}

// =========================================================================
// CREDENTIAL PROTOCOL
// =========================================================================

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("Holder DID document not found: {0}")]
    HolderNotFound(String),

    #[error("Invalid time to live: {0} seconds")]
    InvalidTtl(u64),

    #[error("Credential '{0}' is already revoked")]
    AlreadyRevoked(String),

    /// Signed revocation kept losing the nonce race
    #[error("Signed revocation of '{credential_id}' still conflicting after {attempts} attempts")]
    NonceExhausted { credential_id: String, attempts: u32 },

    #[error("Unexpected registry data: {0}")]
    InvalidRecord(String),

    #[error("Content store error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// =========================================================================
// CREDENTIAL BINDING
// =========================================================================

#[derive(Error, Debug)]
pub enum BindingError {
    #[error("No archived identity for binding credential '{0}'")]
    UnknownBinding(String),

    /// The archived identity no longer hashes to the value the binding credential carries
    #[error("Identity hash mismatch for '{binding_id}': bound {bound}, computed {computed}")]
    HashMismatch { binding_id: String, bound: String, computed: String },

    #[error("Binding credential not delivered: {0}")]
    Delivery(TransportError),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

// =========================================================================
// CHALLENGE-RESPONSE
// =========================================================================

#[derive(Error, Debug)]
pub enum ChallengeError {
    /// No challenge is pending for the DID (never started, timed out, or already answered)
    #[error("No pending challenge for {0}")]
    NoPendingChallenge(String),

    #[error("Invalid challenge response from {0}")]
    InvalidChallenge(String),

    #[error("Malformed challenge response: {0}")]
    MalformedResponse(String),

    #[error("Challenge registry is not running")]
    RegistryStopped,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

// =========================================================================
// TRANSPORT
// =========================================================================

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Service endpoint '{service_type}' not found for {did}")]
    EndpointNotFound { did: String, service_type: String },

    #[error("X25519 encryption key not found for sender {0}")]
    EncryptionKeyMissing(String),

    #[error("Recipient {0} advertises no key agreement key")]
    RecipientKeyMissing(String),

    #[error("Delivery to {endpoint} failed: {reason}")]
    DeliveryFailed { endpoint: String, reason: String },

    #[error("Failed to unpack message: {0}")]
    UnpackError(String),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error(transparent)]
    Agent(AgentError),
}

// =========================================================================
// CONTENT STORE
// =========================================================================

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    #[error("IPFS error: {0}")]
    Ipfs(String),

    #[error("Content not found: {0}")]
    NotFound(String),

    #[error("Stored content is not valid JSON: {0}")]
    Decode(String),
}
