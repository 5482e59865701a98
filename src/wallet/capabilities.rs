// src/wallet/capabilities.rs
//! Identity Agent capabilities.
//!
//! The engine never talks to a concrete key manager. Each component asks only
//! for the narrow capability it needs: the orchestrator for a [`KeyStore`] and
//! a [`TransactionSigner`], the credential protocol for a [`ProofIssuer`], the
//! transport for a [`MessagePacker`], the credential archive for an
//! [`Encryptor`], and DID initialisation for a [`DidManager`].

use std::sync::Arc;

use async_trait::async_trait;
use ethers_core::types::transaction::eip2718::TypedTransaction;
use ethers_core::types::{Address, Bytes, Signature};
use serde::Serialize;

use crate::error::AgentError;
use crate::models::credential::{CredentialProof, VerifiableCredential};
use crate::models::did::{DidDocument, Service};
use crate::models::message::{DidCommMessage, EncryptionMode, PackedMessage, UnpackedMessage};
use crate::services::did_resolver::DidResolver;

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Secp256k1,
    X25519,
}

/// A key held by the agent, referenced by its verification method id.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManagedKey {
    pub kid: String,
    pub key_type: KeyType,
    pub public_key_hex: String,
}

#[async_trait]
pub trait KeyStore: Send + Sync {
    /// The identity the verifier acts as (issuer of credentials, sender of challenges).
    fn default_did(&self) -> String;

    /// Keys controlling `did`. Fails with [`AgentError::NotManaged`] for foreign DIDs.
    async fn list_keys(&self, did: &str) -> Result<Vec<ManagedKey>, AgentError>;
}

#[async_trait]
pub trait TransactionSigner: Send + Sync {
    /// Signs `tx` with key `kid` and returns the RLP-encoded signed transaction.
    async fn sign_transaction(&self, kid: &str, tx: &TypedTransaction) -> Result<Bytes, AgentError>;

    /// EIP-191 personal-message signature over `message`.
    async fn sign_message(&self, kid: &str, message: &[u8]) -> Result<Signature, AgentError>;
}

#[async_trait]
pub trait ProofIssuer: Send + Sync {
    async fn create_proof(
        &self,
        issuer_did: &str,
        credential: &VerifiableCredential,
    ) -> Result<CredentialProof, AgentError>;

    /// Recovers the address that produced the credential's proof.
    async fn verify_proof(&self, credential: &VerifiableCredential) -> Result<Address, AgentError>;
}

#[async_trait]
pub trait MessagePacker: Send + Sync {
    /// Packs `message` for the holder of `recipient`. `sender_kid` names the
    /// sender's key agreement key and is required for authcrypt.
    async fn pack(
        &self,
        message: &DidCommMessage,
        mode: EncryptionMode,
        sender_kid: Option<&str>,
        recipient: &DidDocument,
    ) -> Result<PackedMessage, AgentError>;

    /// Opens a packed message. `resolver` is used to authenticate authcrypt senders.
    async fn unpack(
        &self,
        packed: &PackedMessage,
        resolver: &dyn DidResolver,
    ) -> Result<UnpackedMessage, AgentError>;
}

/// Encryption of data at rest to one of the agent's own key agreement keys.
#[async_trait]
pub trait Encryptor: Send + Sync {
    /// Encrypts `data` to key `kid` and returns the JSON envelope.
    async fn encrypt(&self, kid: &str, data: &[u8]) -> Result<String, AgentError>;

    /// Opens an envelope produced by [`Encryptor::encrypt`] with key `kid`.
    async fn decrypt(&self, kid: &str, envelope: &str) -> Result<Vec<u8>, AgentError>;
}

#[async_trait]
pub trait DidManager: Send + Sync {
    /// Adds `service`, replacing any entry with the same id.
    async fn add_service(&self, did: &str, service: Service) -> Result<(), AgentError>;

    /// Creates a new X25519 key agreement key and returns its kid.
    async fn add_key_agreement_key(&self, did: &str) -> Result<String, AgentError>;

    /// Removes an X25519 key agreement key and its verification method.
    /// Returns whether the key existed.
    async fn remove_key_agreement_key(&self, did: &str, kid: &str) -> Result<bool, AgentError>;

    /// Returns whether a service was removed.
    async fn remove_service(&self, did: &str, service_id: &str) -> Result<bool, AgentError>;
}

/// The capabilities of one agent, handed to components as a bundle.
#[derive(Clone)]
pub struct AgentCapabilities {
    pub keys: Arc<dyn KeyStore>,
    pub signer: Arc<dyn TransactionSigner>,
    pub proofs: Arc<dyn ProofIssuer>,
    pub packer: Arc<dyn MessagePacker>,
    pub encryptor: Arc<dyn Encryptor>,
    pub dids: Arc<dyn DidManager>,
}

impl AgentCapabilities {
    pub fn from_agent<A>(agent: Arc<A>) -> Self
    where
        A: KeyStore + TransactionSigner + ProofIssuer + MessagePacker + Encryptor + DidManager + 'static,
    {
        Self {
            keys: agent.clone(),
            signer: agent.clone(),
            proofs: agent.clone(),
            packer: agent.clone(),
            encryptor: agent.clone(),
            dids: agent,
        }
    }

    /// Key id of the first secp256k1 key controlling `did`.
    pub async fn signing_kid(&self, did: &str) -> Result<String, AgentError> {
        self.keys
            .list_keys(did)
            .await?
            .into_iter()
            .find(|key| key.key_type == KeyType::Secp256k1)
            .map(|key| key.kid)
            .ok_or_else(|| AgentError::NoSigningKey(did.to_string()))
    }

    /// Key id of the first X25519 key agreement key of `did`, if any.
    pub async fn key_agreement_kid(&self, did: &str) -> Result<Option<String>, AgentError> {
        Ok(self
            .keys
            .list_keys(did)
            .await?
            .into_iter()
            .find(|key| key.key_type == KeyType::X25519)
            .map(|key| key.kid))
    }
}
