// src/wallet/key_management.rs
//! Local Identity Agent.
//!
//! [`KeyManager`] controls a single `did:ethr` identity derived from the
//! issuer's secp256k1 key and implements every agent capability for it:
//! - transaction and message signing (secp256k1 via `ethers` `LocalWallet`)
//! - credential proofs (EIP-191 signature over the Keccak-256 of the credential)
//! - X25519 key agreement keys, derived from the secp256k1 secret with BLAKE3
//! - DIDComm packing and unpacking, and encryption of data at rest
//! - maintenance of its own DID document (services, key agreement keys)
//!
//! Documents of foreign DIDs are never produced here; they come from the
//! universal resolver.

use async_trait::async_trait;
use chrono::Utc;
use ethers::signers::{LocalWallet, Signer};
use ethers_core::types::transaction::eip2718::TypedTransaction;
use ethers_core::types::{Address, Bytes, Signature};
use ethers_core::utils::hex;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use log::debug;
use tokio::sync::RwLock;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

use crate::error::{AgentError, ConfigError, ResolutionError};
use crate::models::credential::{CredentialProof, VerifiableCredential};
use crate::models::did::{
    DidDocument, DidUrl, KeyAgreementEntry, Service, VerificationMethod, RECOVERY_METHOD_TYPE,
    X25519_KEY_TYPE,
};
use crate::models::message::{DidCommMessage, EncryptionMode, PackedMessage, UnpackedMessage};
use crate::services::did_resolver::DidResolver;
use crate::utils::crypto::hash_data;
use crate::utils::serialization::decode_key_hex;
use crate::wallet::capabilities::{
    DidManager, Encryptor, KeyStore, KeyType, ManagedKey, MessagePacker, ProofIssuer, TransactionSigner,
};
use crate::wallet::didcomm::{self, EncryptedEnvelope, SenderKey};

pub const PROOF_TYPE: &str = "EcdsaSecp256k1RecoverySignature2020";
pub const PROOF_PURPOSE: &str = "assertionMethod";

const X25519_DERIVATION_CONTEXT: &str = "vc-trust-engine x25519 key agreement v1";

struct AgreementKey {
    kid: String,
    secret: StaticSecret,
}

struct AgentState {
    document: DidDocument,
    agreement_keys: Vec<AgreementKey>,
}

/// Keys and DID document of the verifier identity.
pub struct KeyManager {
    wallet: LocalWallet,
    did: String,
    chain_id: u64,
    /// Raw secp256k1 secret, input to X25519 derivation
    seed: [u8; 32],
    state: RwLock<AgentState>,
}

impl KeyManager {
    /// Loads the identity from a hex secp256k1 private key.
    ///
    /// # Arguments
    /// * `private_key` - 32-byte hex key, with or without `0x`
    /// * `chain_id` - EIP-155 chain id used for signing and the account id
    /// * `network` - network segment of the `did:ethr` identifier (e.g. `sepolia`)
    pub fn from_private_key(private_key: &str, chain_id: u64, network: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::Invalid {
            key: "ISSUER_PRIVATE_KEY".into(),
            reason,
        };
        let bytes = decode_key_hex(private_key).map_err(invalid)?;
        let wallet = LocalWallet::from_bytes(&bytes).map_err(|e| invalid(e.to_string()))?;
        Ok(Self::from_wallet(wallet, chain_id, network))
    }

    /// Fresh random identity.
    pub fn random(chain_id: u64, network: &str) -> Self {
        Self::from_wallet(LocalWallet::new(&mut rand::thread_rng()), chain_id, network)
    }

    fn from_wallet(wallet: LocalWallet, chain_id: u64, network: &str) -> Self {
        let wallet = wallet.with_chain_id(chain_id);
        let address = wallet.address();
        let did = format!("did:ethr:{}:{:?}", network, address);

        let mut seed = [0u8; 32];
        seed.copy_from_slice(&wallet.signer().to_bytes());

        let mut document = DidDocument::new(did.clone());
        document.context = Some(serde_json::json!([
            "https://www.w3.org/ns/did/v1",
            "https://w3id.org/security/suites/secp256k1recovery-2020/v2"
        ]));
        document.verification_method.push(VerificationMethod {
            id: format!("{}#controller", did),
            method_type: RECOVERY_METHOD_TYPE.to_string(),
            controller: did.clone(),
            blockchain_account_id: Some(format!("eip155:{}:{:?}", chain_id, address)),
            public_key_hex: None,
        });

        Self {
            wallet,
            did,
            chain_id,
            seed,
            state: RwLock::new(AgentState { document, agreement_keys: Vec::new() }),
        }
    }

    pub fn address(&self) -> Address {
        self.wallet.address()
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Key id of the secp256k1 controller key.
    pub fn controller_kid(&self) -> String {
        format!("{}#controller", self.did)
    }

    fn manages(&self, did: &str) -> bool {
        did.eq_ignore_ascii_case(&self.did)
    }

    fn ensure_managed(&self, did: &str) -> Result<(), AgentError> {
        if self.manages(did) {
            Ok(())
        } else {
            Err(AgentError::NotManaged(did.to_string()))
        }
    }

    fn ensure_controller(&self, kid: &str) -> Result<(), AgentError> {
        if kid.eq_ignore_ascii_case(&self.controller_kid()) {
            Ok(())
        } else {
            Err(AgentError::UnknownKey(kid.to_string()))
        }
    }

    fn agreement_kid(&self, index: u32) -> String {
        format!("{}#key-agreement-{}", self.did, index)
    }

    async fn agreement_secret(&self, kid: &str) -> Result<StaticSecret, AgentError> {
        self.state
            .read()
            .await
            .agreement_keys
            .iter()
            .find(|key| key.kid == kid)
            .map(|key| key.secret.clone())
            .ok_or_else(|| AgentError::UnknownKey(kid.to_string()))
    }

    fn derive_agreement_secret(&self, index: u32) -> StaticSecret {
        let mut material = Vec::with_capacity(36);
        material.extend_from_slice(&self.seed);
        material.extend_from_slice(&index.to_be_bytes());
        StaticSecret::from(blake3::derive_key(X25519_DERIVATION_CONTEXT, &material))
    }

    fn controller_public_key_hex(&self) -> String {
        let public_key = k256::PublicKey::from(self.wallet.signer().verifying_key());
        hex::encode(public_key.to_encoded_point(true).as_bytes())
    }
}

/// Recovers the signer of a credential proof.
pub fn recover_proof_signer(credential: &VerifiableCredential) -> Result<Address, AgentError> {
    let proof = credential
        .proof
        .as_ref()
        .ok_or_else(|| AgentError::Signing(format!("credential {} carries no proof", credential.id)))?;
    let signature: Signature = proof
        .proof_value
        .parse()
        .map_err(|e| AgentError::Signing(format!("malformed proof value: {}", e)))?;
    let payload = credential
        .signing_payload()
        .map_err(|e| AgentError::Signing(e.to_string()))?;
    let digest = hash_data(&payload);
    signature
        .recover(digest.to_vec())
        .map_err(|e| AgentError::Signing(e.to_string()))
}

#[async_trait]
impl KeyStore for KeyManager {
    fn default_did(&self) -> String {
        self.did.clone()
    }

    async fn list_keys(&self, did: &str) -> Result<Vec<ManagedKey>, AgentError> {
        self.ensure_managed(did)?;
        let state = self.state.read().await;
        let mut keys = vec![ManagedKey {
            kid: self.controller_kid(),
            key_type: KeyType::Secp256k1,
            public_key_hex: self.controller_public_key_hex(),
        }];
        keys.extend(state.agreement_keys.iter().map(|key| ManagedKey {
            kid: key.kid.clone(),
            key_type: KeyType::X25519,
            public_key_hex: hex::encode(X25519PublicKey::from(&key.secret).as_bytes()),
        }));
        Ok(keys)
    }
}

#[async_trait]
impl TransactionSigner for KeyManager {
    async fn sign_transaction(&self, kid: &str, tx: &TypedTransaction) -> Result<Bytes, AgentError> {
        self.ensure_controller(kid)?;
        let signature = self
            .wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| AgentError::Signing(e.to_string()))?;
        Ok(tx.rlp_signed(&signature))
    }

    async fn sign_message(&self, kid: &str, message: &[u8]) -> Result<Signature, AgentError> {
        self.ensure_controller(kid)?;
        self.wallet
            .sign_message(message)
            .await
            .map_err(|e| AgentError::Signing(e.to_string()))
    }
}

#[async_trait]
impl ProofIssuer for KeyManager {
    async fn create_proof(
        &self,
        issuer_did: &str,
        credential: &VerifiableCredential,
    ) -> Result<CredentialProof, AgentError> {
        self.ensure_managed(issuer_did)?;
        let payload = credential
            .signing_payload()
            .map_err(|e| AgentError::Signing(e.to_string()))?;
        let digest = hash_data(&payload);
        let signature = self.sign_message(&self.controller_kid(), &digest).await?;

        Ok(CredentialProof {
            proof_type: PROOF_TYPE.to_string(),
            created: Utc::now(),
            proof_purpose: PROOF_PURPOSE.to_string(),
            verification_method: self.controller_kid(),
            proof_value: format!("0x{}", hex::encode(signature.to_vec())),
        })
    }

    async fn verify_proof(&self, credential: &VerifiableCredential) -> Result<Address, AgentError> {
        recover_proof_signer(credential)
    }
}

#[async_trait]
impl MessagePacker for KeyManager {
    async fn pack(
        &self,
        message: &DidCommMessage,
        mode: EncryptionMode,
        sender_kid: Option<&str>,
        recipient: &DidDocument,
    ) -> Result<PackedMessage, AgentError> {
        let plaintext = serde_json::to_vec(message).map_err(|e| AgentError::Packing(e.to_string()))?;
        if mode == EncryptionMode::None {
            let message = String::from_utf8(plaintext).map_err(|e| AgentError::Packing(e.to_string()))?;
            return Ok(PackedMessage { message });
        }

        let recipient_method = recipient
            .key_agreement_methods()
            .into_iter()
            .next()
            .ok_or_else(|| AgentError::NoKeyAgreementKey(recipient.id.clone()))?;
        let recipient_public = recipient_method
            .public_key_hex
            .as_deref()
            .ok_or_else(|| AgentError::NoKeyAgreementKey(recipient.id.clone()))
            .and_then(|hex| decode_key_hex(hex).map_err(AgentError::Packing))?;

        let state = self.state.read().await;
        let sender = match mode {
            EncryptionMode::Authcrypt => {
                let kid = sender_kid.ok_or_else(|| AgentError::NoKeyAgreementKey(self.did.clone()))?;
                let key = state
                    .agreement_keys
                    .iter()
                    .find(|key| key.kid == kid)
                    .ok_or_else(|| AgentError::UnknownKey(kid.to_string()))?;
                Some(SenderKey { kid: &key.kid, secret: &key.secret })
            }
            _ => None,
        };

        let envelope = didcomm::encrypt(&plaintext, &recipient_method.id, &recipient_public, sender)?;
        let message = serde_json::to_string(&envelope).map_err(|e| AgentError::Packing(e.to_string()))?;
        Ok(PackedMessage { message })
    }

    async fn unpack(
        &self,
        packed: &PackedMessage,
        resolver: &dyn DidResolver,
    ) -> Result<UnpackedMessage, AgentError> {
        let Some(envelope) = EncryptedEnvelope::detect(&packed.message) else {
            let message: DidCommMessage = serde_json::from_str(&packed.message)
                .map_err(|e| AgentError::Unpacking(format!("not a DIDComm message: {}", e)))?;
            return Ok(UnpackedMessage { message, packing: EncryptionMode::None, sender_kid: None });
        };

        let header = envelope.header()?;
        let recipient_secret = {
            let state = self.state.read().await;
            envelope
                .recipients
                .iter()
                .find_map(|r| state.agreement_keys.iter().find(|key| key.kid == r.kid))
                .map(|key| key.secret.clone())
                .ok_or_else(|| AgentError::Unpacking("no recipient key held by this agent".into()))?
        };

        let (sender_public, sender_did) = match header.skid.as_deref() {
            Some(skid) => {
                let did = DidUrl::parse(skid)?.did;
                let document = resolver.resolve(&did).await?;
                let method = document
                    .key_agreement_methods()
                    .into_iter()
                    .find(|vm| vm.id == skid)
                    .ok_or_else(|| AgentError::UnknownKey(skid.to_string()))?;
                let public = method
                    .public_key_hex
                    .as_deref()
                    .ok_or_else(|| AgentError::NoKeyAgreementKey(did.clone()))
                    .and_then(|hex| decode_key_hex(hex).map_err(AgentError::Unpacking))?;
                (Some(public), Some(did))
            }
            None => (None, None),
        };

        let plaintext = didcomm::decrypt(&envelope, &header, &recipient_secret, sender_public.as_ref())?;
        let message: DidCommMessage = serde_json::from_slice(&plaintext)
            .map_err(|e| AgentError::Unpacking(format!("not a DIDComm message: {}", e)))?;

        let packing = match sender_did {
            Some(did) => {
                if message.from.as_deref() != Some(did.as_str()) {
                    return Err(AgentError::Unpacking(format!(
                        "sender {} does not match authenticated key {}",
                        message.from.as_deref().unwrap_or("<none>"),
                        did
                    )));
                }
                EncryptionMode::Authcrypt
            }
            None => EncryptionMode::Anoncrypt,
        };

        Ok(UnpackedMessage { message, packing, sender_kid: header.skid })
    }
}

#[async_trait]
impl Encryptor for KeyManager {
    async fn encrypt(&self, kid: &str, data: &[u8]) -> Result<String, AgentError> {
        let secret = self.agreement_secret(kid).await?;
        let public = X25519PublicKey::from(&secret).to_bytes();
        let envelope = didcomm::encrypt(data, kid, &public, None)?;
        serde_json::to_string(&envelope).map_err(|e| AgentError::Packing(e.to_string()))
    }

    async fn decrypt(&self, kid: &str, envelope: &str) -> Result<Vec<u8>, AgentError> {
        let envelope = EncryptedEnvelope::detect(envelope)
            .ok_or_else(|| AgentError::Unpacking("not an encrypted envelope".into()))?;
        if !envelope.recipients.iter().any(|r| r.kid == kid) {
            return Err(AgentError::Unpacking(format!("envelope not addressed to {}", kid)));
        }
        let header = envelope.header()?;
        let secret = self.agreement_secret(kid).await?;
        didcomm::decrypt(&envelope, &header, &secret, None)
    }
}

#[async_trait]
impl DidManager for KeyManager {
    async fn add_service(&self, did: &str, service: Service) -> Result<(), AgentError> {
        self.ensure_managed(did)?;
        let mut state = self.state.write().await;
        match state.document.service.iter_mut().find(|s| s.id == service.id) {
            Some(existing) => *existing = service,
            None => state.document.service.push(service),
        }
        Ok(())
    }

    async fn add_key_agreement_key(&self, did: &str) -> Result<String, AgentError> {
        self.ensure_managed(did)?;
        let mut state = self.state.write().await;
        // Lowest free index; a removed key is re-derived with the same secret
        let index = (1..)
            .find(|i| {
                let kid = self.agreement_kid(*i);
                !state.agreement_keys.iter().any(|key| key.kid == kid)
            })
            .unwrap_or(1);
        let kid = self.agreement_kid(index);
        let secret = self.derive_agreement_secret(index);
        let public = X25519PublicKey::from(&secret);

        state.document.verification_method.push(VerificationMethod {
            id: kid.clone(),
            method_type: X25519_KEY_TYPE.to_string(),
            controller: self.did.clone(),
            blockchain_account_id: None,
            public_key_hex: Some(hex::encode(public.as_bytes())),
        });
        state.document.key_agreement.push(KeyAgreementEntry::Reference(kid.clone()));
        state.agreement_keys.push(AgreementKey { kid: kid.clone(), secret });

        debug!("Added key agreement key {}", kid);
        Ok(kid)
    }

    async fn remove_key_agreement_key(&self, did: &str, kid: &str) -> Result<bool, AgentError> {
        self.ensure_managed(did)?;
        let mut state = self.state.write().await;
        let before = state.agreement_keys.len();
        state.agreement_keys.retain(|key| key.kid != kid);
        if state.agreement_keys.len() == before {
            return Ok(false);
        }
        state.document.verification_method.retain(|vm| vm.id != kid);
        state.document.key_agreement.retain(|entry| match entry {
            KeyAgreementEntry::Reference(id) => id != kid,
            KeyAgreementEntry::Embedded(vm) => vm.id != kid,
        });
        debug!("Removed key agreement key {}", kid);
        Ok(true)
    }

    async fn remove_service(&self, did: &str, service_id: &str) -> Result<bool, AgentError> {
        self.ensure_managed(did)?;
        let mut state = self.state.write().await;
        let before = state.document.service.len();
        state.document.service.retain(|s| s.id != service_id);
        Ok(state.document.service.len() != before)
    }
}

#[async_trait]
impl DidResolver for KeyManager {
    async fn resolve(&self, did: &str) -> Result<DidDocument, ResolutionError> {
        let url = DidUrl::parse(did)?;
        if !self.manages(&url.did) {
            return Err(ResolutionError::NotFound(url.did));
        }
        Ok(self.state.read().await.document.clone())
    }
}
