// src/services/credential_issuer.rs
//! Credential Issuer Service
//!
//! Issues, revokes and checks verifiable credentials against the Credential
//! Revocation Registry. The verifier's default DID is the issuer; every
//! on-chain write goes through the [`TransactionOrchestrator`].
//!
//! Two revocation paths exist:
//! - [`CredentialService::revoke`]: the issuer sends `revokeCredential` itself
//! - [`CredentialService::revoke_with_signature`]: the issuer signs an
//!   authorization bound to its registry nonce and submits
//!   `revokeCredentialWithSignature`, retrying with a fresh nonce when a
//!   concurrent revocation consumed it first

use std::sync::Arc;

use chrono::Utc;
use ethers_core::abi::Token;
use ethers_core::types::{Address, TransactionReceipt, U256};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::blockchain::transaction::TransactionOrchestrator;
use crate::contracts::credential_registry::{
    self, GET_CREDENTIALS_FOR_HOLDER, GET_NONCE, ISSUE_CREDENTIAL, IS_REVOKED, REVOKE_CREDENTIAL,
    REVOKE_CREDENTIAL_WITH_SIGNATURE,
};
use crate::contracts::schema_registry::schema_reference;
use crate::contracts::ContractRef;
use crate::error::{AgentError, CredentialError, ResolutionError, StorageError, TransactionError};
use crate::models::credential::{
    CredentialIssuer, CredentialStatus, CredentialSubject, IssuedCredential, RevocationRecord,
    VerifiableCredential, VC_CONTEXT, VC_TYPE,
};
use crate::models::did::DidDocument;
use crate::services::did_resolver::{CachedDidResolver, DidResolver};
use crate::storage::ContentStore;
use crate::utils::crypto::{authentication_hash, revocation_hash, split_signature};
use crate::wallet::capabilities::AgentCapabilities;

/// Default number of signed revocation attempts before giving up on a nonce race.
pub const DEFAULT_NONCE_RETRY_LIMIT: u32 = 3;

pub struct CredentialService {
    orchestrator: Arc<TransactionOrchestrator>,
    resolver: Arc<CachedDidResolver>,
    agent: AgentCapabilities,
    store: Arc<dyn ContentStore>,
    registry: ContractRef,
    schema_registry: Option<ContractRef>,
    chain_id: u64,
    nonce_retry_limit: u32,
}

impl CredentialService {
    pub fn new(
        orchestrator: Arc<TransactionOrchestrator>,
        resolver: Arc<CachedDidResolver>,
        agent: AgentCapabilities,
        store: Arc<dyn ContentStore>,
        registry: ContractRef,
        chain_id: u64,
    ) -> Self {
        Self {
            orchestrator,
            resolver,
            agent,
            store,
            registry,
            schema_registry: None,
            chain_id,
            nonce_retry_limit: DEFAULT_NONCE_RETRY_LIMIT,
        }
    }

    pub fn with_schema_registry(mut self, schema_registry: ContractRef) -> Self {
        self.schema_registry = Some(schema_registry);
        self
    }

    pub fn with_nonce_retry_limit(mut self, limit: u32) -> Self {
        self.nonce_retry_limit = limit.max(1);
        self
    }

    pub fn orchestrator(&self) -> &Arc<TransactionOrchestrator> {
        &self.orchestrator
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn registry(&self) -> &ContractRef {
        &self.registry
    }

    pub fn issuer_did(&self) -> String {
        self.agent.keys.default_did()
    }

    /// Issues a credential to `holder_did` and records it on the registry.
    ///
    /// # Arguments
    /// * `holder_did` - DID of the credential subject; must resolve to a chain address
    /// * `claims` - Subject claims placed next to the subject id
    /// * `ttl_seconds` - Lifetime; the registry stores `now + ttl_seconds`
    /// * `schema_name` - Optional schema, added to `type` and `credentialSchema`
    ///
    /// The signed credential is only binding together with the returned receipt.
    pub async fn issue(
        &self,
        holder_did: &str,
        claims: Map<String, Value>,
        ttl_seconds: u64,
        schema_name: Option<&str>,
    ) -> Result<IssuedCredential, CredentialError> {
        let issuer_did = self.issuer_did();
        let issuer_address = self.resolver.derive_address(&issuer_did).await?;
        let holder = self.resolve_holder(holder_did).await?;
        let holder_address = recovery_address(&holder)?;

        let issuance_date = Utc::now();
        let expiration_date = i64::try_from(ttl_seconds)
            .ok()
            .filter(|ttl| *ttl > 0)
            .and_then(chrono::Duration::try_seconds)
            .and_then(|ttl| issuance_date.checked_add_signed(ttl))
            .ok_or(CredentialError::InvalidTtl(ttl_seconds))?;

        let mut types = vec![VC_TYPE.to_string()];
        if let Some(name) = schema_name {
            types.push(name.to_string());
        }
        let credential_schema = match (schema_name, &self.schema_registry) {
            (Some(name), Some(registry)) => Some(schema_reference(registry, self.chain_id, issuer_address, name)),
            _ => None,
        };

        let mut credential = VerifiableCredential {
            context: vec![VC_CONTEXT.to_string()],
            id: format!("urn:uuid:{}", Uuid::new_v4()),
            types,
            issuer: CredentialIssuer { id: issuer_did.clone() },
            issuance_date,
            expiration_date,
            ttl: ttl_seconds,
            credential_subject: CredentialSubject { id: holder.id.clone(), claims },
            credential_schema,
            proof: None,
        };
        credential.proof = Some(self.agent.proofs.create_proof(&issuer_did, &credential).await?);

        let expiration_timestamp = u64::try_from(credential.expiration_timestamp())
            .map_err(|_| CredentialError::InvalidTtl(ttl_seconds))?;
        let receipt = self
            .orchestrator
            .execute(
                &issuer_did,
                &self.registry,
                ISSUE_CREDENTIAL,
                &credential_registry::issue_args(holder_address, &credential.id, expiration_timestamp),
                U256::zero(),
                self.chain_id,
            )
            .await?;

        info!(
            "Issued {} to {} (expires {}, tx {:?})",
            credential.id, holder.id, credential.expiration_date, receipt.transaction_hash
        );
        Ok(IssuedCredential { credential, receipt })
    }

    /// Revokes a credential with a transaction from the issuer.
    pub async fn revoke(&self, holder_did: &str, credential_id: &str) -> Result<TransactionReceipt, CredentialError> {
        if self.is_revoked(credential_id).await? {
            return Err(CredentialError::AlreadyRevoked(credential_id.to_string()));
        }
        let holder_address = self.holder_address(holder_did).await?;

        let receipt = self
            .orchestrator
            .execute(
                &self.issuer_did(),
                &self.registry,
                REVOKE_CREDENTIAL,
                &credential_registry::revoke_args(holder_address, credential_id),
                U256::zero(),
                self.chain_id,
            )
            .await?;
        info!("Revoked {} (tx {:?})", credential_id, receipt.transaction_hash);
        Ok(receipt)
    }

    /// Revokes a credential through a signed, nonce-bound authorization.
    ///
    /// A lost nonce race is retried with a freshly fetched nonce, after checking
    /// that the credential was not revoked in the meantime.
    pub async fn revoke_with_signature(
        &self,
        holder_did: &str,
        credential_id: &str,
    ) -> Result<TransactionReceipt, CredentialError> {
        if self.is_revoked(credential_id).await? {
            return Err(CredentialError::AlreadyRevoked(credential_id.to_string()));
        }
        let holder_address = self.holder_address(holder_did).await?;
        let issuer_address = self.resolver.derive_address(&self.issuer_did()).await?;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let nonce = self.fetch_nonce(issuer_address).await?;

            let err = match self.submit_signed_revocation(holder_address, credential_id, nonce).await {
                Ok(receipt) => return Ok(receipt),
                Err(CredentialError::Transaction(err))
                    if err.is_recoverable() || matches!(err, TransactionError::TransactionReverted { .. }) =>
                {
                    err
                }
                Err(other) => return Err(other),
            };
            warn!(
                "Signed revocation of {} with nonce {} failed (attempt {}/{}): {}",
                credential_id, nonce, attempts, self.nonce_retry_limit, err
            );

            if self.is_revoked(credential_id).await? {
                return Err(CredentialError::AlreadyRevoked(credential_id.to_string()));
            }
            // A revert with an unchanged nonce was not caused by a race
            if !err.is_recoverable() && self.fetch_nonce(issuer_address).await? == nonce {
                return Err(err.into());
            }
            if attempts >= self.nonce_retry_limit {
                return Err(CredentialError::NonceExhausted {
                    credential_id: credential_id.to_string(),
                    attempts,
                });
            }
        }
    }

    /// Signs a revocation authorization for `nonce` and submits it once.
    pub async fn submit_signed_revocation(
        &self,
        holder: Address,
        credential_id: &str,
        nonce: U256,
    ) -> Result<TransactionReceipt, CredentialError> {
        let issuer_did = self.issuer_did();
        let kid = self.agent.signing_kid(&issuer_did).await?;

        let digest = revocation_hash(self.registry.address, nonce, holder, credential_id)?;
        let signature = self.agent.signer.sign_message(&kid, digest.as_bytes()).await?;
        let (v, r, s) = split_signature(&signature);
        debug!("Signed revocation of {} with nonce {}", credential_id, nonce);

        let receipt = self
            .orchestrator
            .execute(
                &issuer_did,
                &self.registry,
                REVOKE_CREDENTIAL_WITH_SIGNATURE,
                &credential_registry::signed_revoke_args(holder, credential_id, nonce, v, r, s),
                U256::zero(),
                self.chain_id,
            )
            .await?;
        info!("Revoked {} by signature (tx {:?})", credential_id, receipt.transaction_hash);
        Ok(receipt)
    }

    /// Current registry nonce of `account`.
    pub async fn fetch_nonce(&self, account: Address) -> Result<U256, CredentialError> {
        let tokens = self
            .orchestrator
            .read(&self.registry, GET_NONCE, &[Token::Address(account)])
            .await?;
        Ok(credential_registry::parse_uint(tokens)?)
    }

    pub async fn is_revoked(&self, credential_id: &str) -> Result<bool, CredentialError> {
        let tokens = self
            .orchestrator
            .read(&self.registry, IS_REVOKED, &[Token::String(credential_id.to_string())])
            .await?;
        Ok(credential_registry::parse_bool(tokens)?)
    }

    /// Registry records of `holder_did`. The query is authenticated with a
    /// signature over the holder's authentication request hash.
    pub async fn get_credentials_for_holder(&self, holder_did: &str) -> Result<Vec<RevocationRecord>, CredentialError> {
        let holder_address = self.holder_address(holder_did).await?;
        let issuer_did = self.issuer_did();
        let issuer_address = self.resolver.derive_address(&issuer_did).await?;
        let kid = self.agent.signing_kid(&issuer_did).await?;

        let message_hash = authentication_hash(holder_did);
        let signature = self.agent.signer.sign_message(&kid, message_hash.as_bytes()).await?;
        let (v, r, s) = split_signature(&signature);

        let result = self
            .orchestrator
            .read_as(
                Some(issuer_address),
                &self.registry,
                GET_CREDENTIALS_FOR_HOLDER,
                &credential_registry::holder_query_args(holder_address, v, r, s, message_hash),
            )
            .await;

        match result {
            Ok(tokens) => credential_registry::parse_records(tokens)
                .map_err(|e| CredentialError::InvalidRecord(e.to_string())),
            Err(TransactionError::BadData(reason)) => {
                debug!("No registry data for {}: {}", holder_did, reason);
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Checks a presented credential: issuer signature, expiry and revocation.
    pub async fn verify(&self, credential: &VerifiableCredential) -> Result<CredentialStatus, CredentialError> {
        let issuer_address = self.resolver.derive_address(&credential.issuer.id).await?;
        let signature_valid = match self.agent.proofs.verify_proof(credential).await {
            Ok(signer) => signer == issuer_address,
            Err(e) => {
                debug!("Proof of {} rejected: {}", credential.id, e);
                false
            }
        };
        let status = CredentialStatus {
            id: credential.id.clone(),
            signature_valid,
            expired: credential.is_expired_at(Utc::now()),
            revoked: self.is_revoked(&credential.id).await?,
        };
        debug!("Verified {}: {:?}", credential.id, status);
        Ok(status)
    }

    /// Encrypts a credential to the issuer's key agreement key, pins the
    /// envelope and returns its content id. Only the issuer can read it back.
    pub async fn archive(&self, credential: &VerifiableCredential) -> Result<String, CredentialError> {
        let kid = self.archive_kid().await?;
        let plaintext = serde_json::to_vec(credential)?;
        let archived = ArchivedCredential {
            id: credential.id.clone(),
            encrypted_credential: self.agent.encryptor.encrypt(&kid, &plaintext).await?,
            kid,
        };
        let cid = self.store.put(&serde_json::to_value(&archived)?).await?;
        info!("Archived {} as {}", credential.id, cid);
        Ok(cid)
    }

    /// Key agreement key archives are encrypted to.
    pub async fn archive_kid(&self) -> Result<String, CredentialError> {
        let issuer_did = self.issuer_did();
        match self.agent.key_agreement_kid(&issuer_did).await? {
            Some(kid) => Ok(kid),
            None => Err(AgentError::NoKeyAgreementKey(issuer_did).into()),
        }
    }

    /// Fetches and decrypts a credential pinned by [`CredentialService::archive`].
    pub async fn retrieve(&self, content_id: &str) -> Result<VerifiableCredential, CredentialError> {
        let value = self.store.get(content_id).await?;
        let archived: ArchivedCredential =
            serde_json::from_value(value).map_err(|e| StorageError::Decode(format!("{}: {}", content_id, e)))?;
        let plaintext = self
            .agent
            .encryptor
            .decrypt(&archived.kid, &archived.encrypted_credential)
            .await?;
        debug!("Decrypted {} from {}", archived.id, content_id);
        Ok(serde_json::from_slice(&plaintext)?)
    }

    pub async fn forget(&self, content_id: &str) -> Result<bool, CredentialError> {
        Ok(self.store.delete(content_id).await?)
    }

    async fn holder_address(&self, holder_did: &str) -> Result<Address, CredentialError> {
        recovery_address(&self.resolve_holder(holder_did).await?)
    }

    async fn resolve_holder(&self, holder_did: &str) -> Result<DidDocument, CredentialError> {
        match self.resolver.resolve(holder_did).await {
            Ok(document) => Ok(document),
            Err(ResolutionError::NotFound(_) | ResolutionError::Failed { .. } | ResolutionError::InvalidDid(_)) => {
                Err(CredentialError::HolderNotFound(holder_did.to_string()))
            }
            Err(other) => Err(other.into()),
        }
    }
}

fn recovery_address(document: &DidDocument) -> Result<Address, CredentialError> {
    document
        .recovery_address()
        .ok_or_else(|| ResolutionError::AddressNotFound(document.id.clone()).into())
}

/// Pinned form of an archived credential.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArchivedCredential {
    id: String,
    kid: String,
    encrypted_credential: String,
}
