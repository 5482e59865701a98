// src/services/binding.rs
//! Credential binding.
//!
//! A holder's real-world identity is issued as a credential that never leaves
//! the verifier: it is encrypted to the verifier's own key and pinned. The
//! holder receives a `CredentialBinding` credential instead, carrying only
//! the Keccak-256 hash of the identity and the content id of the archive.
//! Presenting the binding later lets the verifier recover the identity and
//! check that it still hashes to the bound value.

use std::collections::HashMap;
use std::sync::Arc;

use ethers_core::types::H256;
use log::{debug, error, info};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;

use crate::error::{BindingError, CredentialError};
use crate::models::credential::IssuedCredential;
use crate::models::message::EncryptionMode;
use crate::services::credential_issuer::CredentialService;
use crate::services::messaging::{MessagingTransport, RECEIVE_CREDENTIAL_SERVICE};
use crate::utils::crypto::identity_hash;

/// Lifetime of both the identity and the binding credential.
pub const BINDING_TTL_SECONDS: u64 = 365 * 24 * 60 * 60;

pub const CREDENTIAL_BINDING_TYPE: &str = "CredentialBinding";

/// Outcome of [`BindingService::issue_binding`].
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct IssuedBinding {
    pub binding: IssuedCredential,
    pub identity_credential_id: String,
    /// Content id of the encrypted identity credential
    pub content_id: String,
    pub identity_hash: String,
    /// Id of the message that delivered the binding; `None` when delivery failed
    pub message_id: Option<String>,
}

/// Identity recovered from a binding credential.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BoundIdentity {
    pub binding_id: String,
    pub holder: String,
    pub identity_hash: String,
    pub identity: Map<String, Value>,
}

#[derive(Clone)]
struct BindingEntry {
    content_id: String,
    identity_hash: H256,
}

pub struct BindingService {
    credentials: Arc<CredentialService>,
    transport: Arc<MessagingTransport>,
    bindings: RwLock<HashMap<String, BindingEntry>>,
}

impl BindingService {
    pub fn new(credentials: Arc<CredentialService>, transport: Arc<MessagingTransport>) -> Self {
        Self { credentials, transport, bindings: RwLock::new(HashMap::new()) }
    }

    /// Issues and archives the identity credential, then issues the binding
    /// credential and sends it to the holder's `receiveCredential` endpoint.
    ///
    /// Both credentials are on chain once this returns `Ok`. A failed delivery
    /// does not undo them; it is reported as `message_id: None`.
    pub async fn issue_binding(
        &self,
        holder_did: &str,
        identity: Map<String, Value>,
        schema_name: Option<&str>,
    ) -> Result<IssuedBinding, BindingError> {
        // Fail before spending gas when there is no key to archive to
        self.credentials.archive_kid().await?;
        let hash = identity_hash(&identity).map_err(CredentialError::from)?;
        let hash_hex = format!("{:?}", hash);

        let identity_credential = self
            .credentials
            .issue(holder_did, identity, BINDING_TTL_SECONDS, schema_name)
            .await?
            .credential;
        let content_id = self.credentials.archive(&identity_credential).await?;

        let mut claims = Map::new();
        claims.insert("identityHash".into(), json!(hash_hex));
        claims.insert("encryptedCID".into(), json!(content_id));
        let binding = self
            .credentials
            .issue(holder_did, claims, BINDING_TTL_SECONDS, Some(CREDENTIAL_BINDING_TYPE))
            .await?;

        self.bindings.write().await.insert(
            binding.credential.id.clone(),
            BindingEntry { content_id: content_id.clone(), identity_hash: hash },
        );
        info!(
            "Bound {} to {} (identity {}, archived as {})",
            binding.credential.id, holder_did, identity_credential.id, content_id
        );

        let message_id = match self.deliver(holder_did, &binding).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!("Binding {} not delivered to {}: {}", binding.credential.id, holder_did, e);
                None
            }
        };

        Ok(IssuedBinding {
            binding,
            identity_credential_id: identity_credential.id,
            content_id,
            identity_hash: hash_hex,
            message_id,
        })
    }

    /// Decrypts the identity archived for `binding_id` and checks it against
    /// the hash the binding credential carries.
    pub async fn retrieve_identity(&self, binding_id: &str) -> Result<BoundIdentity, BindingError> {
        let entry = self
            .bindings
            .read()
            .await
            .get(binding_id)
            .cloned()
            .ok_or_else(|| BindingError::UnknownBinding(binding_id.to_string()))?;

        let credential = self.credentials.retrieve(&entry.content_id).await?;
        let subject = credential.credential_subject;
        let computed = identity_hash(&subject.claims).map_err(CredentialError::from)?;
        if computed != entry.identity_hash {
            return Err(BindingError::HashMismatch {
                binding_id: binding_id.to_string(),
                bound: format!("{:?}", entry.identity_hash),
                computed: format!("{:?}", computed),
            });
        }

        debug!("Identity behind {} verified", binding_id);
        Ok(BoundIdentity {
            binding_id: binding_id.to_string(),
            holder: subject.id,
            identity_hash: format!("{:?}", computed),
            identity: subject.claims,
        })
    }

    async fn deliver(&self, holder_did: &str, binding: &IssuedCredential) -> Result<String, BindingError> {
        let body = serde_json::to_value(&binding.credential).map_err(CredentialError::from)?;
        self.transport
            .send(
                &self.credentials.issuer_did(),
                holder_did,
                body,
                RECEIVE_CREDENTIAL_SERVICE,
                EncryptionMode::Authcrypt,
            )
            .await
            .map_err(BindingError::Delivery)
    }
}
