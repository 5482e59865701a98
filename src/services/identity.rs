// src/services/identity.rs
//! Maintenance of the verifier's own DID document.

use std::sync::Arc;

use log::{debug, info};
use serde::Serialize;
use serde_json::Value;

use crate::error::AgentError;
use crate::models::did::{DidDocument, Service, X25519_KEY_TYPE};
use crate::services::did_resolver::{CachedDidResolver, DidResolver};
use crate::services::messaging::{DIDCOMM_SERVICE, REPORT_ABUSE_SERVICE, VERIFY_OWNERSHIP_SERVICE};
use crate::wallet::capabilities::{AgentCapabilities, KeyType};

/// (service type, id fragment and path, description)
const VERIFIER_SERVICES: [(&str, &str, &str); 3] = [
    (DIDCOMM_SERVICE, "didcomm", "Default DIDComm Messaging endpoint"),
    (VERIFY_OWNERSHIP_SERVICE, "ownership-verification", "Ownership verification service"),
    (REPORT_ABUSE_SERVICE, "report-abuse", "Report abuse service"),
];

/// What [`IdentityService::clear_did`] removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClearedDid {
    pub services: usize,
    pub keys: usize,
}

pub struct IdentityService {
    resolver: Arc<CachedDidResolver>,
    agent: AgentCapabilities,
    agent_url: String,
}

impl IdentityService {
    /// `agent_url` is the public base URL the verifier is reachable at.
    pub fn new(resolver: Arc<CachedDidResolver>, agent: AgentCapabilities, agent_url: &str) -> Self {
        Self {
            resolver,
            agent,
            agent_url: agent_url.trim_end_matches('/').to_string(),
        }
    }

    /// Ensures `did` has an X25519 key agreement key and the messaging,
    /// ownership verification and abuse report services. Existing entries of
    /// the same type are left untouched.
    ///
    /// The cached document of `did` is dropped whether or not this succeeds.
    pub async fn initialize_did(&self, did: &str) -> Result<(), AgentError> {
        let result = self.ensure_initialized(did).await;
        self.resolver.invalidate(did).await;
        if result.is_ok() {
            info!("DID {} initialized with services and keys", did);
        }
        result
    }

    /// Removes every service and every X25519 key agreement key from `did`.
    /// The cached document is dropped whether or not this succeeds.
    pub async fn clear_did(&self, did: &str) -> Result<ClearedDid, AgentError> {
        let result = self.remove_services_and_keys(did).await;
        self.resolver.invalidate(did).await;
        if let Ok(cleared) = &result {
            info!(
                "Removed {} services and {} encryption keys from {}",
                cleared.services, cleared.keys, did
            );
        }
        result
    }

    async fn ensure_initialized(&self, did: &str) -> Result<(), AgentError> {
        let document = self.fresh_document(did).await?;

        let has_agreement_key = document
            .verification_method
            .iter()
            .any(|vm| vm.method_type == X25519_KEY_TYPE);
        if !has_agreement_key {
            let kid = self.agent.dids.add_key_agreement_key(did).await?;
            info!("Added encryption key {} to {}", kid, did);
        }

        for (service_type, path, description) in VERIFIER_SERVICES {
            if document.service_of_type(service_type).is_some() {
                continue;
            }
            let service = Service {
                id: format!("{}#{}", did, path),
                service_type: service_type.to_string(),
                service_endpoint: Value::String(format!("{}/{}", self.agent_url, path)),
                description: Some(description.to_string()),
            };
            self.agent.dids.add_service(did, service).await?;
        }
        Ok(())
    }

    async fn remove_services_and_keys(&self, did: &str) -> Result<ClearedDid, AgentError> {
        let keys = self.agent.keys.list_keys(did).await?;
        let document = self.fresh_document(did).await?;
        let mut cleared = ClearedDid::default();
        for service in &document.service {
            if self.agent.dids.remove_service(did, &service.id).await? {
                cleared.services += 1;
            }
        }
        for key in keys.iter().filter(|key| key.key_type == KeyType::X25519) {
            if self.agent.dids.remove_key_agreement_key(did, &key.kid).await? {
                debug!("Removed encryption key {} from {}", key.kid, did);
                cleared.keys += 1;
            }
        }
        Ok(cleared)
    }

    async fn fresh_document(&self, did: &str) -> Result<DidDocument, AgentError> {
        Ok(self.resolver.resolve(&format!("{}?no-cache=true", did)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestEnv;

    fn identity(env: &TestEnv) -> IdentityService {
        IdentityService::new(env.resolver.clone(), env.capabilities(), "https://verifier.example/")
    }

    #[tokio::test]
    async fn test_initialize_adds_key_and_services() {
        let env = TestEnv::new().await;
        let did = env.issuer_did();
        // Warm the cache with the bare document
        let before = env.resolver.resolve(&did).await.unwrap();
        assert!(before.key_agreement_methods().is_empty());

        identity(&env).initialize_did(&did).await.unwrap();

        let after = env.resolver.resolve(&did).await.unwrap();
        assert_eq!(after.key_agreement_methods().len(), 1);
        assert_eq!(
            after.service_of_type(VERIFY_OWNERSHIP_SERVICE).and_then(|s| s.endpoint_url()),
            Some("https://verifier.example/ownership-verification")
        );
        assert_eq!(
            after.service_of_type(DIDCOMM_SERVICE).and_then(|s| s.endpoint_url()),
            Some("https://verifier.example/didcomm")
        );
        assert!(after.service_of_type(REPORT_ABUSE_SERVICE).is_some());
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let env = TestEnv::new().await;
        let did = env.issuer_did();
        let service = identity(&env);
        service.initialize_did(&did).await.unwrap();
        service.initialize_did(&did).await.unwrap();

        let document = env.resolver.resolve(&did).await.unwrap();
        assert_eq!(document.key_agreement_methods().len(), 1);
        assert_eq!(document.service.len(), 3);
    }

    #[tokio::test]
    async fn test_foreign_did_fails_and_invalidates() {
        let env = TestEnv::new().await;
        let holder = env.add_holder(0x21);
        env.resolver.resolve(&holder).await.unwrap();
        let calls = env.remote.calls();

        let err = identity(&env).initialize_did(&holder).await.unwrap_err();
        assert!(matches!(err, AgentError::NotManaged(_)));

        // The error path dropped the cache entry too
        env.resolver.resolve(&holder).await.unwrap();
        assert_eq!(env.remote.calls(), calls + 2);
    }

    #[tokio::test]
    async fn test_clear_removes_services_and_keys() {
        let env = TestEnv::new().await;
        let did = env.issuer_did();
        let service = identity(&env);
        service.initialize_did(&did).await.unwrap();

        assert_eq!(service.clear_did(&did).await.unwrap(), ClearedDid { services: 3, keys: 1 });
        let document = env.resolver.resolve(&did).await.unwrap();
        assert!(document.service.is_empty());
        assert!(document.key_agreement_methods().is_empty());
        assert!(document.key_agreement.is_empty());
        assert!(!document.verification_method.iter().any(|vm| vm.method_type == X25519_KEY_TYPE));
        assert_eq!(env.capabilities().key_agreement_kid(&did).await.unwrap(), None);
        assert_eq!(service.clear_did(&did).await.unwrap(), ClearedDid::default());
    }

    #[tokio::test]
    async fn test_clear_foreign_did_rejected() {
        let env = TestEnv::new().await;
        let holder = env.add_holder(0x21);
        let err = identity(&env).clear_did(&holder).await.unwrap_err();
        assert!(matches!(err, AgentError::NotManaged(_)));
    }

    #[tokio::test]
    async fn test_reinitialize_after_clear_restores_key() {
        let env = TestEnv::new().await;
        let did = env.issuer_did();
        let service = identity(&env);
        service.initialize_did(&did).await.unwrap();
        let kid = env.capabilities().key_agreement_kid(&did).await.unwrap();

        service.clear_did(&did).await.unwrap();
        service.initialize_did(&did).await.unwrap();

        let document = env.resolver.resolve(&did).await.unwrap();
        assert_eq!(document.key_agreement_methods().len(), 1);
        assert_eq!(env.capabilities().key_agreement_kid(&did).await.unwrap(), kid);
    }
}
