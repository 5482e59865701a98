// src/main.rs

//! # vc-trust-engine - Main Entry Point
//!
//! Wires the verifier components together and starts the REST API.
//!
//! ## Initialization Sequence
//! 1. Load settings from `.env` and the environment
//! 2. Load the issuer identity and connect to the JSON-RPC node
//! 3. Build resolver, orchestrator, credential protocol and messaging
//! 4. Publish the verifier's key agreement key and service endpoints
//! 5. Serve HTTP

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{info, warn};

use vc_trust_engine::blockchain::ledger::EthersLedger;
use vc_trust_engine::blockchain::transaction::TransactionOrchestrator;
use vc_trust_engine::config::Settings;
use vc_trust_engine::contracts::credential_registry::revocation_registry;
use vc_trust_engine::contracts::schema_registry::schema_registry;
use vc_trust_engine::services::api_server::ApiServer;
use vc_trust_engine::services::binding::BindingService;
use vc_trust_engine::services::credential_issuer::CredentialService;
use vc_trust_engine::services::did_resolver::{CachedDidResolver, LayeredResolver, UniversalResolver};
use vc_trust_engine::services::identity::IdentityService;
use vc_trust_engine::services::messaging::{HttpChannel, MessagingTransport};
use vc_trust_engine::services::verifier::OwnershipVerifier;
use vc_trust_engine::storage::ipfs_client::IpfsStorage;
use vc_trust_engine::wallet::capabilities::{AgentCapabilities, KeyStore};
use vc_trust_engine::wallet::key_management::KeyManager;

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = Settings::load().context("Invalid configuration")?;
    info!("Starting with {:?}", settings);

    // Identity Agent
    let agent = Arc::new(
        KeyManager::from_private_key(&settings.issuer_private_key, settings.chain_id, &settings.network_name)
            .context("Failed to load issuer key")?,
    );
    let verifier_did = agent.default_did();
    info!("Verifier DID: {}", verifier_did);

    // Ledger
    let ledger = Arc::new(
        EthersLedger::new(&settings.rpc_url, settings.rpc_min_interval).context("Failed to create RPC client")?,
    );
    match ledger.chain_id().await {
        Ok(chain_id) if chain_id != settings.chain_id => {
            warn!("Node reports chain {} but CHAIN_ID is {}", chain_id, settings.chain_id)
        }
        Ok(_) => {}
        Err(e) => warn!("Could not query chain id: {}", e),
    }

    // Resolution: local documents first, then the universal resolver
    let layered = LayeredResolver::new(agent.clone(), Arc::new(UniversalResolver::new(&settings.resolver_url)));
    let resolver = Arc::new(CachedDidResolver::new(
        Arc::new(layered),
        settings.did_cache_ttl,
        settings.did_cache_capacity,
    ));

    let orchestrator = Arc::new(TransactionOrchestrator::new(
        ledger.clone(),
        agent.clone(),
        agent.clone(),
        resolver.clone(),
        settings.tx_confirmations,
        settings.tx_timeout,
    ));

    // Credential protocol
    let capabilities = AgentCapabilities::from_agent(agent.clone());
    let store = Arc::new(IpfsStorage::new(&settings.ipfs_api_url)?);
    let mut credentials = CredentialService::new(
        orchestrator,
        resolver.clone(),
        capabilities.clone(),
        store,
        revocation_registry(settings.revocation_registry_address)?,
        settings.chain_id,
    )
    .with_nonce_retry_limit(settings.nonce_retry_limit);
    if let Some(address) = settings.schema_registry_address {
        credentials = credentials.with_schema_registry(schema_registry(address)?);
    }

    // Messaging and ownership challenges
    let channel = Arc::new(HttpChannel::new(DELIVERY_TIMEOUT)?);
    let transport = Arc::new(MessagingTransport::new(resolver.clone(), capabilities.clone(), channel));
    let verifier = OwnershipVerifier::spawn(transport.clone(), settings.challenge_timeout);

    let identity = Arc::new(IdentityService::new(
        resolver.clone(),
        capabilities,
        &settings.verifier_agent_url,
    ));
    identity
        .initialize_did(&verifier_did)
        .await
        .context("Failed to initialize the verifier DID")?;

    let credentials = Arc::new(credentials);
    let bindings = Arc::new(BindingService::new(credentials.clone(), transport.clone()));

    let api_server = ApiServer::new(
        credentials,
        bindings,
        verifier,
        transport,
        identity,
        resolver,
        ledger,
    );
    api_server.run(settings.bind_addr).await?;
    Ok(())
}
