// src/config.rs
//! Runtime settings.
//!
//! Values come from the process environment, after `.env` has been loaded
//! with `dotenv`. Keys are the upper-case names listed on [`Settings`].

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use config::{Config, Environment};
use ethers_core::types::Address;

use crate::error::ConfigError;

pub struct Settings {
    /// `RPC_URL`
    pub rpc_url: String,
    /// `ISSUER_PRIVATE_KEY`, hex secp256k1 secret
    pub issuer_private_key: String,
    /// `REVOCATION_REGISTRY_ADDRESS`
    pub revocation_registry_address: Address,
    /// `SCHEMA_REGISTRY_ADDRESS`
    pub schema_registry_address: Option<Address>,
    /// `VERIFIER_AGENT_URL`, public base URL of this service
    pub verifier_agent_url: String,
    /// `RESOLVER_URL`, universal resolver base
    pub resolver_url: String,
    /// `IPFS_API_URL`
    pub ipfs_api_url: String,
    /// `CHAIN_ID`
    pub chain_id: u64,
    /// `NETWORK_NAME`, used in `did:ethr:<network>:<address>`
    pub network_name: String,
    /// `TX_TIMEOUT_MS`
    pub tx_timeout: Duration,
    /// `TX_CONFIRMATIONS`
    pub tx_confirmations: u64,
    /// `RPC_MIN_INTERVAL_MS`
    pub rpc_min_interval: Duration,
    /// `DID_CACHE_TTL_SECS`
    pub did_cache_ttl: Duration,
    /// `DID_CACHE_CAPACITY`
    pub did_cache_capacity: u64,
    /// `CHALLENGE_TIMEOUT_SECS`
    pub challenge_timeout: Duration,
    /// `NONCE_RETRY_LIMIT`
    pub nonce_retry_limit: u32,
    /// `BIND_ADDR`
    pub bind_addr: SocketAddr,
}

impl Settings {
    /// Loads `.env` (if present) and reads the environment.
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_environment(Environment::default())
    }

    /// Builds settings from an environment source, applying defaults.
    pub fn from_environment(environment: Environment) -> Result<Self, ConfigError> {
        let source = Config::builder()
            .set_default("resolver_url", "https://dev.uniresolver.io")?
            .set_default("ipfs_api_url", "http://localhost:5001")?
            .set_default("chain_id", 11_155_111i64)?
            .set_default("network_name", "sepolia")?
            .set_default("tx_timeout_ms", 1_800_000i64)?
            .set_default("tx_confirmations", 1i64)?
            .set_default("rpc_min_interval_ms", 200i64)?
            .set_default("did_cache_ttl_secs", 86_400i64)?
            .set_default("did_cache_capacity", 500i64)?
            .set_default("challenge_timeout_secs", 300i64)?
            .set_default("nonce_retry_limit", 3i64)?
            .set_default("bind_addr", "127.0.0.1:3008")?
            .add_source(environment)
            .build()?;

        Ok(Self {
            rpc_url: required(&source, "rpc_url")?,
            issuer_private_key: required(&source, "issuer_private_key")?,
            revocation_registry_address: parsed(&source, "revocation_registry_address")?,
            schema_registry_address: match optional(&source, "schema_registry_address")? {
                Some(_) => Some(parsed(&source, "schema_registry_address")?),
                None => None,
            },
            verifier_agent_url: required(&source, "verifier_agent_url")?,
            resolver_url: required(&source, "resolver_url")?,
            ipfs_api_url: required(&source, "ipfs_api_url")?,
            chain_id: parsed(&source, "chain_id")?,
            network_name: required(&source, "network_name")?,
            tx_timeout: Duration::from_millis(parsed(&source, "tx_timeout_ms")?),
            tx_confirmations: parsed(&source, "tx_confirmations")?,
            rpc_min_interval: Duration::from_millis(parsed(&source, "rpc_min_interval_ms")?),
            did_cache_ttl: Duration::from_secs(parsed(&source, "did_cache_ttl_secs")?),
            did_cache_capacity: parsed(&source, "did_cache_capacity")?,
            challenge_timeout: Duration::from_secs(parsed(&source, "challenge_timeout_secs")?),
            nonce_retry_limit: parsed(&source, "nonce_retry_limit")?,
            bind_addr: parsed(&source, "bind_addr")?,
        })
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("rpc_url", &self.rpc_url)
            .field("issuer_private_key", &"<redacted>")
            .field("revocation_registry_address", &self.revocation_registry_address)
            .field("schema_registry_address", &self.schema_registry_address)
            .field("verifier_agent_url", &self.verifier_agent_url)
            .field("resolver_url", &self.resolver_url)
            .field("chain_id", &self.chain_id)
            .field("network_name", &self.network_name)
            .field("bind_addr", &self.bind_addr)
            .finish_non_exhaustive()
    }
}

fn env_name(key: &str) -> String {
    key.to_uppercase()
}

fn optional(source: &Config, key: &str) -> Result<Option<String>, ConfigError> {
    match source.get_string(key) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(config::ConfigError::NotFound(_)) => Ok(None),
        Err(e) => Err(ConfigError::Invalid { key: env_name(key), reason: e.to_string() }),
    }
}

fn required(source: &Config, key: &str) -> Result<String, ConfigError> {
    optional(source, key)?.ok_or_else(|| ConfigError::Missing(env_name(key)))
}

fn parsed<T>(source: &Config, key: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    required(source, key)?
        .parse()
        .map_err(|e: T::Err| ConfigError::Invalid { key: env_name(key), reason: e.to_string() })
}
