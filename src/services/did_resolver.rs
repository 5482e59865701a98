// src/services/did_resolver.rs
//! DID resolution and caching.
//!
//! Resolution goes through three layers:
//! - [`CachedDidResolver`]: TTL + LRU cache in front of everything else, with
//!   explicit invalidation after local mutations
//! - [`LayeredResolver`]: documents managed by the local agent first, then
//!   the network
//! - [`UniversalResolver`]: HTTP client for a DIF universal resolver

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers_core::types::Address;
use log::{debug, info};
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use serde_json::Value;

use crate::error::ResolutionError;
use crate::models::did::{DidDocument, DidUrl};

/// Produces the current DID document for a DID or DID URL.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DidResolver: Send + Sync {
    async fn resolve(&self, did: &str) -> Result<DidDocument, ResolutionError>;
}

/// Resolver backed by a universal resolver deployment (`GET /1.0/identifiers/{did}`).
pub struct UniversalResolver {
    client: reqwest::Client,
    base_url: String,
}

impl UniversalResolver {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl DidResolver for UniversalResolver {
    async fn resolve(&self, did: &str) -> Result<DidDocument, ResolutionError> {
        let failed = |reason: String| ResolutionError::Failed { did: did.to_string(), reason };
        let url = format!("{}/1.0/identifiers/{}", self.base_url, did);

        let response = self
            .client
            .get(&url)
            .header("Accept", "application/did+ld+json, application/json")
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ResolutionError::NotFound(did.to_string()));
        }
        if !status.is_success() {
            return Err(failed(format!("resolver returned {}", status)));
        }

        let mut body: Value = response.json().await.map_err(|e| failed(e.to_string()))?;
        // Resolution results wrap the document; bare documents are accepted as well
        let document = match body.get_mut("didDocument") {
            Some(Value::Null) => return Err(ResolutionError::NotFound(did.to_string())),
            Some(document) => document.take(),
            None => body,
        };
        serde_json::from_value(document).map_err(|e| failed(format!("invalid DID document: {}", e)))
    }
}

/// Tries `local` first and falls back to `remote` when the DID is unknown locally.
pub struct LayeredResolver {
    local: Arc<dyn DidResolver>,
    remote: Arc<dyn DidResolver>,
}

impl LayeredResolver {
    pub fn new(local: Arc<dyn DidResolver>, remote: Arc<dyn DidResolver>) -> Self {
        Self { local, remote }
    }
}

#[async_trait]
impl DidResolver for LayeredResolver {
    async fn resolve(&self, did: &str) -> Result<DidDocument, ResolutionError> {
        match self.local.resolve(did).await {
            Err(ResolutionError::NotFound(_)) => self.remote.resolve(did).await,
            other => other,
        }
    }
}

/// Caching front for any [`DidResolver`].
///
/// Entries live for `ttl` and at most `capacity` are kept, least recently used
/// evicted first. A resolution that was in flight when [`invalidate`] ran is
/// returned to its caller but not cached.
///
/// [`invalidate`]: CachedDidResolver::invalidate
pub struct CachedDidResolver {
    inner: Arc<dyn DidResolver>,
    cache: Cache<String, DidDocument>,
    invalidations: AtomicU64,
}

impl CachedDidResolver {
    pub fn new(inner: Arc<dyn DidResolver>, ttl: Duration, capacity: u64) -> Self {
        info!("DID cache: ttl={}s, capacity={}", ttl.as_secs(), capacity);
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self { inner, cache, invalidations: AtomicU64::new(0) }
    }

    /// Derives the chain address from the document's recovery method.
    pub async fn derive_address(&self, did: &str) -> Result<Address, ResolutionError> {
        let document = self.resolve(did).await?;
        document
            .recovery_address()
            .ok_or_else(|| ResolutionError::AddressNotFound(did.to_string()))
    }

    /// Drops the cached document of `did`; the next resolution goes to the source.
    pub async fn invalidate(&self, did: &str) {
        let key = DidUrl::parse(did).map(|url| url.did).unwrap_or_else(|_| did.to_string());
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.cache.invalidate(&key).await;
        debug!("Invalidated DID cache entry for {}", key);
    }

    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

#[async_trait]
impl DidResolver for CachedDidResolver {
    async fn resolve(&self, did: &str) -> Result<DidDocument, ResolutionError> {
        let url = DidUrl::parse(did)?;
        if url.no_cache() {
            debug!("Resolving {} without cache", url.did);
            return self.inner.resolve(&url.did).await;
        }

        if let Some(document) = self.cache.get(&url.did).await {
            debug!("DID cache hit for {}", url.did);
            return Ok(document);
        }

        let generation = self.invalidations.load(Ordering::SeqCst);
        let document = self.inner.resolve(&url.did).await?;
        if self.invalidations.load(Ordering::SeqCst) == generation {
            self.cache.insert(url.did, document.clone()).await;
        } else {
            debug!("Not caching {}: invalidated during resolution", url.did);
        }
        Ok(document)
    }
}
