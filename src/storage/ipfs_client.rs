// src/storage/ipfs_client.rs
//! IPFS storage client.
//!
//! IPFS content is readable by anyone who knows the CID, so the credential
//! service pins encrypted envelopes here, never plaintext credentials.

use std::io::Cursor;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::TryStreamExt;
use ipfs_api_backend_hyper::{IpfsApi, IpfsClient, TryFromUri};
use log::{debug, warn};
use serde_json::Value;
use tokio::task;

use super::ContentStore;
use crate::error::{ConfigError, StorageError};
use crate::utils::serialization::{deserialize, serialize};

/// Shared IPFS HTTP API client.
///
/// The hyper backend's futures are not `Send`, so every request runs on a
/// dedicated current-thread runtime inside `spawn_blocking`.
#[derive(Clone)]
pub struct IpfsStorage {
    client: Arc<IpfsClient>,
}

impl IpfsStorage {
    /// Connects to the node API at `api_url` (e.g. `http://localhost:5001`).
    pub fn new(api_url: &str) -> Result<Self, ConfigError> {
        let client = IpfsClient::from_str(api_url).map_err(|e| ConfigError::Invalid {
            key: "IPFS_API_URL".into(),
            reason: e.to_string(),
        })?;
        Ok(Self { client: Arc::new(client) })
    }

    async fn run<T, F, Fut>(&self, job: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<IpfsClient>) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<T, StorageError>>,
    {
        let client = self.client.clone();
        task::spawn_blocking(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| StorageError::Ipfs(e.to_string()))?;
            rt.block_on(job(client))
        })
        .await
        .map_err(|e| StorageError::Ipfs(e.to_string()))?
    }

    /// Stores raw bytes and returns the CID.
    pub async fn store_data(&self, data: Vec<u8>) -> Result<String, StorageError> {
        self.run(move |client| async move {
            client
                .add(Cursor::new(data))
                .await
                .map(|res| res.hash)
                .map_err(|e| StorageError::Ipfs(e.to_string()))
        })
        .await
    }

    /// Retrieves raw bytes by CID.
    pub async fn retrieve_data(&self, cid: &str) -> Result<Vec<u8>, StorageError> {
        let cid = cid.to_string();
        self.run(move |client| async move {
            client
                .cat(&cid)
                .try_fold(BytesMut::new(), |mut acc, chunk| async move {
                    acc.extend_from_slice(&chunk);
                    Ok(acc)
                })
                .await
                .map(|bytes| bytes.to_vec())
                .map_err(|e| classify(&cid, e.to_string()))
        })
        .await
    }
}

fn classify(cid: &str, reason: String) -> StorageError {
    if reason.contains("not found") || reason.contains("not pinned") {
        StorageError::NotFound(cid.to_string())
    } else {
        StorageError::Ipfs(reason)
    }
}

#[async_trait]
impl ContentStore for IpfsStorage {
    async fn put(&self, object: &Value) -> Result<String, StorageError> {
        let json = serialize(object).map_err(|e| StorageError::Decode(e.to_string()))?;
        let cid = self.store_data(json.into_bytes()).await?;
        debug!("Stored {} on IPFS", cid);
        Ok(cid)
    }

    async fn get(&self, content_id: &str) -> Result<Value, StorageError> {
        let bytes = self.retrieve_data(content_id).await?;
        let json = String::from_utf8(bytes).map_err(|e| StorageError::Decode(e.to_string()))?;
        deserialize(&json).map_err(|e| StorageError::Decode(e.to_string()))
    }

    async fn delete(&self, content_id: &str) -> Result<bool, StorageError> {
        let cid = content_id.to_string();
        let removed = self
            .run(move |client| async move {
                match client.pin_rm(&cid, true).await {
                    Ok(res) => Ok(!res.pins.is_empty()),
                    Err(e) => match classify(&cid, e.to_string()) {
                        StorageError::NotFound(_) => Ok(false),
                        other => Err(other),
                    },
                }
            })
            .await?;
        if !removed {
            warn!("{} was not pinned", content_id);
        }
        Ok(removed)
    }
}
