// src/storage/mod.rs
//! Content-addressed storage for issued credentials.

pub mod ipfs_client;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageError;

/// Content Store capability: JSON objects addressed by content id.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Stores `object` and returns its content id.
    async fn put(&self, object: &Value) -> Result<String, StorageError>;

    async fn get(&self, content_id: &str) -> Result<Value, StorageError>;

    /// Unpins `content_id`. Returns `false` when it was not stored.
    async fn delete(&self, content_id: &str) -> Result<bool, StorageError>;
}
