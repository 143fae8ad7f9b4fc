//! `BlobStore` trait: the keyed string store everything else persists into.
//!
//! The store makes no concurrency promises: a `get` followed by a `set` is not
//! atomic, so two writers doing read-modify-write on the same key can lose
//! each other's updates. Callers that share a key must share a single writer.

use async_trait::async_trait;

use crate::error::StoreError;

/// Backend-agnostic keyed blob store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Replace the value stored under `key`.
    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Remove `key`. Removing a missing key is not an error.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}
