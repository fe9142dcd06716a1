//! Storage container client.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::ProviderError;

/// Blob API of one storage account.
#[async_trait]
pub trait BlobClient: Send + Sync {
    /// All blobs of a container, keyed by blob name.
    ///
    /// A missing container is reported as `NotFound`.
    async fn list(&self, container: &str) -> Result<BTreeMap<String, String>, ProviderError>;

    /// Create the container if it does not exist.
    async fn ensure_container(&self, container: &str) -> Result<(), ProviderError>;

    /// Create or overwrite a blob.
    async fn put(&self, container: &str, key: &str, body: &str) -> Result<(), ProviderError>;

    async fn delete(&self, container: &str, key: &str) -> Result<(), ProviderError>;
}
