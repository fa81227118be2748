//! Blob store seam: put-binary-object plus time-limited read URL issuance.
//!
//! Deliberately small - the production adapter (any S3-compatible object
//! store) implements this trait out of tree. The pipeline only ever puts
//! whole objects and re-signs read URLs; no conditional writes, no deletes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

mod memory;

pub use memory::InMemoryBlobStore;

#[derive(Debug, thiserror::Error)]
pub enum BlobStoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("blob storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store an object under the given key, replacing any previous content.
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), BlobStoreError>;

    /// Issue a fresh time-limited read URL for an existing object. URLs are
    /// never cached by callers; every status read re-signs.
    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, BlobStoreError>;
}

#[async_trait]
impl<B> BlobStore for Arc<B>
where
    B: BlobStore + ?Sized,
{
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), BlobStoreError> {
        (**self).put_object(key, bytes, content_type).await
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, BlobStoreError> {
        (**self).presign_get(key, ttl).await
    }
}
