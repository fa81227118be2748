//! In-memory blob store for dev/test.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{BlobStore, BlobStoreError};

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Vec<u8>,
    content_type: Option<String>,
}

#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    objects: Mutex<HashMap<String, StoredObject>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test/dev introspection: stored byte length of an object.
    pub fn object_size(&self, key: &str) -> Option<usize> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|o| o.bytes.len())
    }

    pub fn object_content_type(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .and_then(|o| o.content_type.clone())
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put_object(
        &self,
        key: &str,
        bytes: Vec<u8>,
        content_type: Option<&str>,
    ) -> Result<(), BlobStoreError> {
        if key.is_empty() {
            return Err(BlobStoreError::Storage("empty object key".to_string()));
        }
        self.objects.lock().unwrap().insert(
            key.to_string(),
            StoredObject {
                bytes,
                content_type: content_type.map(str::to_string),
            },
        );
        Ok(())
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<String, BlobStoreError> {
        if !self.objects.lock().unwrap().contains_key(key) {
            return Err(BlobStoreError::NotFound(key.to_string()));
        }
        // Same shape as a real pre-signed URL: expiry + one-off token, so a
        // fresh call always yields a fresh URL.
        let expires = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        Ok(format!(
            "memory://objects/{}?expires={}&token={}",
            key,
            expires.timestamp(),
            Uuid::now_v7().simple()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_presign() {
        let store = InMemoryBlobStore::new();
        store
            .put_object("processes/p/documents/d/f.pdf", vec![1, 2, 3], Some("application/pdf"))
            .await
            .unwrap();

        let url = store
            .presign_get("processes/p/documents/d/f.pdf", Duration::from_secs(3600))
            .await
            .unwrap();
        assert!(url.contains("processes/p/documents/d/f.pdf"));
        assert!(url.contains("expires="));
        assert_eq!(store.object_size("processes/p/documents/d/f.pdf"), Some(3));
    }

    #[tokio::test]
    async fn presign_of_missing_object_fails() {
        let store = InMemoryBlobStore::new();
        assert!(matches!(
            store.presign_get("nope", Duration::from_secs(60)).await,
            Err(BlobStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn urls_are_never_reused() {
        let store = InMemoryBlobStore::new();
        store.put_object("k", vec![0], None).await.unwrap();
        let a = store.presign_get("k", Duration::from_secs(60)).await.unwrap();
        let b = store.presign_get("k", Duration::from_secs(60)).await.unwrap();
        assert_ne!(a, b);
    }
}
