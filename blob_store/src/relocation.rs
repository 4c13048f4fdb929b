//! Out-of-band transfer of payloads that exceed a connector's in-band limit.
//! Only a small pointer travels through the normal call path; the bytes go
//! through the blob store.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use data_model::RelocationPointer;
use tracing::info;
use uuid::Uuid;

use crate::BlobStorage;

const RELOCATION_PREFIX: &str = "relocations";

#[derive(Clone)]
pub struct RelocationClient {
    storage: Arc<BlobStorage>,
}

impl RelocationClient {
    pub fn new(storage: Arc<BlobStorage>) -> Self {
        Self { storage }
    }

    /// Uploads the payload and returns the pointer to submit in its place.
    pub async fn relocate(&self, stream_id: &str, bytes: Bytes) -> Result<RelocationPointer> {
        let key = format!("{}/{}/{}", RELOCATION_PREFIX, stream_id, Uuid::new_v4());
        let size = bytes.len();
        self.storage.put(&key, bytes).await?;
        info!(
            stream_id = %stream_id,
            key = %key,
            "relocated payload, total byte size: {}",
            size
        );
        Ok(RelocationPointer {
            region: self.storage.region().to_string(),
            key,
        })
    }

    /// Downloads the bytes a connector parked behind a pointer.
    pub async fn resolve(&self, pointer: &RelocationPointer) -> Result<Bytes> {
        if pointer.key.is_empty() {
            return Err(anyhow!("relocation pointer without a key"));
        }
        self.storage.read_bytes(&pointer.key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlobStorageConfig;

    #[tokio::test]
    async fn test_relocate_and_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(
            BlobStorage::new(BlobStorageConfig {
                path: Some(format!("file://{}", dir.path().to_str().unwrap())),
                region: "test".to_string(),
            })
            .unwrap(),
        );
        let client = RelocationClient::new(storage);

        let original = Bytes::from(vec![7u8; 128 * 1024]);
        let pointer = client.relocate("stream-1", original.clone()).await.unwrap();
        assert_eq!(pointer.region, "test");

        let resolved = client.resolve(&pointer).await.unwrap();
        assert_eq!(resolved, original);
    }

    #[tokio::test]
    async fn test_resolve_empty_pointer_fails() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(
            BlobStorage::new(BlobStorageConfig {
                path: Some(format!("file://{}", dir.path().to_str().unwrap())),
                region: "test".to_string(),
            })
            .unwrap(),
        );
        let client = RelocationClient::new(storage);
        let pointer = RelocationPointer {
            region: "test".to_string(),
            key: String::new(),
        };
        assert!(client.resolve(&pointer).await.is_err());
    }
}
