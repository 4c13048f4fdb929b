pub mod lease;
pub mod relocation;

use std::{env, sync::Arc};

use anyhow::{anyhow, Result};
use bytes::Bytes;
use object_store::{parse_url, path::Path, ObjectStore, PutMode, PutOptions};
use serde::{Deserialize, Serialize};
use tracing::info;
use url::Url;

pub use crate::{lease::WarmupLease, relocation::RelocationClient};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlobStorageConfig {
    pub path: Option<String>,
    /// Region label attached to relocation pointers.
    #[serde(default = "default_region")]
    pub region: String,
}

fn default_region() -> String {
    "local".to_string()
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        let blob_store_path = format!(
            "file://{}",
            env::current_dir()
                .unwrap()
                .join("geohub_storage/blobs")
                .to_str()
                .unwrap()
        );
        info!("using blob store path: {}", blob_store_path);
        BlobStorageConfig {
            path: Some(blob_store_path),
            region: default_region(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PutResult {
    pub url: String,
    pub size_bytes: u64,
}

#[derive(Clone)]
pub struct BlobStorage {
    object_store: Arc<dyn ObjectStore>,
    path: Path,
    region: String,
}

impl BlobStorage {
    pub fn new(config: BlobStorageConfig) -> Result<Self> {
        let url_str = config
            .path
            .as_ref()
            .ok_or_else(|| anyhow!("blob store path is not configured"))?;
        let url = url_str.parse::<Url>()?;
        let (object_store, path) = parse_url(&url)?;
        Ok(Self {
            object_store: Arc::new(object_store),
            path,
            region: config.region,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Keys may carry slashes ("relocations/<stream>/<id>"); they are real
    /// path separators, not one encoded segment.
    fn full_path(&self, key: &str) -> Path {
        Path::from(format!("{}/{}", self.path, key))
    }

    pub async fn put(&self, key: &str, data: Bytes) -> Result<PutResult> {
        let path = self.full_path(key);
        let size_bytes = data.len() as u64;
        self.object_store.put(&path, data.into()).await?;
        Ok(PutResult {
            url: path.to_string(),
            size_bytes,
        })
    }

    /// Conditional create. Returns false when the key already exists, which
    /// is how the warmup lease detects a holder on another node.
    pub async fn put_if_absent(&self, key: &str, data: Bytes) -> Result<bool> {
        let path = self.full_path(key);
        let opts = PutOptions::from(PutMode::Create);
        match self.object_store.put_opts(&path, data.into(), opts).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn read_bytes(&self, key: &str) -> Result<Bytes> {
        let path = self.full_path(key);
        let result = self
            .object_store
            .get(&path)
            .await
            .map_err(|e| anyhow!("can't get object {:?}: {:?}", path, e))?;
        Ok(result.bytes().await?)
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.object_store.delete(&self.full_path(key)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_storage() -> (tempfile::TempDir, BlobStorage) {
        let dir = tempfile::tempdir().unwrap();
        let config = BlobStorageConfig {
            path: Some(format!("file://{}", dir.path().to_str().unwrap())),
            region: "test".to_string(),
        };
        let storage = BlobStorage::new(config).unwrap();
        (dir, storage)
    }

    #[tokio::test]
    async fn test_put_and_read_back() {
        let (_dir, storage) = test_storage();
        let data = Bytes::from_static(b"payload bytes");
        let result = storage.put("calls/abc", data.clone()).await.unwrap();
        assert_eq!(result.size_bytes, 13);
        assert_eq!(storage.read_bytes("calls/abc").await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_put_if_absent() {
        let (_dir, storage) = test_storage();
        assert!(storage
            .put_if_absent("locks/warmup", Bytes::from_static(b"a"))
            .await
            .unwrap());
        assert!(!storage
            .put_if_absent("locks/warmup", Bytes::from_static(b"b"))
            .await
            .unwrap());
        storage.delete("locks/warmup").await.unwrap();
        assert!(storage
            .put_if_absent("locks/warmup", Bytes::from_static(b"c"))
            .await
            .unwrap());
    }
}
