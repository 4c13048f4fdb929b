//! Best-effort distributed mutual exclusion for the warmup loop. One fleet
//! node should perform warmup per interval; nothing breaks if two do, so the
//! lease errs on the side of availability.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use bytes::Bytes;
use geohub_utils::epoch_ms;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::BlobStorage;

const LEASE_KEY: &str = "locks/warmup";

#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    owner: String,
    expires_at_ms: u64,
}

pub struct WarmupLease {
    storage: Arc<BlobStorage>,
    owner: String,
    ttl: Duration,
}

impl WarmupLease {
    pub fn new(storage: Arc<BlobStorage>, owner: String, ttl: Duration) -> Self {
        Self {
            storage,
            owner,
            ttl,
        }
    }

    /// Attempts to take the lease. `Ok(false)` means another node holds it;
    /// an `Err` means the lease service itself is unreachable, which callers
    /// treat as permission to proceed anyway.
    pub async fn try_acquire(&self) -> Result<bool> {
        if self.try_put().await? {
            return Ok(true);
        }
        // A holder exists. Break the lease only if its record expired.
        let existing = self.storage.read_bytes(LEASE_KEY).await?;
        let record: LeaseRecord = match serde_json::from_slice(&existing) {
            Ok(record) => record,
            // Unreadable record: treat as stale.
            Err(_) => LeaseRecord {
                owner: "unknown".to_string(),
                expires_at_ms: 0,
            },
        };
        if record.owner != self.owner && record.expires_at_ms > epoch_ms() {
            debug!(owner = %record.owner, "warmup lease is held elsewhere");
            return Ok(false);
        }
        // Expired, or our own record from the previous interval: refresh it.
        self.storage.delete(LEASE_KEY).await?;
        self.try_put().await
    }

    async fn try_put(&self) -> Result<bool> {
        let record = LeaseRecord {
            owner: self.owner.clone(),
            expires_at_ms: epoch_ms() + self.ttl.as_millis() as u64,
        };
        let body = Bytes::from(serde_json::to_vec(&record)?);
        self.storage.put_if_absent(LEASE_KEY, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BlobStorageConfig;

    fn lease_storage() -> (tempfile::TempDir, Arc<BlobStorage>) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(
            BlobStorage::new(BlobStorageConfig {
                path: Some(format!("file://{}", dir.path().to_str().unwrap())),
                region: "test".to_string(),
            })
            .unwrap(),
        );
        (dir, storage)
    }

    #[tokio::test]
    async fn test_lease_excludes_second_holder() {
        let (_dir, storage) = lease_storage();
        let a = WarmupLease::new(storage.clone(), "node-a".to_string(), Duration::from_secs(60));
        let b = WarmupLease::new(storage, "node-b".to_string(), Duration::from_secs(60));

        assert!(a.try_acquire().await.unwrap());
        assert!(!b.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_holder_can_reacquire() {
        let (_dir, storage) = lease_storage();
        let a = WarmupLease::new(storage, "node-a".to_string(), Duration::from_secs(60));
        assert!(a.try_acquire().await.unwrap());
        assert!(a.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lease_is_broken() {
        let (_dir, storage) = lease_storage();
        let short = WarmupLease::new(storage.clone(), "node-a".to_string(), Duration::ZERO);
        let other = WarmupLease::new(storage, "node-b".to_string(), Duration::from_secs(60));

        assert!(short.try_acquire().await.unwrap());
        // node-a's record is already expired, so node-b may take over.
        assert!(other.try_acquire().await.unwrap());
    }
}
