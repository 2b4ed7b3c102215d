//! Cluster-wide lock coordination through etcd.
//!
//! [`EtcdExclusion`] uses etcd's lock service: each critical section is an
//! etcd lock named `<prefix>/mutex/<file>` held under a short lease, so a
//! crashed server cannot keep a file blocked past the lease TTL.
//! [`EtcdLockStore`] keeps each file's lock set as JSON under
//! `<prefix>/locks/<file>`.
//!
//! All etcd failures surface as [`NfsError::LockCoordination`].

use async_trait::async_trait;
use etcd_client::{Client, GetOptions, LockOptions};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{NfsError, Result};
use crate::lock::Lock;
use crate::lock_manager::{Exclusion, LockStore};
use crate::state::FileId;

/// Default TTL of the lease backing a held critical section.
pub const DEFAULT_LEASE_TTL_SECS: i64 = 10;

fn etcd_error(op: &str, e: etcd_client::Error) -> NfsError {
    NfsError::coordination(format!("etcd {} failed: {}", op, e))
}

/// Connect to an etcd cluster.
pub async fn connect(endpoints: &[String]) -> Result<Client> {
    Client::connect(endpoints, None)
        .await
        .map_err(|e| etcd_error("connect", e))
}

/// Per-file critical section backed by etcd locks.
#[derive(Clone)]
pub struct EtcdExclusion {
    client: Client,
    prefix: String,
    lease_ttl_secs: i64,
}

/// Held etcd lock and the lease keeping it alive.
pub struct EtcdGuard {
    key: Vec<u8>,
    lease_id: i64,
}

impl EtcdExclusion {
    /// Exclusion over locks named under `prefix`.
    pub fn new(client: Client, prefix: impl Into<String>) -> Self {
        EtcdExclusion {
            client,
            prefix: prefix.into(),
            lease_ttl_secs: DEFAULT_LEASE_TTL_SECS,
        }
    }

    /// How long a crashed holder can keep a file blocked.
    pub fn with_lease_ttl(mut self, secs: i64) -> Self {
        self.lease_ttl_secs = secs.max(1);
        self
    }

    fn lock_name(&self, file: &FileId) -> String {
        format!("{}/mutex/{}", self.prefix, file.to_hex())
    }

    async fn revoke(&self, lease_id: i64) {
        let mut client = self.client.clone();
        if let Err(e) = client.lease_revoke(lease_id).await {
            warn!("Failed to revoke etcd lease {:#x}: {}", lease_id, e);
        }
    }
}

#[async_trait]
impl Exclusion for EtcdExclusion {
    type Guard = EtcdGuard;

    async fn acquire(&self, file: &FileId, timeout: Duration) -> Result<EtcdGuard> {
        let mut client = self.client.clone();
        let lease_id = client
            .lease_grant(self.lease_ttl_secs, None)
            .await
            .map_err(|e| etcd_error("lease grant", e))?
            .id();

        let name = self.lock_name(file);
        let options = LockOptions::new().with_lease(lease_id);
        match tokio::time::timeout(timeout, client.lock(name.as_str(), Some(options))).await {
            Ok(Ok(resp)) => {
                debug!("Acquired etcd lock {}", name);
                Ok(EtcdGuard {
                    key: resp.key().to_vec(),
                    lease_id,
                })
            }
            Ok(Err(e)) => {
                self.revoke(lease_id).await;
                Err(etcd_error("lock", e))
            }
            Err(_) => {
                self.revoke(lease_id).await;
                Err(NfsError::coordination(format!(
                    "timed out after {:?} waiting for {}",
                    timeout, name
                )))
            }
        }
    }

    async fn release(&self, guard: EtcdGuard) -> Result<()> {
        let mut client = self.client.clone();
        let unlocked = client.unlock(guard.key).await;
        self.revoke(guard.lease_id).await;
        unlocked.map(|_| ()).map_err(|e| etcd_error("unlock", e))
    }

    async fn is_held(&self, file: &FileId) -> Result<bool> {
        let mut client = self.client.clone();
        let resp = client
            .get(
                format!("{}/", self.lock_name(file)),
                Some(GetOptions::new().with_prefix().with_count_only()),
            )
            .await
            .map_err(|e| etcd_error("get", e))?;
        Ok(resp.count() > 0)
    }
}

/// Lock sets stored as JSON documents in etcd.
#[derive(Clone)]
pub struct EtcdLockStore {
    client: Client,
    prefix: String,
}

impl EtcdLockStore {
    /// Store keeping lock sets under `prefix`.
    pub fn new(client: Client, prefix: impl Into<String>) -> Self {
        EtcdLockStore {
            client,
            prefix: prefix.into(),
        }
    }

    fn key(&self, file: &FileId) -> String {
        format!("{}/locks/{}", self.prefix, file.to_hex())
    }
}

#[async_trait]
impl LockStore for EtcdLockStore {
    async fn load(&self, file: &FileId) -> Result<Vec<Lock>> {
        let mut client = self.client.clone();
        let resp = client
            .get(self.key(file), None)
            .await
            .map_err(|e| etcd_error("get", e))?;
        match resp.kvs().first() {
            Some(kv) => serde_json::from_slice(kv.value())
                .map_err(|e| NfsError::coordination(format!("corrupt lock set: {}", e))),
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, file: &FileId, locks: Vec<Lock>) -> Result<()> {
        let mut client = self.client.clone();
        if locks.is_empty() {
            client
                .delete(self.key(file), None)
                .await
                .map_err(|e| etcd_error("delete", e))?;
            return Ok(());
        }
        let value = serde_json::to_vec(&locks)
            .map_err(|e| NfsError::coordination(format!("encode lock set: {}", e)))?;
        client
            .put(self.key(file), value, None)
            .await
            .map_err(|e| etcd_error("put", e))?;
        Ok(())
    }
}
