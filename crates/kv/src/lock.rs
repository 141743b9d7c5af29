//! Cluster-wide named locks with TTL.
//!
//! A lock is a key holding an opaque token. The TTL guarantees a crashed
//! holder cannot wedge the cluster; the token guarantees a slow holder whose
//! lease expired cannot release a lock someone else has since acquired.

use crate::error::KvResult;
use crate::traits::KvStore;
use std::sync::Arc;
use std::time::Duration;

/// Proof of lock ownership, returned by [`ClusterLock::acquire`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockToken(String);

/// A named lock shared by every replica.
pub struct ClusterLock {
    store: Arc<dyn KvStore>,
    key: String,
    owner: String,
    ttl: Duration,
}

impl ClusterLock {
    pub fn new(
        store: Arc<dyn KvStore>,
        key: impl Into<String>,
        owner: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            owner: owner.into(),
            ttl,
        }
    }

    /// Try to take the lock. `None` means it is held elsewhere.
    pub async fn acquire(&self) -> KvResult<Option<LockToken>> {
        let token = format!("{}:{}", self.owner, uuid::Uuid::new_v4());
        if self.store.set_nx_ex(&self.key, &token, self.ttl).await? {
            Ok(Some(LockToken(token)))
        } else {
            Ok(None)
        }
    }

    /// Release the lock if the token still owns it.
    pub async fn release(&self, token: LockToken) -> KvResult<()> {
        self.store.delete_if_equals(&self.key, &token.0).await?;
        Ok(())
    }

    /// Whether the lock is currently held by anyone.
    pub async fn is_held(&self) -> KvResult<bool> {
        self.store.exists(&self.key).await
    }
}
