//! The `KvStore` seam.

use crate::error::KvResult;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::broadcast;

/// An event observed on the store's pub/sub side.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KvEvent {
    /// A message published on one of the subscribed channels.
    Message { channel: String, payload: String },
    /// The pub/sub connection was re-established. Anything cached from
    /// before this point may have missed invalidations and must be dropped.
    Reconnected,
}

/// One write inside an atomic batch.
#[derive(Clone, Debug)]
pub enum WriteOp {
    SetAdd { key: String, member: String },
    SetRemove { key: String, member: String },
    HashSet { key: String, fields: Vec<(String, String)> },
    Delete { key: String },
    Rename { from: String, to: String },
    Publish { channel: String, payload: String },
}

/// The operations windrose needs from the shared store.
///
/// Implementations must be cheap to clone behind an `Arc` and safe to use
/// from many tasks concurrently.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    // Strings.
    async fn string_get(&self, key: &str) -> KvResult<Option<String>>;
    /// SET key value NX EX ttl; true when the key was set.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<bool>;
    /// Delete `key` only while it still holds `value`; true when deleted.
    async fn delete_if_equals(&self, key: &str, value: &str) -> KvResult<bool>;

    // Hashes.
    async fn hash_get(&self, key: &str, field: &str) -> KvResult<Option<String>>;
    async fn hash_get_all(&self, key: &str) -> KvResult<HashMap<String, String>>;
    async fn hash_set(&self, key: &str, fields: &[(String, String)]) -> KvResult<()>;
    async fn hash_delete(&self, key: &str, field: &str) -> KvResult<()>;
    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> KvResult<i64>;

    // Sets.
    async fn set_add(&self, key: &str, member: &str) -> KvResult<()>;
    async fn set_remove(&self, key: &str, member: &str) -> KvResult<()>;
    async fn set_members(&self, key: &str) -> KvResult<Vec<String>>;
    async fn set_random_member(&self, key: &str) -> KvResult<Option<String>>;
    async fn set_random_members(&self, key: &str, count: usize) -> KvResult<Vec<String>>;
    /// Members of `a` not in `b`.
    async fn set_diff(&self, a: &str, b: &str) -> KvResult<Vec<String>>;
    /// Store `a ∩ b` into `dst`, returning the cardinality.
    async fn set_inter_store(&self, dst: &str, a: &str, b: &str) -> KvResult<i64>;

    // Keys.
    async fn delete(&self, key: &str) -> KvResult<()>;
    async fn exists(&self, key: &str) -> KvResult<bool>;
    async fn rename(&self, from: &str, to: &str) -> KvResult<()>;

    /// Apply a batch of writes atomically: either all of them become
    /// visible or none do.
    async fn apply(&self, ops: Vec<WriteOp>) -> KvResult<()>;

    // Pub/sub.
    async fn publish(&self, channel: &str, payload: &str) -> KvResult<()>;
    /// Subscribe to the adapter's event stream. All update channels are
    /// multiplexed; receivers filter by channel name.
    fn subscribe(&self) -> broadcast::Receiver<KvEvent>;

    /// Verify the store is reachable and done loading.
    async fn ping(&self) -> KvResult<()>;
}
