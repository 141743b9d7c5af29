//! Replica membership and mirror assignment.
//!
//! Each replica writes a heartbeat into the `CLUSTER_NODES` hash with its
//! node id; membership is the set of heartbeats younger than the node TTL.
//! Mirrors are assigned by hashing their id into the sorted member list, so
//! all replicas agree on the assignment without talking to each other.
//! Reassignment after a membership change happens lazily at the next
//! scheduling tick; the per-mirror scan lock makes a double scan harmless.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use windrose_kv::{KvResult, KvStore, keys};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
/// A node missing three heartbeats is considered dead.
const NODE_TTL_SECS: i64 = 30;

pub struct Cluster {
    store: Arc<dyn KvStore>,
    node_id: String,
    members: RwLock<Vec<String>>,
    mirrors: Mutex<BTreeSet<i32>>,
    stop: watch::Sender<bool>,
}

impl Cluster {
    pub fn new(store: Arc<dyn KvStore>) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            store,
            node_id: uuid::Uuid::new_v4().to_string(),
            members: RwLock::new(Vec::new()),
            mirrors: Mutex::new(BTreeSet::new()),
            stop,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Begin heartbeating and refreshing membership.
    pub fn start(self: &Arc<Self>) {
        let cluster = self.clone();
        let mut stop = self.stop.subscribe();
        tokio::spawn(async move {
            loop {
                if let Err(err) = cluster.beat_once().await {
                    tracing::warn!(error = %err, "cluster heartbeat failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
                    _ = stop.changed() => break,
                }
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }

    /// Write our heartbeat and refresh the member list, pruning nodes whose
    /// heartbeat expired.
    pub async fn beat_once(&self) -> KvResult<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.store
            .hash_set(
                keys::CLUSTER_NODES,
                &[(self.node_id.clone(), now.to_string())],
            )
            .await?;

        let nodes = self.store.hash_get_all(keys::CLUSTER_NODES).await?;
        let mut live = Vec::with_capacity(nodes.len());
        for (node, stamp) in nodes {
            let fresh = stamp
                .parse::<i64>()
                .is_ok_and(|ts| now - ts <= NODE_TTL_SECS);
            if fresh {
                live.push(node);
            } else {
                tracing::info!(node, "pruning expired cluster node");
                self.store.hash_delete(keys::CLUSTER_NODES, &node).await?;
            }
        }
        live.sort();
        *self.members.write().expect("members lock poisoned") = live;
        Ok(())
    }

    /// Whether this replica is responsible for scanning the given mirror.
    /// True on exactly one live replica for any stable membership.
    pub fn is_handled(&self, mirror_id: i32) -> bool {
        let members = self.members.read().expect("members lock poisoned");
        if members.is_empty() {
            // Membership not refreshed yet; act as a cluster of one rather
            // than letting every mirror go unscanned.
            return true;
        }
        let idx = (stable_hash(mirror_id) % members.len() as u64) as usize;
        members[idx] == self.node_id
    }

    pub fn add_mirror(&self, id: i32) {
        self.mirrors.lock().expect("mirrors lock poisoned").insert(id);
    }

    pub fn remove_mirror(&self, id: i32) {
        self.mirrors.lock().expect("mirrors lock poisoned").remove(&id);
    }

    pub fn mirror_count(&self) -> usize {
        self.mirrors.lock().expect("mirrors lock poisoned").len()
    }

    #[cfg(test)]
    fn with_node_id(store: Arc<dyn KvStore>, node_id: &str) -> Arc<Self> {
        let (stop, _) = watch::channel(false);
        Arc::new(Self {
            store,
            node_id: node_id.to_string(),
            members: RwLock::new(Vec::new()),
            mirrors: Mutex::new(BTreeSet::new()),
            stop,
        })
    }
}

/// FNV-1a over the little-endian mirror id. The assignment must be stable
/// across replicas and releases, which rules out the std hasher.
fn stable_hash(id: i32) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = OFFSET;
    for byte in id.to_le_bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use windrose_kv::MemoryStore;

    #[tokio::test]
    async fn each_mirror_handled_by_exactly_one_replica() {
        let mem = Arc::new(MemoryStore::new());
        let store: Arc<dyn KvStore> = mem.clone();
        let a = Cluster::with_node_id(store.clone(), "node-a");
        let b = Cluster::with_node_id(store.clone(), "node-b");

        a.beat_once().await.unwrap();
        b.beat_once().await.unwrap();
        // Both replicas have now observed both heartbeats.
        a.beat_once().await.unwrap();

        for id in 0..100 {
            let handled = [a.is_handled(id), b.is_handled(id)];
            assert_eq!(
                handled.iter().filter(|h| **h).count(),
                1,
                "mirror {id} handled by {handled:?}"
            );
        }
    }

    #[tokio::test]
    async fn expired_node_is_pruned_and_work_reassigned() {
        let mem = Arc::new(MemoryStore::new());
        let store: Arc<dyn KvStore> = mem.clone();
        let a = Cluster::with_node_id(store.clone(), "node-a");

        a.beat_once().await.unwrap();
        // A dead replica left a stale heartbeat behind.
        let stale = (OffsetDateTime::now_utc().unix_timestamp() - NODE_TTL_SECS - 5).to_string();
        store
            .hash_set(keys::CLUSTER_NODES, &[("node-dead".to_string(), stale)])
            .await
            .unwrap();

        a.beat_once().await.unwrap();
        for id in 0..20 {
            assert!(a.is_handled(id), "sole live replica must handle {id}");
        }
        let nodes = store.hash_get_all(keys::CLUSTER_NODES).await.unwrap();
        assert!(!nodes.contains_key("node-dead"));
    }

    #[tokio::test]
    async fn unrefreshed_membership_acts_as_cluster_of_one() {
        let mem = Arc::new(MemoryStore::new());
        let a = Cluster::with_node_id(mem.clone() as Arc<dyn KvStore>, "node-a");
        assert!(a.is_handled(7));
    }

    #[test]
    fn stable_hash_is_deterministic() {
        assert_eq!(stable_hash(42), stable_hash(42));
        assert_ne!(stable_hash(42), stable_hash(43));
    }
}
