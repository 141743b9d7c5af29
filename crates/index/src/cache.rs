//! Invalidating LRU caches over the shared KV store.
//!
//! Four byte-budgeted caches keep the hot read path off the store: file
//! metadata, per-file mirror lists, mirror records, and per-mirror file
//! entries. A dedicated subscriber task drops entries as invalidations are
//! published, and clears everything when the pub/sub connection had to be
//! re-established (or this subscriber lagged), since either way an unknown
//! number of invalidations was missed.

use quick_cache::Weighter;
use quick_cache::sync::Cache as LruCache;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc};
use windrose_core::geo::great_circle_km;
use windrose_core::{FileInfo, GeoIpRecord, Mirror};
use windrose_kv::{KvError, KvEvent, KvResult, KvStore, keys};

// Reference capacities, in estimated bytes per cache.
const FILE_INFO_CAPACITY: u64 = 1_024_000;
const FILE_MIRRORS_CAPACITY: u64 = 2_048_000;
const MIRROR_CAPACITY: u64 = 1_024_000;
const FILE_INFO_MIRROR_CAPACITY: u64 = 4_096_000;

#[derive(Clone)]
struct FileInfoWeighter;

impl Weighter<String, FileInfo> for FileInfoWeighter {
    fn weight(&self, key: &String, value: &FileInfo) -> u64 {
        (std::mem::size_of::<FileInfo>()
            + key.len()
            + value.path.len()
            + value.sha256.len()
            + value.sha1.len()
            + value.md5.len()) as u64
    }
}

#[derive(Clone)]
struct IdListWeighter;

impl Weighter<String, Arc<Vec<i32>>> for IdListWeighter {
    fn weight(&self, key: &String, value: &Arc<Vec<i32>>) -> u64 {
        (key.len() + value.len() * std::mem::size_of::<i32>()).max(1) as u64
    }
}

#[derive(Clone)]
struct MirrorWeighter;

impl Weighter<i32, Mirror> for MirrorWeighter {
    fn weight(&self, _key: &i32, value: &Mirror) -> u64 {
        (std::mem::size_of::<Mirror>()
            + value.name.len()
            + value.http_url.len()
            + value.country_codes.len()
            + value.excluded_country_codes.len()) as u64
    }
}

fn lru<K, V, W>(capacity: u64, weighter: W) -> LruCache<K, V, W>
where
    K: std::hash::Hash + Eq,
    V: Clone,
    W: Weighter<K, V> + Clone,
{
    LruCache::with_weighter((capacity / 128) as usize, capacity, weighter)
}

struct Shared {
    store: Arc<dyn KvStore>,
    file_info: LruCache<String, FileInfo, FileInfoWeighter>,
    file_mirrors: LruCache<String, Arc<Vec<i32>>, IdListWeighter>,
    mirrors: LruCache<i32, Mirror, MirrorWeighter>,
    file_info_mirror: LruCache<String, FileInfo, FileInfoWeighter>,
    invalidation_tx: mpsc::Sender<i32>,
}

impl Shared {
    fn clear(&self) {
        self.file_info.clear();
        self.file_mirrors.clear();
        self.mirrors.clear();
        self.file_info_mirror.clear();
    }

    fn handle_message(&self, channel: &str, payload: &str) {
        match channel {
            keys::MIRROR_UPDATE => {
                if let Ok(id) = payload.parse::<i32>() {
                    self.mirrors.remove(&id);
                    // Lossy by design: a missing reader must not stall
                    // invalidation processing.
                    let _ = self.invalidation_tx.try_send(id);
                }
            }
            keys::FILE_UPDATE => {
                self.file_info.remove(payload);
            }
            keys::MIRROR_FILE_UPDATE => {
                if let Some((id, path)) = payload.split_once(' ') {
                    self.file_mirrors.remove(path);
                    self.file_info_mirror.remove(&format!("{id}|{path}"));
                }
            }
            _ => {}
        }
    }
}

/// The invalidating cache facade. Clone freely; all clones share state.
#[derive(Clone)]
pub struct Cache {
    shared: Arc<Shared>,
    invalidation_rx: Arc<Mutex<Option<mpsc::Receiver<i32>>>>,
}

impl Cache {
    /// Build the caches and start the invalidation subscriber.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        let (invalidation_tx, invalidation_rx) = mpsc::channel(64);
        let events = store.subscribe();
        let shared = Arc::new(Shared {
            store,
            file_info: lru(FILE_INFO_CAPACITY, FileInfoWeighter),
            file_mirrors: lru(FILE_MIRRORS_CAPACITY, IdListWeighter),
            mirrors: lru(MIRROR_CAPACITY, MirrorWeighter),
            file_info_mirror: lru(FILE_INFO_MIRROR_CAPACITY, FileInfoWeighter),
            invalidation_tx,
        });
        tokio::spawn(run_invalidation(shared.clone(), events));
        Self {
            shared,
            invalidation_rx: Arc::new(Mutex::new(Some(invalidation_rx))),
        }
    }

    /// The stream of mirror ids that have just been invalidated. Single
    /// reader; subsequent calls return `None`.
    pub fn take_mirror_invalidations(&self) -> Option<mpsc::Receiver<i32>> {
        self.invalidation_rx.lock().expect("invalidation lock poisoned").take()
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.shared.clear();
    }

    /// Source file metadata; `NotFound` when the path is not indexed.
    pub async fn get_file_info(&self, path: &str) -> KvResult<FileInfo> {
        if let Some(info) = self.shared.file_info.get(path) {
            return Ok(info);
        }
        let fields = self.shared.store.hash_get_all(&keys::file(path)).await?;
        if fields.is_empty() {
            return Err(KvError::NotFound);
        }
        let info = FileInfo::from_hash(path, &fields);
        self.shared.file_info.insert(path.to_string(), info.clone());
        Ok(info)
    }

    /// One mirror record; `NotFound` when the mirror was deleted.
    pub async fn get_mirror(&self, id: i32) -> KvResult<Mirror> {
        if let Some(mirror) = self.shared.mirrors.get(&id) {
            return Ok(mirror);
        }
        let fields = self.shared.store.hash_get_all(&keys::mirror(id)).await?;
        if fields.is_empty() {
            return Err(KvError::NotFound);
        }
        let mirror = Mirror::from_hash(id, &fields);
        self.shared.mirrors.insert(id, mirror.clone());
        Ok(mirror)
    }

    /// What the mirror reported for a path during its last scan, or `None`
    /// if that scan did not observe the file.
    pub async fn get_file_info_mirror(&self, id: i32, path: &str) -> KvResult<Option<FileInfo>> {
        let cache_key = format!("{id}|{path}");
        if let Some(info) = self.shared.file_info_mirror.get(&cache_key) {
            return Ok(Some(info));
        }
        let fields = self.shared.store.hash_get_all(&keys::file_info(id, path)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        let info = FileInfo::from_hash(path, &fields);
        self.shared.file_info_mirror.insert(cache_key, info.clone());
        Ok(Some(info))
    }

    /// All mirrors serving a path, each with its per-mirror file entry
    /// attached and its distance to the client computed.
    ///
    /// Mirrors deleted between the set read and the record read are
    /// skipped; absence is never fatal here.
    pub async fn get_mirrors(&self, path: &str, client: &GeoIpRecord) -> KvResult<Vec<Mirror>> {
        let ids = self.file_mirror_ids(path).await?;
        let mut mirrors = Vec::with_capacity(ids.len());
        for &id in ids.iter() {
            let mut mirror = match self.get_mirror(id).await {
                Ok(m) => m,
                Err(KvError::NotFound) => continue,
                Err(err) => return Err(err),
            };
            mirror.file_info = self.get_file_info_mirror(id, path).await?;
            mirror.distance_km = if client.is_valid() {
                great_circle_km(
                    client.latitude,
                    client.longitude,
                    mirror.latitude,
                    mirror.longitude,
                )
            } else {
                0.0
            };
            mirrors.push(mirror);
        }
        Ok(mirrors)
    }

    async fn file_mirror_ids(&self, path: &str) -> KvResult<Arc<Vec<i32>>> {
        if let Some(ids) = self.shared.file_mirrors.get(path) {
            if !ids.is_empty() {
                return Ok(ids);
            }
        }
        let members = self.shared.store.set_members(&keys::file_mirrors(path)).await?;
        let mut ids: Vec<i32> = members.iter().filter_map(|m| m.parse().ok()).collect();
        ids.sort_unstable();
        let ids = Arc::new(ids);
        self.shared.file_mirrors.insert(path.to_string(), ids.clone());
        Ok(ids)
    }
}

async fn run_invalidation(shared: Arc<Shared>, mut events: broadcast::Receiver<KvEvent>) {
    loop {
        match events.recv().await {
            Ok(KvEvent::Message { channel, payload }) => {
                shared.handle_message(&channel, &payload);
            }
            Ok(KvEvent::Reconnected) => {
                tracing::info!("pub/sub reconnected, clearing caches");
                shared.clear();
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "invalidation subscriber lagged, clearing caches");
                shared.clear();
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
