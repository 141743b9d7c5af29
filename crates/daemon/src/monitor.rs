//! The monitor: one control loop and two worker pools per replica.
//!
//! Every 30 seconds the control loop walks the local mirror map and hands
//! overdue mirrors to the health-check pool (fixed size 10) or the sync
//! pool (size `ConcurrentSync`), but only for mirrors this replica is
//! responsible for. Enqueueing is non-blocking: a saturated pool defers the
//! mirror to the next tick instead of growing a backlog.

use crate::cluster::Cluster;
use crate::error::{ScanError, ScanResult};
use crate::scanner::{Scanner, USER_AGENT, is_stopped, scan_mirror};
use crate::source::scan_source;
use reqwest::StatusCode;
use reqwest::header::CONTENT_LENGTH;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use windrose_core::config;
use windrose_core::{Configuration, Mirror};
use windrose_index::{Cache, RepoTree};
use windrose_kv::{KvError, KvResult, KvStore, keys};

const HEALTH_CHECK_THREADS: usize = 10;
const CONTROL_TICK: Duration = Duration::from_secs(30);
const STORE_READY_BACKOFF: Duration = Duration::from_millis(100);
const MANIFEST_WAIT: Duration = Duration::from_secs(10);
const SOURCE_RETRY: Duration = Duration::from_secs(10);
const MIRROR_LIST_RETRY: Duration = Duration::from_millis(500);

struct MirrorState {
    mirror: Mirror,
    checking: bool,
    scanning: bool,
    last_check: Option<Instant>,
}

enum HealthError {
    /// The mirror has never been scanned; leave `checking` set so the pool
    /// does not thrash until a scan produces handled files.
    NotScanned,
    Kv(KvError),
}

impl From<KvError> for HealthError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::NotFound => HealthError::NotScanned,
            other => HealthError::Kv(other),
        }
    }
}

struct Inner {
    store: Arc<dyn KvStore>,
    cache: Cache,
    tree: Arc<RepoTree>,
    cluster: Arc<Cluster>,
    scanner: Arc<dyn Scanner>,
    mirrors: Mutex<HashMap<i32, MirrorState>>,
    health_tx: mpsc::Sender<i32>,
    sync_tx: mpsc::Sender<i32>,
    stop_tx: watch::Sender<bool>,
    http: reqwest::Client,
}

/// The per-replica background monitor.
pub struct Monitor {
    inner: Arc<Inner>,
    health_rx: Mutex<Option<mpsc::Receiver<i32>>>,
    sync_rx: Mutex<Option<mpsc::Receiver<i32>>>,
}

impl Monitor {
    pub fn new(
        store: Arc<dyn KvStore>,
        cache: Cache,
        tree: Arc<RepoTree>,
        scanner: Arc<dyn Scanner>,
    ) -> Self {
        let (health_tx, health_rx) = mpsc::channel(HEALTH_CHECK_THREADS * 5);
        let (sync_tx, sync_rx) = mpsc::channel(1);
        let (stop_tx, _) = watch::channel(false);
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()
            .expect("failed to build health check HTTP client");

        Self {
            inner: Arc::new(Inner {
                cluster: Cluster::new(store.clone()),
                store,
                cache,
                tree,
                scanner,
                mirrors: Mutex::new(HashMap::new()),
                health_tx,
                sync_tx,
                stop_tx,
                http,
            }),
            health_rx: Mutex::new(Some(health_rx)),
            sync_rx: Mutex::new(Some(sync_rx)),
        }
    }

    /// Signal every loop and pool to shut down.
    pub fn stop(&self) {
        self.inner.cluster.stop();
        let _ = self.inner.stop_tx.send(true);
    }

    /// Run the startup sequence, the pools and the control loop. Returns
    /// once [`Monitor::stop`] is called.
    pub async fn run(&self) -> ScanResult<()> {
        let inner = self.inner.clone();
        let mut stop = inner.stop_tx.subscribe();

        // Startup: wait for the store to be ready.
        loop {
            match inner.store.ping().await {
                Ok(()) => break,
                Err(err) => {
                    if !err.is_retryable() {
                        tracing::warn!(error = %err, "store not reachable yet");
                    }
                    if sleep_or_stop(STORE_READY_BACKOFF, &mut stop).await {
                        return Ok(());
                    }
                }
            }
        }

        // Wait until the manifest exists, then run the initial source scan.
        let manifest = config::global().repository_file_list_text.clone();
        while tokio::fs::metadata(&manifest).await.is_err() {
            tracing::error!(path = %manifest, "manifest not found, waiting");
            if sleep_or_stop(MANIFEST_WAIT, &mut stop).await {
                return Ok(());
            }
        }
        loop {
            match scan_source(&inner.store, &inner.tree, &config::global(), &stop).await {
                Ok(_) => break,
                Err(ScanError::Aborted) => return Ok(()),
                Err(err) => {
                    tracing::error!(error = %err, "unable to scan the local repository");
                    if sleep_or_stop(SOURCE_RETRY, &mut stop).await {
                        return Ok(());
                    }
                }
            }
        }

        // Hydrate the local mirror map.
        loop {
            match inner.mirror_ids().await {
                Ok(ids) => {
                    inner.sync_mirror_list(&ids).await;
                    break;
                }
                Err(err) => {
                    tracing::error!(error = %err, "unable to retrieve the mirror list");
                    if sleep_or_stop(MIRROR_LIST_RETRY, &mut stop).await {
                        return Ok(());
                    }
                }
            }
        }

        if is_stopped(&stop) {
            return Ok(());
        }

        inner.cluster.start();

        // Worker pools.
        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        let health_rx = Arc::new(tokio::sync::Mutex::new(
            self.health_rx
                .lock()
                .expect("health rx lock poisoned")
                .take()
                .expect("monitor already running"),
        ));
        for _ in 0..HEALTH_CHECK_THREADS {
            workers.push(tokio::spawn(health_worker(
                inner.clone(),
                health_rx.clone(),
                inner.stop_tx.subscribe(),
            )));
        }
        let sync_rx = Arc::new(tokio::sync::Mutex::new(
            self.sync_rx
                .lock()
                .expect("sync rx lock poisoned")
                .take()
                .expect("monitor already running"),
        ));
        for _ in 0..config::global().concurrent_sync {
            workers.push(tokio::spawn(sync_worker(
                inner.clone(),
                sync_rx.clone(),
                inner.stop_tx.subscribe(),
            )));
        }

        // Control loop.
        let mut check_ticker = tokio::time::interval(CONTROL_TICK);
        check_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut config_events = config::subscribe();
        let mut invalidations = inner.cache.take_mirror_invalidations();
        let mut repo_interval = config::global().repository_scan_interval();
        let mut repo_ticker = repo_interval.map(delayed_interval);

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = check_ticker.tick() => {
                    inner.schedule(&config::global());
                }
                _ = tick_or_pending(&mut repo_ticker) => {
                    if let Err(err) =
                        scan_source(&inner.store, &inner.tree, &config::global(), &stop).await
                    {
                        tracing::error!(error = %err, "scanning source failed");
                    }
                }
                _ = recv_or_pending(&mut config_events) => {
                    let next = config::global().repository_scan_interval();
                    if next != repo_interval {
                        repo_interval = next;
                        repo_ticker = repo_interval.map(delayed_interval);
                        tracing::info!(interval = ?repo_interval, "repository scan interval updated");
                    }
                }
                event = recv_i32_or_pending(&mut invalidations) => {
                    match event {
                        Some(id) => inner.sync_mirror_list(&[id]).await,
                        // Channel closed; stop polling it.
                        None => invalidations = None,
                    }
                }
            }
        }

        for worker in workers {
            let _ = worker.await;
        }
        Ok(())
    }
}

/// An interval whose first tick fires after one full period, not at zero.
fn delayed_interval(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker
}

async fn tick_or_pending(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn recv_or_pending(rx: &mut mpsc::Receiver<()>) -> Option<()> {
    rx.recv().await
}

async fn recv_i32_or_pending(rx: &mut Option<mpsc::Receiver<i32>>) -> Option<i32> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Sleep, returning true if the stop signal fired first.
async fn sleep_or_stop(duration: Duration, stop: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = stop.changed() => true,
    }
}

impl Inner {
    async fn mirror_ids(&self) -> KvResult<Vec<i32>> {
        let listed = self.store.hash_get_all(keys::MIRRORS).await?;
        Ok(listed.keys().filter_map(|id| id.parse().ok()).collect())
    }

    /// Refresh (or drop) local mirror records, preserving scheduling flags.
    async fn sync_mirror_list(&self, ids: &[i32]) {
        for &id in ids {
            match self.cache.get_mirror(id).await {
                Ok(mirror) => {
                    self.cluster.add_mirror(id);
                    let mut mirrors = self.mirrors.lock().expect("mirror map lock poisoned");
                    match mirrors.get_mut(&id) {
                        Some(state) => state.mirror = mirror,
                        None => {
                            mirrors.insert(
                                id,
                                MirrorState {
                                    mirror,
                                    checking: false,
                                    scanning: false,
                                    last_check: None,
                                },
                            );
                        }
                    }
                }
                Err(KvError::NotFound) => {
                    self.mirrors
                        .lock()
                        .expect("mirror map lock poisoned")
                        .remove(&id);
                    self.cluster.remove_mirror(id);
                    tracing::info!(mirror_id = id, "mirror deleted, dropping local state");
                }
                Err(err) => {
                    tracing::error!(mirror_id = id, error = %err, "fetching mirror failed");
                }
            }
        }
    }

    /// One control tick: enqueue overdue work for mirrors we own.
    fn schedule(&self, config: &Configuration) {
        let mut mirrors = self.mirrors.lock().expect("mirror map lock poisoned");
        let now = time::OffsetDateTime::now_utc();
        for (id, state) in mirrors.iter_mut() {
            if !state.mirror.enabled {
                continue;
            }
            if !self.cluster.is_handled(*id) {
                continue;
            }

            let check_due = state
                .last_check
                .is_none_or(|t| t.elapsed() >= config.check_interval());
            if check_due && !state.checking {
                if self.health_tx.try_send(*id).is_ok() {
                    state.checking = true;
                }
            }

            let sync_due = state.mirror.last_successful_sync.is_none_or(|t| {
                now - t >= time::Duration::try_from(config.scan_interval()).unwrap_or_default()
            });
            if sync_due && !state.scanning {
                if self.sync_tx.try_send(*id).is_ok() {
                    state.scanning = true;
                }
            }
        }
    }

    fn mirror_copy(&self, id: i32) -> Option<Mirror> {
        self.mirrors
            .lock()
            .expect("mirror map lock poisoned")
            .get(&id)
            .map(|state| state.mirror.clone())
    }

    /// HEAD a random handled file on the mirror and classify the outcome.
    async fn health_check(&self, mirror: &Mirror, config: &Configuration) -> Result<(), HealthError> {
        let (file, size) = self.random_handled_file(mirror.id).await?;

        let url = format!("{}/{}", mirror.http_url.trim_end_matches('/'), file);
        let response = match self.http.head(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(mirror = %mirror.name, error = %err, "unable to connect");
                mark_mirror_down(&self.store, mirror.id, "Unreachable").await?;
                return Ok(());
            }
        };

        let status = response.status();
        if status == StatusCode::OK {
            mark_mirror_up(&self.store, mirror.id).await?;
            let remote_size = response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok());
            match remote_size {
                Some(remote) if remote != size => {
                    tracing::warn!(mirror = %mirror.name, %file, local = size, remote, "file size mismatch");
                }
                _ => tracing::debug!(mirror = %mirror.name, "up"),
            }
        } else if status.is_redirection() {
            tracing::warn!(mirror = %mirror.name, %url, "unauthorized redirection");
            mark_mirror_down(&self.store, mirror.id, "Unauthorized redirect").await?;
        } else if status == StatusCode::NOT_FOUND {
            mark_mirror_down(
                &self.store,
                mirror.id,
                &format!("File not found {file} (error 404)"),
            )
            .await?;
            if config.disable_on_missing_file {
                disable_mirror(&self.store, mirror.id).await?;
                tracing::warn!(mirror = %mirror.name, %file, "mirror disabled on missing file");
            }
        } else {
            tracing::warn!(mirror = %mirror.name, status = status.as_u16(), "down");
            mark_mirror_down(
                &self.store,
                mirror.id,
                &format!("Got status code {}", status.as_u16()),
            )
            .await?;
        }
        Ok(())
    }

    async fn random_handled_file(&self, id: i32) -> Result<(String, i64), HealthError> {
        let file = self
            .store
            .set_random_member(&keys::handled_files(id))
            .await?
            .ok_or(HealthError::NotScanned)?;
        let size = self
            .store
            .hash_get(&keys::file(&file), "size")
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        Ok((file, size))
    }
}

/// Mark a mirror reachable. Idempotent.
pub async fn mark_mirror_up(store: &Arc<dyn KvStore>, id: i32) -> KvResult<()> {
    store
        .apply(vec![
            windrose_kv::WriteOp::HashSet {
                key: keys::mirror(id),
                fields: vec![
                    ("up".to_string(), "true".to_string()),
                    ("excludeReason".to_string(), String::new()),
                ],
            },
            windrose_kv::WriteOp::Publish {
                channel: keys::MIRROR_UPDATE.to_string(),
                payload: id.to_string(),
            },
        ])
        .await
}

/// Mark a mirror down, recording why. Idempotent.
pub async fn mark_mirror_down(store: &Arc<dyn KvStore>, id: i32, reason: &str) -> KvResult<()> {
    store
        .apply(vec![
            windrose_kv::WriteOp::HashSet {
                key: keys::mirror(id),
                fields: vec![
                    ("up".to_string(), "false".to_string()),
                    ("excludeReason".to_string(), reason.to_string()),
                ],
            },
            windrose_kv::WriteOp::Publish {
                channel: keys::MIRROR_UPDATE.to_string(),
                payload: id.to_string(),
            },
        ])
        .await
}

/// Administratively disable a mirror.
pub async fn disable_mirror(store: &Arc<dyn KvStore>, id: i32) -> KvResult<()> {
    store
        .apply(vec![
            windrose_kv::WriteOp::HashSet {
                key: keys::mirror(id),
                fields: vec![("enabled".to_string(), "false".to_string())],
            },
            windrose_kv::WriteOp::Publish {
                channel: keys::MIRROR_UPDATE.to_string(),
                payload: id.to_string(),
            },
        ])
        .await
}

async fn health_worker(
    inner: Arc<Inner>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<i32>>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let id = {
            let mut guard = rx.lock().await;
            tokio::select! {
                _ = stop.changed() => return,
                id = guard.recv() => match id {
                    Some(id) => id,
                    None => return,
                },
            }
        };
        if is_stopped(&stop) {
            return;
        }

        let Some(mirror) = inner.mirror_copy(id) else {
            continue;
        };

        match inner.health_check(&mirror, &config::global()).await {
            Err(HealthError::NotScanned) => {
                // 'checking' stays set until a scan provides files to probe.
                continue;
            }
            Err(HealthError::Kv(err)) => {
                tracing::warn!(mirror_id = id, error = %err, "health check store error");
                let mut mirrors = inner.mirrors.lock().expect("mirror map lock poisoned");
                if let Some(state) = mirrors.get_mut(&id) {
                    state.checking = false;
                }
            }
            Ok(()) => {
                let mut mirrors = inner.mirrors.lock().expect("mirror map lock poisoned");
                if let Some(state) = mirrors.get_mut(&id) {
                    state.last_check = Some(Instant::now());
                    state.checking = false;
                }
            }
        }
    }
}

async fn sync_worker(
    inner: Arc<Inner>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<i32>>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let id = {
            let mut guard = rx.lock().await;
            tokio::select! {
                _ = stop.changed() => return,
                id = guard.recv() => match id {
                    Some(id) => id,
                    None => return,
                },
            }
        };

        let Some(mirror) = inner.mirror_copy(id) else {
            continue;
        };

        // Skip when another replica already holds the scan lock.
        match inner.store.exists(&keys::scanning(id)).await {
            Ok(true) => {
                tracing::debug!(mirror = %mirror.name, "scan already in progress on another node");
            }
            Ok(false) if mirror.enabled && !mirror.http_url.is_empty() => {
                tracing::info!(mirror = %mirror.name, "scanning");
                match scan_mirror(
                    &config::global(),
                    &inner.store,
                    &inner.cache,
                    inner.scanner.as_ref(),
                    &mirror.http_url,
                    id,
                    &stop,
                )
                .await
                {
                    Ok(_) if mirror.enabled && !mirror.up => {
                        // A mirror that just synced while down deserves an
                        // immediate health check; defer to the next tick if
                        // the pool is saturated.
                        let _ = inner.health_tx.try_send(id);
                    }
                    Ok(_) => {}
                    Err(ScanError::InProgress) => {
                        tracing::warn!(mirror = %mirror.name, "scan already in progress");
                    }
                    Err(_) => {
                        // scan_mirror already logged the failure.
                    }
                }
            }
            Ok(false) => {}
            Err(err) => {
                if !err.is_retryable() {
                    tracing::warn!(mirror = %mirror.name, error = %err, "sync loop store error");
                }
            }
        }

        let mut mirrors = inner.mirrors.lock().expect("mirror map lock poisoned");
        if let Some(state) = mirrors.get_mut(&id) {
            state.scanning = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::HttpScanner;
    use httpmock::prelude::*;
    use std::io::Write;
    use windrose_kv::MemoryStore;

    fn store_pair() -> (Arc<MemoryStore>, Arc<dyn KvStore>) {
        let mem = Arc::new(MemoryStore::new());
        (mem.clone(), mem as Arc<dyn KvStore>)
    }

    async fn seed_mirror(store: &Arc<dyn KvStore>, id: i32, url: &str, up: bool) {
        let mirror = Mirror {
            id,
            name: format!("mirror-{id}"),
            http_url: url.to_string(),
            enabled: true,
            up,
            ..Default::default()
        };
        store
            .hash_set(keys::MIRRORS, &[(id.to_string(), mirror.name.clone())])
            .await
            .unwrap();
        store
            .hash_set(&keys::mirror(id), &mirror.to_hash())
            .await
            .unwrap();
    }

    fn monitor_with(store: Arc<dyn KvStore>) -> Monitor {
        let cache = Cache::new(store.clone());
        let tree = Arc::new(RepoTree::new());
        let scanner: Arc<dyn Scanner> = Arc::new(HttpScanner::insecure_for_tests(tree.clone()));
        Monitor::new(store, cache, tree, scanner)
    }

    #[tokio::test]
    async fn mark_helpers_round_trip_reason() {
        let (_mem, store) = store_pair();
        mark_mirror_down(&store, 5, "Got status code 500").await.unwrap();
        let record = store.hash_get_all(&keys::mirror(5)).await.unwrap();
        assert_eq!(record.get("up").map(String::as_str), Some("false"));
        assert_eq!(
            record.get("excludeReason").map(String::as_str),
            Some("Got status code 500")
        );

        mark_mirror_up(&store, 5).await.unwrap();
        let record = store.hash_get_all(&keys::mirror(5)).await.unwrap();
        assert_eq!(record.get("up").map(String::as_str), Some("true"));
        assert_eq!(record.get("excludeReason").map(String::as_str), Some(""));
    }

    #[tokio::test]
    async fn health_check_marks_up_on_200() {
        let (_mem, store) = store_pair();
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method("HEAD").path("/f.iso");
            then.status(200).header("Content-Length", "7");
        });

        seed_mirror(&store, 1, &server.base_url(), false).await;
        store.set_add(&keys::handled_files(1), "f.iso").await.unwrap();
        store
            .hash_set("FILE_f.iso", &[("size".into(), "7".into())])
            .await
            .unwrap();

        let monitor = monitor_with(store.clone());
        let mirror = monitor.inner.cache.get_mirror(1).await.unwrap();
        monitor
            .inner
            .health_check(&mirror, &Configuration::for_testing())
            .await
            .map_err(|_| "health check failed")
            .unwrap();

        assert_eq!(
            store.hash_get(&keys::mirror(1), "up").await.unwrap().as_deref(),
            Some("true")
        );
    }

    #[tokio::test]
    async fn health_check_404_marks_down_and_optionally_disables() {
        let (_mem, store) = store_pair();
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method("HEAD").path("/f.iso");
            then.status(404);
        });

        seed_mirror(&store, 1, &server.base_url(), true).await;
        store.set_add(&keys::handled_files(1), "f.iso").await.unwrap();
        store
            .hash_set("FILE_f.iso", &[("size".into(), "7".into())])
            .await
            .unwrap();

        let monitor = monitor_with(store.clone());
        let mirror = monitor.inner.cache.get_mirror(1).await.unwrap();
        let config = Configuration {
            disable_on_missing_file: true,
            ..Configuration::for_testing()
        };
        monitor
            .inner
            .health_check(&mirror, &config)
            .await
            .map_err(|_| "health check failed")
            .unwrap();

        let record = store.hash_get_all(&keys::mirror(1)).await.unwrap();
        assert_eq!(record.get("up").map(String::as_str), Some("false"));
        assert_eq!(record.get("enabled").map(String::as_str), Some("false"));
        assert!(
            record
                .get("excludeReason")
                .is_some_and(|r| r.contains("File not found") && r.contains("404"))
        );
    }

    #[tokio::test]
    async fn health_check_without_scan_leaves_checking_pending() {
        let (_mem, store) = store_pair();
        seed_mirror(&store, 1, "https://unused.example", true).await;

        let monitor = monitor_with(store.clone());
        let mirror = monitor.inner.cache.get_mirror(1).await.unwrap();
        let result = monitor
            .inner
            .health_check(&mirror, &Configuration::for_testing())
            .await;
        assert!(matches!(result, Err(HealthError::NotScanned)));
    }

    #[tokio::test]
    async fn schedule_enqueues_overdue_mirrors_once() {
        let (_mem, store) = store_pair();
        seed_mirror(&store, 1, "https://m1.example", true).await;

        let monitor = monitor_with(store.clone());
        monitor.inner.sync_mirror_list(&[1]).await;

        let config = Configuration::for_testing();
        monitor.inner.schedule(&config);

        let mut health_rx = monitor.health_rx.lock().unwrap().take().unwrap();
        let mut sync_rx = monitor.sync_rx.lock().unwrap().take().unwrap();
        assert_eq!(health_rx.try_recv().ok(), Some(1));
        assert_eq!(sync_rx.try_recv().ok(), Some(1));

        // Flags set; a second tick must not enqueue again.
        monitor.inner.schedule(&config);
        assert!(health_rx.try_recv().is_err());
        assert!(sync_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn schedule_skips_disabled_mirrors() {
        let (_mem, store) = store_pair();
        seed_mirror(&store, 1, "https://m1.example", true).await;
        store
            .hash_set(&keys::mirror(1), &[("enabled".into(), "false".into())])
            .await
            .unwrap();

        let monitor = monitor_with(store.clone());
        monitor.inner.sync_mirror_list(&[1]).await;
        monitor.inner.schedule(&Configuration::for_testing());

        let mut health_rx = monitor.health_rx.lock().unwrap().take().unwrap();
        assert!(health_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sync_mirror_list_drops_deleted_mirrors() {
        let (_mem, store) = store_pair();
        seed_mirror(&store, 1, "https://m1.example", true).await;

        let monitor = monitor_with(store.clone());
        monitor.inner.sync_mirror_list(&[1]).await;
        assert!(monitor.inner.mirror_copy(1).is_some());

        store.delete(&keys::mirror(1)).await.unwrap();
        // The cached record must be dropped before the refresh notices.
        monitor.inner.cache.clear();
        monitor.inner.sync_mirror_list(&[1]).await;
        assert!(monitor.inner.mirror_copy(1).is_none());
    }

    /// End-to-end: startup sequence, initial source scan, scheduling and a
    /// full mirror scan against a mock mirror.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn monitor_scans_mirror_end_to_end() {
        const ISO: &str = "openEuler-24.03/ISO/x86_64/a.iso";

        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("repo.txt");
        let mut f = std::fs::File::create(&manifest).unwrap();
        writeln!(f, "drwxrwxrwx          4,096 2024/08/08 11:01:29 .").unwrap();
        writeln!(f, "-rw-r--r--              7 2025/08/01 10:00:00 {ISO}").unwrap();
        drop(f);

        config::set_global(Configuration {
            repository: dir.path().to_str().unwrap().to_string(),
            repository_file_list_text: manifest.to_str().unwrap().to_string(),
            repository_scan_interval: 0,
            concurrent_sync: 2,
            ..Configuration::for_testing()
        });

        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method("HEAD").path("/");
            then.status(200);
        });
        server.mock(|when, then| {
            when.method("HEAD").path(format!("/{ISO}"));
            then.status(200)
                .header("Content-Length", "7")
                .header("Last-Modified", "Fri, 01 Aug 2025 10:00:00 GMT");
        });

        let (_mem, store) = store_pair();
        seed_mirror(&store, 1, &server.base_url(), true).await;

        let monitor = Arc::new(monitor_with(store.clone()));
        let runner = {
            let monitor = monitor.clone();
            tokio::spawn(async move { monitor.run().await })
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let members = store.set_members(&keys::mirror_files(1)).await.unwrap();
            if members == vec![ISO.to_string()] {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("mirror scan did not complete");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }

        assert_eq!(
            store.set_members(&keys::handled_files(1)).await.unwrap(),
            vec![ISO.to_string()]
        );

        monitor.stop();
        runner.await.unwrap().unwrap();
    }
}
