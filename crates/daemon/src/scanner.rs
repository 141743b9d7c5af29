//! Per-mirror HTTPS scans.
//!
//! A scan probes every selector-list file on a mirror with HEAD requests,
//! records what the mirror serves into the KV store inside one atomic
//! batch, then reconciles the mirror's previous file set: files the mirror
//! dropped are detached from `FILEMIRRORS_<path>` and their per-mirror
//! entries deleted. Only one scan per mirror runs cluster-wide, guarded by
//! the `SCANNING_<id>` lock.

use crate::error::{ScanError, ScanResult};
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, LAST_MODIFIED};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use windrose_core::ptime::{self, Precision};
use windrose_core::{Configuration, ptime::format_rfc1123};
use windrose_index::{Cache, RepoTree};
use windrose_kv::{ClusterLock, KvError, KvStore, WriteOp, keys};

/// Upper bound on a worst-case scan; the lock must outlive the scan or a
/// second replica could start a concurrent one.
const SCAN_LOCK_TTL: Duration = Duration::from_secs(30 * 60);
const RETRY_AFTER_429: Duration = Duration::from_secs(1);
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Some mirrors answer bot user agents with 403, so probes present a
/// browser one.
pub(crate) const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.36";

pub(crate) fn is_stopped(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

/// Summary of one successful mirror scan.
#[derive(Clone, Debug)]
pub struct ScanOutcome {
    pub mirror_id: i32,
    pub mirror_name: String,
    pub files_indexed: i64,
    pub known_indexed: i64,
    pub removed: i64,
    pub tz_offset_ms: i64,
}

/// Accumulates the writes of one scan so they commit atomically.
pub struct ScanTransaction {
    mirror_id: i32,
    ops: Vec<WriteOp>,
    count: i64,
}

impl ScanTransaction {
    fn new(mirror_id: i32) -> Self {
        Self {
            mirror_id,
            // Any staging leftover from a crashed scan goes first.
            ops: vec![WriteOp::Delete {
                key: keys::mirror_files_tmp(mirror_id),
            }],
            count: 0,
        }
    }

    /// Record one file observed on the mirror.
    pub fn add_file(&mut self, path: &str, size: i64, mod_time: Option<OffsetDateTime>) {
        let id = self.mirror_id;
        self.ops.push(WriteOp::SetAdd {
            key: keys::mirror_files_tmp(id),
            member: path.to_string(),
        });
        self.ops.push(WriteOp::SetAdd {
            key: keys::file_mirrors(path),
            member: id.to_string(),
        });
        let mut fields = vec![("size".to_string(), size.to_string())];
        if let Some(t) = mod_time {
            fields.push(("modTime".to_string(), format_rfc1123(t)));
        }
        self.ops.push(WriteOp::HashSet {
            key: keys::file_info(id, path),
            fields,
        });
        self.ops.push(WriteOp::Publish {
            channel: keys::MIRROR_FILE_UPDATE.to_string(),
            payload: format!("{id} {path}"),
        });
        self.count += 1;
    }

    pub fn files_indexed(&self) -> i64 {
        self.count
    }
}

/// A mirror scanner variant. The monitor holds one behind the trait and
/// does not care how probing is implemented.
#[async_trait]
pub trait Scanner: Send + Sync {
    async fn scan(
        &self,
        url: &str,
        identifier: &str,
        txn: &mut ScanTransaction,
        stop: &watch::Receiver<bool>,
    ) -> ScanResult<Precision>;
}

/// HEAD-probe scanner over HTTPS.
pub struct HttpScanner {
    client: reqwest::Client,
    tree: Arc<RepoTree>,
    require_https: bool,
}

impl HttpScanner {
    pub fn new(tree: Arc<RepoTree>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(HEAD_TIMEOUT)
            .connect_timeout(HEAD_TIMEOUT)
            .no_proxy()
            .build()
            .expect("failed to build scan HTTP client");
        Self {
            client,
            tree,
            require_https: true,
        }
    }

    #[cfg(test)]
    pub(crate) fn insecure_for_tests(tree: Arc<RepoTree>) -> Self {
        Self {
            require_https: false,
            ..Self::new(tree)
        }
    }
}

#[async_trait]
impl Scanner for HttpScanner {
    async fn scan(
        &self,
        url: &str,
        identifier: &str,
        txn: &mut ScanTransaction,
        stop: &watch::Receiver<bool>,
    ) -> ScanResult<Precision> {
        let selector = self.tree.selector();
        if selector.is_empty() {
            return Err(ScanError::EmptySelector);
        }
        if self.require_https && !url.starts_with("https://") {
            return Err(ScanError::NotHttps {
                url: url.to_string(),
            });
        }
        if is_stopped(stop) {
            return Err(ScanError::Aborted);
        }

        let head = self.client.head(url).send().await?;
        if head.status() != StatusCode::OK {
            return Err(ScanError::BaseUnreachable {
                url: url.to_string(),
                status: head.status().as_u16(),
            });
        }

        let base = url.trim_end_matches('/');
        for entry in selector.iter() {
            let path = entry.path();
            let file_url = format!("{base}/{path}");

            let response = loop {
                if is_stopped(stop) {
                    return Err(ScanError::Aborted);
                }
                let response = self.client.head(&file_url).send().await?;
                if response.status() == StatusCode::TOO_MANY_REQUESTS {
                    tracing::debug!(mirror = identifier, %path, "throttled, retrying");
                    tokio::time::sleep(RETRY_AFTER_429).await;
                    continue;
                }
                break response;
            };

            if response.status() != StatusCode::OK {
                return Err(ScanError::File {
                    path,
                    status: response.status().as_u16(),
                });
            }

            let size = response
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(0);
            if size != entry.size {
                return Err(ScanError::SizeMismatch {
                    path,
                    expected: entry.size,
                    actual: size,
                });
            }

            // Unparsable Last-Modified yields no time, not a scan failure.
            let mod_time = response
                .headers()
                .get(LAST_MODIFIED)
                .and_then(|v| v.to_str().ok())
                .and_then(ptime::parse_rfc1123);

            txn.add_file(&path, size, mod_time);
        }

        Ok(Precision::SECOND)
    }
}

/// Run a full scan of one mirror, holding the cluster-wide scan lock.
pub async fn scan_mirror(
    config: &Configuration,
    store: &Arc<dyn KvStore>,
    cache: &Cache,
    scanner: &dyn Scanner,
    url: &str,
    id: i32,
    stop: &watch::Receiver<bool>,
) -> ScanResult<ScanOutcome> {
    let name = store
        .hash_get(keys::MIRRORS, &id.to_string())
        .await?
        .ok_or(KvError::NotFound)?;

    let lock = ClusterLock::new(
        store.clone(),
        keys::scanning(id),
        name.clone(),
        SCAN_LOCK_TTL,
    );
    let Some(token) = lock.acquire().await? else {
        return Err(ScanError::InProgress);
    };

    let result = run_locked_scan(config, store, cache, scanner, url, id, &name, stop).await;

    if let Err(err) = &result {
        // Drop the staging set and detach the offending file, if the error
        // names one.
        let _ = store.delete(&keys::mirror_files_tmp(id)).await;
        if let Some(path) = err.file_path() {
            tracing::warn!(mirror = %name, %path, "removing failed file from mirror");
            let _ = store
                .apply(vec![
                    WriteOp::SetRemove {
                        key: keys::file_mirrors(path),
                        member: id.to_string(),
                    },
                    WriteOp::Delete {
                        key: keys::file_info(id, path),
                    },
                    WriteOp::Publish {
                        channel: keys::MIRROR_FILE_UPDATE.to_string(),
                        payload: format!("{id} {path}"),
                    },
                ])
                .await;
        }
        tracing::error!(mirror = %name, error = %err, "scan failed");
    }

    if let Err(err) = lock.release(token).await {
        tracing::warn!(mirror = %name, error = %err, "failed to release scan lock");
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn run_locked_scan(
    config: &Configuration,
    store: &Arc<dyn KvStore>,
    cache: &Cache,
    scanner: &dyn Scanner,
    url: &str,
    id: i32,
    name: &str,
    stop: &watch::Receiver<bool>,
) -> ScanResult<ScanOutcome> {
    set_last_sync(store, id, Precision(0), false).await?;

    let mut txn = ScanTransaction::new(id);
    let started = std::time::Instant::now();
    let precision = scanner.scan(url, name, &mut txn, stop).await?;
    tracing::info!(
        mirror = name,
        files = txn.count,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "probe pass finished"
    );

    let indexed = txn.count;
    store.apply(txn.ops).await?;

    // Files the previous scan saw but this one did not.
    let dropped = store
        .set_diff(&keys::mirror_files(id), &keys::mirror_files_tmp(id))
        .await?;
    if !dropped.is_empty() {
        let mut ops = Vec::with_capacity(dropped.len() * 3);
        for path in &dropped {
            tracing::debug!(mirror = name, %path, "no longer served by mirror");
            ops.push(WriteOp::SetRemove {
                key: keys::file_mirrors(path),
                member: id.to_string(),
            });
            ops.push(WriteOp::Delete {
                key: keys::file_info(id, path),
            });
            ops.push(WriteOp::Publish {
                channel: keys::MIRROR_FILE_UPDATE.to_string(),
                payload: format!("{id} {path}"),
            });
        }
        store.apply(ops).await?;
    }

    if indexed > 0 {
        store
            .rename(&keys::mirror_files_tmp(id), &keys::mirror_files(id))
            .await?;
    }

    let known = store
        .set_inter_store(&keys::handled_files(id), keys::FILES, &keys::mirror_files(id))
        .await?;

    set_last_sync(store, id, precision, true).await?;

    let tz_offset_ms = match adjust_tz_offset(config, store, cache, id, name, precision).await {
        Ok(ms) => ms,
        Err(err) => {
            tracing::warn!(mirror = name, error = %err, "unable to check timezone shifts");
            0
        }
    };

    tracing::info!(
        mirror = name,
        indexed,
        known,
        removed = dropped.len(),
        "scan finished"
    );

    Ok(ScanOutcome {
        mirror_id: id,
        mirror_name: name.to_string(),
        files_indexed: indexed,
        known_indexed: known,
        removed: dropped.len() as i64,
        tz_offset_ms,
    })
}

/// Record the scan attempt (and, on success, the sync protocol/precision)
/// on the mirror record.
async fn set_last_sync(
    store: &Arc<dyn KvStore>,
    id: i32,
    precision: Precision,
    successful: bool,
) -> ScanResult<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp().to_string();
    let mut fields = vec![("lastSync".to_string(), now.clone())];
    if successful {
        fields.push(("lastSuccessfulSync".to_string(), now));
        fields.push(("lastSuccessfulSyncProtocol".to_string(), "https".to_string()));
        fields.push((
            "lastSuccessfulSyncPrecision".to_string(),
            precision.or_second().to_store(),
        ));
    }
    store
        .apply(vec![
            WriteOp::HashSet {
                key: keys::mirror(id),
                fields,
            },
            WriteOp::Publish {
                channel: keys::MIRROR_UPDATE.to_string(),
                payload: id.to_string(),
            },
        ])
        .await?;
    Ok(())
}

/// Infer a systematic mirror clock offset by sampling handled files.
///
/// When `FixTimezoneOffsets` is off, any previously stored offset is reset
/// to zero.
async fn adjust_tz_offset(
    config: &Configuration,
    store: &Arc<dyn KvStore>,
    cache: &Cache,
    id: i32,
    name: &str,
    precision: Precision,
) -> ScanResult<i64> {
    let mut offset_ms = 0i64;

    if config.fix_timezone_offsets {
        let paths = store
            .set_random_members(&keys::handled_files(id), 100)
            .await?;

        let mut pairs = Vec::with_capacity(paths.len());
        for path in &paths {
            let Ok(local) = cache.get_file_info(path).await else {
                continue;
            };
            let Ok(Some(remote)) = cache.get_file_info_mirror(id, path).await else {
                continue;
            };
            let (Some(local_time), Some(remote_time)) = (local.mod_time, remote.mod_time) else {
                continue;
            };
            if local.size != remote.size {
                // Sizes differ, the modTime comparison would be meaningless.
                continue;
            }
            pairs.push((local_time, remote_time));
        }

        // Fewer than half the samples usable is too suspicious to act on.
        if pairs.len() >= 10 && pairs.len() * 2 >= paths.len() {
            let mut counts: HashMap<i64, usize> = HashMap::new();
            for (local, remote) in &pairs {
                let local_ms =
                    (ptime::truncate(*local, precision).unix_timestamp_nanos() / 1_000_000) as i64;
                let remote_ms =
                    (ptime::truncate(*remote, precision).unix_timestamp_nanos() / 1_000_000) as i64;
                *counts.entry(local_ms - remote_ms).or_default() += 1;
            }
            let threshold = pairs.len() * 90 / 100;
            match counts.iter().find(|&(_, &count)| count >= threshold.max(1)) {
                Some((&offset, _)) => offset_ms = offset,
                None => tracing::warn!(mirror = name, "unable to guess the timezone offset"),
            }
        } else if !paths.is_empty() {
            tracing::warn!(mirror = name, "unable to guess the timezone offset");
        }
    }

    store
        .apply(vec![
            WriteOp::HashSet {
                key: keys::mirror(id),
                fields: vec![("tzoffset".to_string(), offset_ms.to_string())],
            },
            WriteOp::Publish {
                channel: keys::MIRROR_UPDATE.to_string(),
                payload: id.to_string(),
            },
        ])
        .await?;

    if offset_ms != 0 {
        tracing::info!(mirror = name, offset_ms, "timezone offset detected");
    }
    Ok(offset_ms)
}
