//! Source repository rescans.
//!
//! Parses the authoritative manifest, rebuilds the in-memory tree, and
//! reconciles the `FILES` universe in the KV store: new and changed paths
//! are (re)written and published, paths absent from the new manifest are
//! deleted and published, and the staging set is renamed over the live one.
//! The KV commit happens under the `SOURCE_REPO_SYNC` cluster lock so two
//! replicas rescanning simultaneously cannot interleave their batches.

use crate::error::{ScanError, ScanResult};
use crate::scanner::is_stopped;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use windrose_core::Configuration;
use windrose_core::ptime::format_rfc1123;
use windrose_index::manifest::{ManifestLayout, PathFilter, read_sha256_sidecar};
use windrose_index::{RepoTree, TreeBuilder};
use windrose_kv::{ClusterLock, KvStore, WriteOp, keys};

const SOURCE_LOCK_TTL: Duration = Duration::from_secs(10 * 60);
const SOURCE_LOCK_RETRIES: u32 = 10;

struct FileRecord {
    path: String,
    size: i64,
    mod_time: Option<OffsetDateTime>,
    sha256: Option<String>,
}

/// Rescan the manifest and commit the result to the tree and the KV store.
/// Returns the number of indexed files.
pub async fn scan_source(
    store: &Arc<dyn KvStore>,
    tree: &RepoTree,
    config: &Configuration,
    stop: &watch::Receiver<bool>,
) -> ScanResult<usize> {
    let manifest_path = config.repository_file_list_text.clone();
    let text = tokio::fs::read_to_string(&manifest_path)
        .await
        .map_err(|err| ScanError::Source(format!("{manifest_path}: {err}")))?;

    tracing::info!("scanning the source manifest");

    // Parsing touches one sha256 sidecar per file, so it runs off the
    // async workers.
    let parse_config = config.clone();
    let (builder, records) = tokio::task::spawn_blocking(move || {
        parse_manifest(&text, &parse_config)
    })
    .await
    .map_err(|err| ScanError::Source(format!("manifest parse task failed: {err}")))??;

    if is_stopped(stop) {
        return Err(ScanError::Aborted);
    }

    tree.commit(builder, config);

    let lock = ClusterLock::new(
        store.clone(),
        keys::SOURCE_REPO_SYNC,
        "source repository",
        SOURCE_LOCK_TTL,
    );
    let mut token = None;
    for _ in 0..SOURCE_LOCK_RETRIES {
        if let Some(t) = lock.acquire().await? {
            token = Some(t);
            break;
        }
        if is_stopped(stop) {
            return Err(ScanError::Aborted);
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    let Some(token) = token else {
        return Err(ScanError::InProgress);
    };

    let result = sync_kv(store, &records).await;

    if let Err(err) = lock.release(token).await {
        tracing::warn!(error = %err, "failed to release source scan lock");
    }
    result?;

    tracing::info!(files = records.len(), "source manifest indexed");
    Ok(records.len())
}

fn parse_manifest(
    text: &str,
    config: &Configuration,
) -> ScanResult<(TreeBuilder, Vec<FileRecord>)> {
    let mut lines = text.lines();
    let header = lines
        .next()
        .ok_or_else(|| ScanError::Source("manifest is empty".into()))?;
    let layout = ManifestLayout::from_header(header)
        .ok_or_else(|| ScanError::Source("manifest header is malformed".into()))?;

    let filter = PathFilter::from_config(config);
    let mut builder = TreeBuilder::new(config.repository.clone());
    let mut records = Vec::new();

    for line in lines {
        let Some(entry) = layout.split(line) else {
            continue;
        };
        if !filter.accepts(entry.path) {
            continue;
        }
        let size = entry.size();
        let mod_time = entry.mod_time();
        let sha256 = read_sha256_sidecar(&config.repository, entry.path);
        builder.insert_full(entry.path, size, mod_time, sha256.clone());
        records.push(FileRecord {
            path: entry.path.to_string(),
            size,
            mod_time,
            sha256,
        });
    }

    Ok((builder, records))
}

async fn sync_kv(store: &Arc<dyn KvStore>, records: &[FileRecord]) -> ScanResult<()> {
    // Stage the new universe of paths.
    let mut ops = Vec::with_capacity(records.len() + 1);
    ops.push(WriteOp::Delete {
        key: keys::FILES_TMP.to_string(),
    });
    for record in records {
        ops.push(WriteOp::SetAdd {
            key: keys::FILES_TMP.to_string(),
            member: record.path.clone(),
        });
    }
    store.apply(ops).await?;

    let removed = store.set_diff(keys::FILES, keys::FILES_TMP).await?;

    let mut ops = Vec::with_capacity(records.len() * 2 + removed.len() * 2 + 1);
    for record in records {
        let mut fields = vec![("size".to_string(), record.size.to_string())];
        if let Some(t) = record.mod_time {
            fields.push(("modTime".to_string(), format_rfc1123(t)));
        }
        if let Some(sha) = &record.sha256 {
            fields.push(("sha256".to_string(), sha.clone()));
        }
        ops.push(WriteOp::HashSet {
            key: keys::file(&record.path),
            fields,
        });
        ops.push(WriteOp::Publish {
            channel: keys::FILE_UPDATE.to_string(),
            payload: record.path.clone(),
        });
    }
    for path in &removed {
        tracing::debug!(%path, "file left the repository");
        ops.push(WriteOp::Delete {
            key: keys::file(path),
        });
        ops.push(WriteOp::Publish {
            channel: keys::FILE_UPDATE.to_string(),
            payload: path.clone(),
        });
    }
    if records.is_empty() {
        // RENAME on a nonexistent staging set would fail; an empty
        // manifest clears the universe instead.
        ops.push(WriteOp::Delete {
            key: keys::FILES.to_string(),
        });
    } else {
        ops.push(WriteOp::Rename {
            from: keys::FILES_TMP.to_string(),
            to: keys::FILES.to_string(),
        });
    }
    store.apply(ops).await?;
    Ok(())
}
