//! Download accounting.
//!
//! Counters live in the KV store under period-suffixed hashes so every
//! replica increments the same totals. Recording happens off the request
//! path; a failed increment is logged and forgotten.

use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use time::macros::format_description;
use windrose_kv::{KvResult, KvStore, keys};

#[derive(Clone)]
pub struct Stats {
    store: Arc<dyn KvStore>,
}

/// Counters of a file for the current day/month/year plus the all-time
/// total.
#[derive(Debug, Serialize)]
pub struct FileStatsNow {
    pub today: i64,
    pub month: i64,
    pub year: i64,
    pub total: i64,
}

/// Counter of a file over one requested period.
#[derive(Debug, Serialize)]
pub struct FileStatsPeriod {
    pub period: String,
    pub downloads: i64,
}

/// `(day, month, year)` period suffixes for a timestamp, e.g.
/// `("2026_08_02", "2026_08", "2026")`.
fn period_suffixes(now: OffsetDateTime) -> (String, String, String) {
    let day = now
        .format(format_description!("[year]_[month]_[day]"))
        .expect("day format");
    let month = now
        .format(format_description!("[year]_[month]"))
        .expect("month format");
    let year = now.format(format_description!("[year]")).expect("year format");
    (day, month, year)
}

impl Stats {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Record one download served by a mirror. Fire-and-forget.
    pub fn count_download(&self, mirror_id: i32, path: &str, bytes: i64) {
        let store = self.store.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            if let Err(err) = record(&store, mirror_id, &path, bytes).await {
                tracing::warn!(error = %err, mirror_id, %path, "failed to record download");
            }
        });
    }

    /// The day/month/year/total counters of one file.
    pub async fn file_stats_now(&self, path: &str) -> KvResult<FileStatsNow> {
        let (day, month, year) = period_suffixes(OffsetDateTime::now_utc());
        Ok(FileStatsNow {
            today: self.read_counter(&keys::stats_file(&day), path).await?,
            month: self.read_counter(&keys::stats_file(&month), path).await?,
            year: self.read_counter(&keys::stats_file(&year), path).await?,
            total: self.read_counter(&keys::stats_file(""), path).await?,
        })
    }

    /// The counter of one file over a normalized period suffix
    /// (`YYYY[_MM[_DD]]`).
    pub async fn file_stats_period(&self, path: &str, period: &str) -> KvResult<FileStatsPeriod> {
        Ok(FileStatsPeriod {
            period: period.to_string(),
            downloads: self.read_counter(&keys::stats_file(period), path).await?,
        })
    }

    async fn read_counter(&self, key: &str, field: &str) -> KvResult<i64> {
        Ok(self
            .store
            .hash_get(key, field)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }
}

async fn record(store: &Arc<dyn KvStore>, mirror_id: i32, path: &str, bytes: i64) -> KvResult<()> {
    let (day, month, year) = period_suffixes(OffsetDateTime::now_utc());
    let id = mirror_id.to_string();

    // Per-file counters roll up over day, month, year and all time.
    for period in [day.as_str(), month.as_str(), year.as_str(), ""] {
        store
            .hash_incr_by(&keys::stats_file(period), path, 1)
            .await?;
    }
    store.hash_incr_by(&keys::stats_mirror(&day), &id, 1).await?;
    store
        .hash_incr_by(&keys::stats_mirror_bytes(&day), &id, bytes)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use windrose_kv::MemoryStore;

    #[tokio::test]
    async fn download_rolls_up_all_periods() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let stats = Stats::new(store.clone());

        stats.count_download(3, "a.iso", 700);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let now = stats.file_stats_now("a.iso").await.unwrap();
            if now.total == 1 {
                assert_eq!(now.today, 1);
                assert_eq!(now.month, 1);
                assert_eq!(now.year, 1);
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("counters never updated");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let (day, _, _) = period_suffixes(OffsetDateTime::now_utc());
        assert_eq!(
            store
                .hash_get(&keys::stats_mirror(&day), "3")
                .await
                .unwrap()
                .as_deref(),
            Some("1")
        );
        assert_eq!(
            store
                .hash_get(&keys::stats_mirror_bytes(&day), "3")
                .await
                .unwrap()
                .as_deref(),
            Some("700")
        );
    }

    #[tokio::test]
    async fn period_query_reads_one_key() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        store
            .hash_incr_by(&keys::stats_file("2026_08"), "a.iso", 4)
            .await
            .unwrap();

        let stats = Stats::new(store);
        let period = stats.file_stats_period("a.iso", "2026_08").await.unwrap();
        assert_eq!(period.downloads, 4);
        assert_eq!(period.period, "2026_08");

        let missing = stats.file_stats_period("a.iso", "2020").await.unwrap();
        assert_eq!(missing.downloads, 0);
    }
}
