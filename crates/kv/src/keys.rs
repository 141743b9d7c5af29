//! The key and channel schema of the shared store.
//!
//! Every key written by any replica is formatted here, so the schema has
//! exactly one definition.

/// Set of all authoritative repository paths.
pub const FILES: &str = "FILES";
/// Staging set during a source rescan.
pub const FILES_TMP: &str = "FILES_TMP";
/// Hash of mirror id -> mirror name.
pub const MIRRORS: &str = "MIRRORS";
/// Hash of replica node id -> last heartbeat (unix seconds).
pub const CLUSTER_NODES: &str = "CLUSTER_NODES";
/// Cluster lock guarding the source rescan commit.
pub const SOURCE_REPO_SYNC: &str = "SOURCE_REPO_SYNC";

/// Channel: a mirror record changed; payload is the decimal mirror id.
pub const MIRROR_UPDATE: &str = "MIRROR_UPDATE";
/// Channel: a source file changed; payload is the path.
pub const FILE_UPDATE: &str = "FILE_UPDATE";
/// Channel: a per-mirror file entry changed; payload is `"<id> <path>"`.
pub const MIRROR_FILE_UPDATE: &str = "MIRROR_FILE_UPDATE";

pub fn file(path: &str) -> String {
    format!("FILE_{path}")
}

pub fn mirror(id: i32) -> String {
    format!("MIRROR_{id}")
}

pub fn mirror_files(id: i32) -> String {
    format!("MIRRORFILES_{id}")
}

pub fn mirror_files_tmp(id: i32) -> String {
    format!("MIRRORFILESTMP_{id}")
}

pub fn file_mirrors(path: &str) -> String {
    format!("FILEMIRRORS_{path}")
}

pub fn file_info(id: i32, path: &str) -> String {
    format!("FILEINFO_{id}_{path}")
}

pub fn handled_files(id: i32) -> String {
    format!("HANDLEDFILES_{id}")
}

pub fn scanning(id: i32) -> String {
    format!("SCANNING_{id}")
}

/// Per-file download counters; `period` is `YYYY`, `YYYY_MM`, `YYYY_MM_DD`
/// or empty for the all-time key.
pub fn stats_file(period: &str) -> String {
    if period.is_empty() {
        "STATS_FILE".to_string()
    } else {
        format!("STATS_FILE_{period}")
    }
}

pub fn stats_mirror(period: &str) -> String {
    format!("STATS_MIRROR_{period}")
}

pub fn stats_mirror_bytes(period: &str) -> String {
    format!("STATS_MIRROR_BYTES_{period}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_match_schema() {
        assert_eq!(file("a/b.iso"), "FILE_a/b.iso");
        assert_eq!(mirror(7), "MIRROR_7");
        assert_eq!(mirror_files_tmp(7), "MIRRORFILESTMP_7");
        assert_eq!(file_info(7, "a/b.iso"), "FILEINFO_7_a/b.iso");
        assert_eq!(scanning(7), "SCANNING_7");
        assert_eq!(stats_file(""), "STATS_FILE");
        assert_eq!(stats_file("2026_08_02"), "STATS_FILE_2026_08_02");
        assert_eq!(stats_mirror_bytes("2026_08_02"), "STATS_MIRROR_BYTES_2026_08_02");
    }
}
