//! Manifest parsing and the repository path filter.
//!
//! The manifest is a recursive directory listing, one file per line:
//!
//! ```text
//! drwxrwxrwx          4,096 2024/08/08 11:01:29 .
//! -rw-r--r--  3,719,354,368 2024/03/25 16:03:01 openEuler-22.03-LTS/ISO/x86_64/openEuler-22.03-LTS-x86_64-dvd.iso
//! ```
//!
//! The header line fixes the column offsets: the path starts where the
//! header's trailing `.` sits, the 19-character timestamp sits immediately
//! before it, and everything to the left is permissions plus the
//! comma-grouped size.

use time::OffsetDateTime;
use windrose_core::config::{Configuration, RepositoryFilter};
use windrose_core::ptime;

/// Width of `YYYY/MM/DD HH:MM:SS`.
const TIMESTAMP_WIDTH: usize = 19;

/// Column offsets derived from the manifest header line.
#[derive(Clone, Copy, Debug)]
pub struct ManifestLayout {
    size_end: usize,
    time_start: usize,
    time_end: usize,
    path_start: usize,
}

impl ManifestLayout {
    /// Derive offsets from the header line. Returns `None` when the header
    /// is too short to carry a timestamp column.
    pub fn from_header(header: &str) -> Option<Self> {
        let len = header.len();
        if len < TIMESTAMP_WIDTH + 3 {
            return None;
        }
        let path_start = len - 1;
        let time_end = path_start - 1;
        let time_start = time_end - TIMESTAMP_WIDTH;
        Some(Self {
            size_end: time_start - 1,
            time_start,
            time_end,
            path_start,
        })
    }

    /// Split a data line into its raw columns. Lines shorter than the
    /// header cannot hold a path and are skipped.
    pub fn split<'a>(&self, line: &'a str) -> Option<RawEntry<'a>> {
        if line.len() <= self.path_start {
            return None;
        }
        Some(RawEntry {
            size_text: line.get(..self.size_end)?,
            time_text: line.get(self.time_start..self.time_end)?,
            path: line.get(self.path_start..)?,
        })
    }
}

/// Raw manifest columns before normalization.
#[derive(Debug, PartialEq, Eq)]
pub struct RawEntry<'a> {
    pub size_text: &'a str,
    pub time_text: &'a str,
    pub path: &'a str,
}

impl RawEntry<'_> {
    /// Byte size with grouping commas and padding stripped.
    pub fn size(&self) -> i64 {
        let cleaned: String = self
            .size_text
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        cleaned.parse().unwrap_or(0)
    }

    /// Modification time; the manifest uses slashes in the date portion,
    /// which are rewritten to dashes before parsing.
    pub fn mod_time(&self) -> Option<OffsetDateTime> {
        ptime::parse_manifest(&self.time_text.replace('/', "-"))
    }
}

/// Scenarios restricted to installer images: only `.iso` files under these
/// directories are indexed.
const ISO_ONLY_SCENARIOS: [&str; 2] = ["ISO", "edge_img"];

/// Decides which manifest paths become part of the index.
#[derive(Clone, Debug, Default)]
pub struct PathFilter {
    version_prefix: String,
    pairs: Vec<String>,
    particular: Vec<String>,
}

impl PathFilter {
    pub fn from_config(config: &Configuration) -> Self {
        Self::new(&config.repo_version_prefix, &config.repository_filter)
    }

    pub fn new(version_prefix: &str, filter: &RepositoryFilter) -> Self {
        let mut pairs = Vec::with_capacity(filter.second_dir.len() * filter.third_dir.len());
        for scenario in &filter.second_dir {
            for arch in &filter.third_dir {
                pairs.push(format!("{scenario}/{arch}"));
            }
        }
        let particular = filter
            .particular_file
            .iter()
            .flat_map(|m| m.source_path.iter().cloned())
            .collect();
        Self {
            version_prefix: version_prefix.to_string(),
            pairs,
            particular,
        }
    }

    /// Whether a manifest path belongs in the index.
    pub fn accepts(&self, path: &str) -> bool {
        if !path.starts_with(&self.version_prefix) {
            return false;
        }
        if path.ends_with(".sha256sum") {
            return false;
        }
        if self.particular.iter().any(|p| p == path) {
            return true;
        }
        if !self.pairs.iter().any(|pair| path.contains(pair.as_str())) {
            return false;
        }
        let iso_only = ISO_ONLY_SCENARIOS
            .iter()
            .any(|s| path.contains(&format!("/{s}/")));
        if iso_only && !path.ends_with(".iso") {
            return false;
        }
        true
    }
}

/// Read the first whitespace-delimited token of a `<path>.sha256sum`
/// sidecar, if present next to the file in the local repository.
pub fn read_sha256_sidecar(repository_root: &str, path: &str) -> Option<String> {
    let sidecar = format!("{repository_root}/{path}.sha256sum");
    let content = std::fs::read_to_string(sidecar).ok()?;
    content.split_whitespace().next().map(|s| s.to_string())
}
