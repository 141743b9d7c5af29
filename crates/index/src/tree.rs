//! The in-memory repository tree.
//!
//! Two trees exist at any time: the live tree served to readers and a
//! staging tree being populated by the current manifest scan. A scan builds
//! its [`TreeBuilder`] privately and commits it with one write-lock swap, so
//! readers always observe a complete snapshot: whichever `Arc` they cloned
//! stays consistent until dropped.

use crate::manifest::read_sha256_sidecar;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use time::{Duration, OffsetDateTime};
use windrose_core::Configuration;
use windrose_core::config::ParticularFileMapping;

/// Versions whose newest file is older than this enumerate only one probe
/// file per directory instead of every file ("frozen" versions).
const FRESH_WINDOW: Duration = Duration::days(7 * 30);

#[derive(Clone, Debug, Default)]
struct Node {
    size: i64,
    sha256: String,
    mod_time: Option<OffsetDateTime>,
    is_file: bool,
    children: BTreeMap<String, Node>,
}

impl Node {
    fn find(&self, path: &str) -> Option<&Node> {
        let mut node = self;
        for seg in path.split('/').filter(|s| !s.is_empty()) {
            node = node.children.get(seg)?;
        }
        Some(node)
    }
}

/// One file of the selector list used to probe mirrors.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SelectorEntry {
    pub dir: String,
    pub name: String,
    pub size: i64,
    #[serde(skip)]
    pub mod_time: Option<OffsetDateTime>,
}

impl SelectorEntry {
    pub fn path(&self) -> String {
        format!("{}/{}", self.dir, self.name)
    }
}

/// A published repository version with its scenario/arch matrix.
#[derive(Clone, Debug, Serialize)]
pub struct RepoVersion {
    pub name: String,
    pub lts: bool,
    pub scenarios: Vec<Scenario>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Scenario {
    pub name: String,
    pub arches: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Dir,
}

/// One entry of the per-version display listing.
#[derive(Clone, Debug, Serialize)]
pub struct DisplayFile {
    pub name: String,
    pub size: i64,
    pub sha256: String,
    pub kind: FileKind,
}

/// The files of one `(scenario, arch)` directory.
#[derive(Clone, Debug, Serialize)]
pub struct DisplayFileArray {
    pub scenario: String,
    pub arch: String,
    pub files: Vec<DisplayFile>,
}

/// Staging tree under construction by a manifest scan.
pub struct TreeBuilder {
    root: Node,
    /// Per top-level version: the path and modTime of its newest file.
    recent: HashMap<String, (String, OffsetDateTime)>,
    repository_root: String,
    file_count: usize,
}

impl TreeBuilder {
    pub fn new(repository_root: impl Into<String>) -> Self {
        Self {
            root: Node::default(),
            recent: HashMap::new(),
            repository_root: repository_root.into(),
            file_count: 0,
        }
    }

    pub fn file_count(&self) -> usize {
        self.file_count
    }

    /// Insert one accepted manifest path, reading its `.sha256sum` sidecar
    /// from the local repository when present.
    pub fn insert(&mut self, path: &str, size: i64, mod_time: Option<OffsetDateTime>) {
        let sha256 = read_sha256_sidecar(&self.repository_root, path);
        self.insert_full(path, size, mod_time, sha256);
    }

    /// Insert with a pre-read checksum.
    pub fn insert_full(
        &mut self,
        path: &str,
        size: i64,
        mod_time: Option<OffsetDateTime>,
        sha256: Option<String>,
    ) {
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let Some((leaf, dirs)) = segments.split_last() else {
            return;
        };

        let mut node = &mut self.root;
        for seg in dirs {
            node = node.children.entry(seg.to_string()).or_default();
        }
        let file = node.children.entry(leaf.to_string()).or_default();
        file.size = size;
        file.mod_time = mod_time;
        file.is_file = true;
        if let Some(sha) = sha256 {
            file.sha256 = sha;
        }
        self.file_count += 1;

        if let (Some(version), Some(t)) = (segments.first(), mod_time) {
            let slot = self.recent.entry(version.to_string()).or_insert_with(|| {
                (path.to_string(), t)
            });
            if t > slot.1 {
                *slot = (path.to_string(), t);
            }
        }
    }
}

#[derive(Default)]
struct State {
    live: Arc<Node>,
    selector: Arc<Vec<SelectorEntry>>,
    versions: Arc<Vec<RepoVersion>>,
    display: HashMap<String, Arc<Vec<DisplayFileArray>>>,
}

/// The shared live tree plus everything derived from it.
pub struct RepoTree {
    inner: RwLock<State>,
}

impl RepoTree {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(State::default()),
        }
    }

    /// Swap the staging tree in and rebuild the derived lists.
    pub fn commit(&self, builder: TreeBuilder, config: &Configuration) {
        let versions = build_versions(&builder.root, config);
        let selector = build_selector(&builder, config, OffsetDateTime::now_utc());

        let mut state = self.inner.write().expect("tree lock poisoned");
        state.live = Arc::new(builder.root);
        state.selector = Arc::new(selector);
        state.versions = Arc::new(versions);
        state.display.clear();
    }

    /// The current selector list; empty until the first commit.
    pub fn selector(&self) -> Arc<Vec<SelectorEntry>> {
        self.inner.read().expect("tree lock poisoned").selector.clone()
    }

    /// The published version listing.
    pub fn versions(&self) -> Arc<Vec<RepoVersion>> {
        self.inner.read().expect("tree lock poisoned").versions.clone()
    }

    /// Whether a path is a file of the current live tree.
    pub fn contains_file(&self, path: &str) -> bool {
        let live = self.inner.read().expect("tree lock poisoned").live.clone();
        live.find(path).is_some_and(|n| n.is_file)
    }

    /// The display listing of one version, memoized until the next commit.
    pub fn file_list(&self, version: &str, config: &Configuration) -> Arc<Vec<DisplayFileArray>> {
        {
            let state = self.inner.read().expect("tree lock poisoned");
            if let Some(cached) = state.display.get(version) {
                return cached.clone();
            }
        }

        let mut state = self.inner.write().expect("tree lock poisoned");
        if let Some(cached) = state.display.get(version) {
            return cached.clone();
        }
        let listing = Arc::new(flatten_version(
            &state.live,
            version,
            &config.repository_filter.particular_file,
        ));
        state.display.insert(version.to_string(), listing.clone());
        listing
    }
}

impl Default for RepoTree {
    fn default() -> Self {
        Self::new()
    }
}

fn normalize_arch(name: &str) -> String {
    if name == "x86-64" {
        "x86_64".to_string()
    } else {
        name.to_string()
    }
}

fn build_versions(root: &Node, config: &Configuration) -> Vec<RepoVersion> {
    let filter = &config.repository_filter;
    let mut versions = Vec::new();

    // BTreeMap iteration gives the ascending name order the listing wants.
    for (name, node) in &root.children {
        let mut scenarios = Vec::new();
        for scenario in &filter.second_dir {
            let Some(scenario_node) = node.children.get(scenario) else {
                continue;
            };
            let mut arches: Vec<String> = scenario_node
                .children
                .iter()
                .filter(|(arch, n)| !n.is_file && filter.third_dir.iter().any(|a| a == *arch))
                .map(|(arch, _)| normalize_arch(arch))
                .collect();
            arches.sort();
            arches.dedup();
            if !arches.is_empty() {
                scenarios.push(Scenario {
                    name: scenario.clone(),
                    arches,
                });
            }
        }
        if scenarios.is_empty() {
            continue;
        }
        versions.push(RepoVersion {
            name: name.clone(),
            lts: name.contains("LTS"),
            scenarios,
        });
    }
    versions
}

fn build_selector(
    builder: &TreeBuilder,
    config: &Configuration,
    now: OffsetDateTime,
) -> Vec<SelectorEntry> {
    let root = &builder.root;
    let filter = &config.repository_filter;
    let mut entries = Vec::new();
    let mut seen = HashSet::new();

    let mut push = |entries: &mut Vec<SelectorEntry>,
                    seen: &mut HashSet<String>,
                    dir: &str,
                    name: &str,
                    node: &Node| {
        let path = format!("{dir}/{name}");
        if seen.insert(path) {
            entries.push(SelectorEntry {
                dir: dir.to_string(),
                name: name.to_string(),
                size: node.size,
                mod_time: node.mod_time,
            });
        }
    };

    // The globally newest file leads the list; it is the first probe every
    // scan performs.
    if let Some((path, _)) = builder.recent.values().max_by_key(|(_, t)| *t) {
        if let Some(node) = root.find(path) {
            let (dir, name) = path.rsplit_once('/').unwrap_or(("", path.as_str()));
            push(&mut entries, &mut seen, dir, name, node);
        }
    }

    for (version, version_node) in &root.children {
        let fresh = builder
            .recent
            .get(version)
            .is_some_and(|(_, t)| *t > now - FRESH_WINDOW);

        // The version's own newest file is always probed.
        if let Some((path, _)) = builder.recent.get(version) {
            if let Some(node) = root.find(path) {
                let (dir, name) = path.rsplit_once('/').unwrap_or(("", path.as_str()));
                push(&mut entries, &mut seen, dir, name, node);
            }
        }

        for scenario in &filter.second_dir {
            let Some(scenario_node) = version_node.children.get(scenario) else {
                continue;
            };
            for arch in &filter.third_dir {
                let Some(arch_node) = scenario_node.children.get(arch) else {
                    continue;
                };
                let dir = format!("{version}/{scenario}/{arch}");
                if fresh {
                    for (name, child) in &arch_node.children {
                        if child.is_file {
                            push(&mut entries, &mut seen, &dir, name, child);
                        }
                    }
                } else if let Some((name, child)) =
                    arch_node.children.iter().rev().find(|(_, c)| c.is_file)
                {
                    // Frozen versions get one sparse probe per directory.
                    push(&mut entries, &mut seen, &dir, name, child);
                }
            }
        }
    }

    for mapping in &filter.particular_file {
        for path in &mapping.source_path {
            if let Some(node) = root.find(path) {
                if node.is_file {
                    let (dir, name) = path.rsplit_once('/').unwrap_or(("", path.as_str()));
                    push(&mut entries, &mut seen, dir, name, node);
                }
            }
        }
    }

    entries
}

fn flatten_version(
    root: &Node,
    version: &str,
    particular: &[ParticularFileMapping],
) -> Vec<DisplayFileArray> {
    let mut arrays: Vec<DisplayFileArray> = Vec::new();

    if let Some(version_node) = root.children.get(version) {
        for (scenario, scenario_node) in &version_node.children {
            if scenario_node.is_file {
                continue;
            }
            for (arch, arch_node) in &scenario_node.children {
                if arch_node.is_file {
                    continue;
                }
                let mut files = Vec::new();
                for (name, child) in &arch_node.children {
                    if child.is_file {
                        files.push(DisplayFile {
                            name: name.clone(),
                            size: child.size,
                            sha256: child.sha256.clone(),
                            kind: FileKind::File,
                        });
                    } else {
                        files.push(DisplayFile {
                            name: name.clone(),
                            size: 0,
                            sha256: String::new(),
                            kind: FileKind::Dir,
                        });
                    }
                }
                if !files.is_empty() {
                    arrays.push(DisplayFileArray {
                        scenario: scenario.clone(),
                        arch: arch.clone(),
                        files,
                    });
                }
            }
        }
    }

    for mapping in particular.iter().filter(|m| m.version_name == version) {
        for (i, path) in mapping.source_path.iter().enumerate() {
            let name = path.rsplit('/').next().unwrap_or(path).to_string();
            let size = root.find(path).map(|n| n.size).unwrap_or(0);
            let sha256 = mapping.sha256_list.get(i).cloned().unwrap_or_default();
            let file = DisplayFile {
                name,
                size,
                sha256,
                kind: FileKind::File,
            };
            match arrays
                .iter_mut()
                .find(|a| a.scenario == mapping.scenario_name && a.arch == mapping.arch_name)
            {
                Some(array) => array.files.push(file),
                None => arrays.push(DisplayFileArray {
                    scenario: mapping.scenario_name.clone(),
                    arch: mapping.arch_name.clone(),
                    files: vec![file],
                }),
            }
        }
    }

    arrays
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use windrose_core::config::RepositoryFilter;

    fn config() -> Configuration {
        Configuration {
            repository_filter: RepositoryFilter {
                second_dir: vec!["ISO".into(), "edge_img".into()],
                third_dir: vec!["x86_64".into(), "aarch64".into(), "x86-64".into()],
                particular_file: Vec::new(),
            },
            ..Configuration::for_testing()
        }
    }

    fn recent() -> OffsetDateTime {
        OffsetDateTime::now_utc() - Duration::days(10)
    }

    fn frozen() -> OffsetDateTime {
        OffsetDateTime::now_utc() - Duration::days(400)
    }

    #[test]
    fn commit_builds_sorted_versions_with_lts_tag() {
        let mut b = TreeBuilder::new("/nonexistent");
        b.insert("openEuler-24.03/ISO/x86_64/a.iso", 1, Some(recent()));
        b.insert("openEuler-22.03-LTS/ISO/aarch64/b.iso", 2, Some(recent()));

        let tree = RepoTree::new();
        tree.commit(b, &config());

        let versions = tree.versions();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].name, "openEuler-22.03-LTS");
        assert!(versions[0].lts);
        assert_eq!(versions[1].name, "openEuler-24.03");
        assert!(!versions[1].lts);
    }

    #[test]
    fn version_without_known_arch_is_dropped() {
        let mut b = TreeBuilder::new("/nonexistent");
        b.insert("openEuler-24.03/ISO/sw64/a.iso", 1, Some(recent()));
        b.insert("openEuler-22.03-LTS/ISO/x86_64/b.iso", 2, Some(recent()));

        let tree = RepoTree::new();
        tree.commit(b, &config());
        let versions = tree.versions();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].name, "openEuler-22.03-LTS");
    }

    #[test]
    fn arch_alias_is_normalized_and_merged() {
        let mut b = TreeBuilder::new("/nonexistent");
        b.insert("openEuler-24.03/ISO/x86-64/a.iso", 1, Some(recent()));
        b.insert("openEuler-24.03/ISO/x86_64/b.iso", 1, Some(recent()));

        let tree = RepoTree::new();
        tree.commit(b, &config());
        let versions = tree.versions();
        assert_eq!(versions[0].scenarios[0].arches, vec!["x86_64"]);
    }

    #[test]
    fn fresh_version_enumerates_every_file() {
        let mut b = TreeBuilder::new("/nonexistent");
        b.insert("openEuler-24.03/ISO/x86_64/a.iso", 1, Some(recent()));
        b.insert("openEuler-24.03/ISO/x86_64/b.iso", 2, Some(recent()));
        b.insert("openEuler-24.03/ISO/x86_64/c.iso", 3, Some(recent()));

        let tree = RepoTree::new();
        tree.commit(b, &config());
        let selector = tree.selector();
        let names: HashSet<String> = selector.iter().map(|e| e.name.clone()).collect();
        assert_eq!(names, HashSet::from(["a.iso".into(), "b.iso".into(), "c.iso".into()]));
    }

    #[test]
    fn frozen_version_samples_last_file_per_dir() {
        let mut b = TreeBuilder::new("/nonexistent");
        let base = frozen();
        b.insert("openEuler-20.03/ISO/x86_64/a.iso", 1, Some(base));
        b.insert("openEuler-20.03/ISO/x86_64/z.iso", 2, Some(base - Duration::days(1)));
        b.insert("openEuler-20.03/ISO/aarch64/m.iso", 3, Some(base));

        let tree = RepoTree::new();
        tree.commit(b, &config());
        let selector = tree.selector();
        let names: HashSet<String> = selector.iter().map(|e| e.name.clone()).collect();
        // Most-recent file (a.iso), plus the dictionary-last file of each dir.
        assert_eq!(names, HashSet::from(["a.iso".into(), "z.iso".into(), "m.iso".into()]));
    }

    #[test]
    fn selector_leads_with_globally_newest_file() {
        let mut b = TreeBuilder::new("/nonexistent");
        let newest = recent();
        b.insert("openEuler-20.03/ISO/x86_64/old.iso", 1, Some(frozen()));
        b.insert("openEuler-24.03/ISO/x86_64/new.iso", 2, Some(newest));

        let tree = RepoTree::new();
        tree.commit(b, &config());
        let selector = tree.selector();
        assert_eq!(selector[0].name, "new.iso");
        assert_eq!(selector[0].dir, "openEuler-24.03/ISO/x86_64");
    }

    #[test]
    fn file_list_flattens_and_memoizes() {
        let mut b = TreeBuilder::new("/nonexistent");
        b.insert("openEuler-24.03/ISO/x86_64/a.iso", 7, Some(recent()));

        let tree = RepoTree::new();
        let cfg = config();
        tree.commit(b, &cfg);

        let first = tree.file_list("openEuler-24.03", &cfg);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].scenario, "ISO");
        assert_eq!(first[0].arch, "x86_64");
        assert_eq!(first[0].files[0].name, "a.iso");
        assert_eq!(first[0].files[0].size, 7);

        // Memoized: the same Arc comes back.
        let second = tree.file_list("openEuler-24.03", &cfg);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn file_list_merges_particular_files() {
        let mut cfg = config();
        cfg.repository_filter.particular_file = vec![ParticularFileMapping {
            version_name: "openEuler-24.03".into(),
            scenario_name: "embedded_img".into(),
            arch_name: "aarch64".into(),
            source_path: vec!["openEuler-24.03/misc/minimal.tar.gz".into()],
            sha256_list: vec!["cafe".into()],
        }];

        let mut b = TreeBuilder::new("/nonexistent");
        b.insert("openEuler-24.03/ISO/x86_64/a.iso", 7, Some(recent()));
        b.insert("openEuler-24.03/misc/minimal.tar.gz", 42, Some(recent()));

        let tree = RepoTree::new();
        tree.commit(b, &cfg);

        let listing = tree.file_list("openEuler-24.03", &cfg);
        let embedded = listing
            .iter()
            .find(|a| a.scenario == "embedded_img")
            .expect("particular array");
        assert_eq!(embedded.arch, "aarch64");
        assert_eq!(embedded.files[0].name, "minimal.tar.gz");
        assert_eq!(embedded.files[0].size, 42);
        assert_eq!(embedded.files[0].sha256, "cafe");
    }

    #[test]
    fn commit_invalidates_memoized_listing() {
        let cfg = config();
        let tree = RepoTree::new();

        let mut b = TreeBuilder::new("/nonexistent");
        b.insert("openEuler-24.03/ISO/x86_64/a.iso", 7, Some(recent()));
        tree.commit(b, &cfg);
        let first = tree.file_list("openEuler-24.03", &cfg);

        let mut b = TreeBuilder::new("/nonexistent");
        b.insert("openEuler-24.03/ISO/x86_64/b.iso", 8, Some(recent()));
        tree.commit(b, &cfg);
        let second = tree.file_list("openEuler-24.03", &cfg);

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second[0].files[0].name, "b.iso");
    }

    #[test]
    fn contains_file_tracks_live_tree() {
        let mut b = TreeBuilder::new("/nonexistent");
        b.insert("openEuler-24.03/ISO/x86_64/a.iso", 7, Some(recent()));
        let tree = RepoTree::new();
        tree.commit(b, &config());

        assert!(tree.contains_file("openEuler-24.03/ISO/x86_64/a.iso"));
        assert!(!tree.contains_file("openEuler-24.03/ISO/x86_64"));
        assert!(!tree.contains_file("openEuler-24.03/ISO/x86_64/missing.iso"));
    }

    #[test]
    fn builder_reads_sha256_sidecars() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("openEuler-24.03/ISO/x86_64")).unwrap();
        std::fs::write(
            dir.path().join("openEuler-24.03/ISO/x86_64/a.iso.sha256sum"),
            "deadbeef  a.iso\n",
        )
        .unwrap();

        let mut b = TreeBuilder::new(dir.path().to_str().unwrap());
        b.insert("openEuler-24.03/ISO/x86_64/a.iso", 7, Some(recent()));

        let tree = RepoTree::new();
        let cfg = config();
        tree.commit(b, &cfg);
        let listing = tree.file_list("openEuler-24.03", &cfg);
        assert_eq!(listing[0].files[0].sha256, "deadbeef");
    }
}
