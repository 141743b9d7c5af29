//! Configuration types and the process-global configuration handle.
//!
//! The YAML file uses PascalCase keys. The loaded configuration is held
//! behind a process-wide `RwLock` so a reload can swap it atomically, and
//! interested subsystems subscribe to reload notifications through bounded
//! channels that drop events rather than block the publisher.

use crate::error::{ConfigError, Result};
use figment::Figment;
use figment::providers::{Format, Yaml};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// Hash types exposed through the `?md5|sha1|sha256` checksum endpoint.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "UPPERCASE")]
pub struct Hashing {
    pub sha1: bool,
    pub sha256: bool,
    pub md5: bool,
}

impl Default for Hashing {
    fn default() -> Self {
        Self {
            sha1: false,
            sha256: true,
            md5: false,
        }
    }
}

/// An administratively configured mirror of last resort.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Fallback {
    #[serde(rename = "URL")]
    pub url: String,
    pub country_code: String,
    pub continent_code: String,
    pub name: String,
    pub network_bandwidth: i64,
}

/// One particular-file override: a file outside the scenario/arch layout
/// that is nonetheless published for a version.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct ParticularFileMapping {
    pub version_name: String,
    pub scenario_name: String,
    pub arch_name: String,
    pub source_path: Vec<String>,
    #[serde(rename = "SHA256List")]
    pub sha256_list: Vec<String>,
}

/// Directory-level repository filter: which `<scenario>/<arch>` pairs are
/// indexed, plus particular-file overrides.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RepositoryFilter {
    pub second_dir: Vec<String>,
    pub third_dir: Vec<String>,
    #[serde(rename = "ParticularFileMapping")]
    pub particular_file: Vec<ParticularFileMapping>,
}

/// Complete application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Configuration {
    /// Absolute path of the local repository root.
    pub repository: String,
    /// Path of the textual file-listing manifest for the repository.
    pub repository_file_list_text: String,
    pub templates: String,
    /// One of "auto", "json", "redirect".
    pub output_mode: String,
    pub listen_address: String,
    pub gzip: bool,

    pub redis_address: String,
    pub redis_password: String,
    #[serde(rename = "RedisDB")]
    pub redis_db: i64,
    pub redis_sentinels: Vec<Sentinel>,

    pub geoip_database_path: String,

    /// Size of the mirror sync worker pool.
    pub concurrent_sync: usize,
    /// Minutes between mirror file scans.
    pub scan_interval: u64,
    /// Minutes between mirror health checks.
    pub check_interval: u64,
    /// Minutes between source repository rescans; 0 disables the ticker.
    pub repository_scan_interval: u64,

    pub fix_timezone_offsets: bool,
    pub hashes: Hashing,
    pub disallow_redirects: bool,
    pub weight_distribution_range: f32,
    pub disable_on_missing_file: bool,
    pub fallbacks: Vec<Fallback>,
    pub schema_strict_match: bool,

    /// Prefix selecting repository-version directories in the manifest.
    pub repo_version_prefix: String,
    pub repository_filter: RepositoryFilter,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Sentinel {
    pub host: String,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            repository: String::new(),
            repository_file_list_text: String::new(),
            templates: String::new(),
            output_mode: "auto".into(),
            listen_address: ":8080".into(),
            gzip: false,
            redis_address: "127.0.0.1:6379".into(),
            redis_password: String::new(),
            redis_db: 0,
            redis_sentinels: Vec::new(),
            geoip_database_path: "/usr/share/GeoIP/GeoLite2-City.mmdb".into(),
            concurrent_sync: 50,
            scan_interval: 60,
            check_interval: 30,
            repository_scan_interval: 50,
            fix_timezone_offsets: false,
            hashes: Hashing::default(),
            disallow_redirects: false,
            weight_distribution_range: 1.5,
            disable_on_missing_file: false,
            fallbacks: Vec::new(),
            schema_strict_match: true,
            repo_version_prefix: "openEuler-".into(),
            repository_filter: RepositoryFilter::default(),
        }
    }
}

impl Configuration {
    /// Validate invariants that would otherwise surface as runtime faults.
    pub fn validate(&self) -> Result<()> {
        if self.weight_distribution_range <= 0.0 {
            return Err(ConfigError::Invalid(
                "WeightDistributionRange must be > 0".into(),
            ));
        }
        if !matches!(self.output_mode.as_str(), "auto" | "json" | "redirect") {
            return Err(ConfigError::Invalid(format!(
                "OutputMode must be 'auto', 'json' or 'redirect', got '{}'",
                self.output_mode
            )));
        }
        if self.repository.is_empty() {
            return Err(ConfigError::Invalid(
                "Repository path is not configured".into(),
            ));
        }
        if self.concurrent_sync == 0 {
            return Err(ConfigError::Invalid("ConcurrentSync must be >= 1".into()));
        }
        Ok(())
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval * 60)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval * 60)
    }

    pub fn repository_scan_interval(&self) -> Option<Duration> {
        (self.repository_scan_interval > 0)
            .then(|| Duration::from_secs(self.repository_scan_interval * 60))
    }

    /// Create a test configuration with sensible defaults.
    ///
    /// **For testing only.**
    pub fn for_testing() -> Self {
        Self {
            repository: "./data/repo".into(),
            repository_file_list_text: "./data/repo.txt".into(),
            repository_filter: RepositoryFilter {
                second_dir: vec!["ISO".into(), "edge_img".into(), "virtual_machine_img".into()],
                third_dir: vec!["x86_64".into(), "aarch64".into(), "riscv64".into()],
                particular_file: Vec::new(),
            },
            ..Default::default()
        }
    }
}

/// Load the configuration from a YAML file.
pub fn load(path: impl AsRef<Path>) -> Result<Configuration> {
    let config: Configuration = Figment::new().merge(Yaml::file(path.as_ref())).extract()?;
    config.validate()?;
    Ok(config)
}

static GLOBAL: OnceLock<RwLock<Arc<Configuration>>> = OnceLock::new();
static SUBSCRIBERS: Mutex<Vec<mpsc::Sender<()>>> = Mutex::new(Vec::new());

/// Install (or replace) the process-global configuration and notify
/// subscribers.
pub fn set_global(config: Configuration) {
    let config = Arc::new(config);
    match GLOBAL.get() {
        Some(lock) => {
            *lock.write().expect("config lock poisoned") = config;
        }
        None => {
            let _ = GLOBAL.set(RwLock::new(config));
        }
    }
    notify_subscribers();
}

/// The current global configuration.
///
/// # Panics
///
/// Panics if [`set_global`] has not been called.
pub fn global() -> Arc<Configuration> {
    GLOBAL
        .get()
        .expect("configuration not loaded")
        .read()
        .expect("config lock poisoned")
        .clone()
}

/// Subscribe to reload notifications. The channel is bounded and lossy: a
/// subscriber that is not draining misses events instead of stalling the
/// reloader.
pub fn subscribe() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(1);
    SUBSCRIBERS.lock().expect("subscriber lock poisoned").push(tx);
    rx
}

fn notify_subscribers() {
    let mut subs = SUBSCRIBERS.lock().expect("subscriber lock poisoned");
    subs.retain(|tx| match tx.try_send(()) {
        Ok(()) | Err(mpsc::error::TrySendError::Full(())) => true,
        Err(mpsc::error::TrySendError::Closed(())) => false,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_reference() {
        let c = Configuration::default();
        assert_eq!(c.listen_address, ":8080");
        assert_eq!(c.concurrent_sync, 50);
        assert_eq!(c.scan_interval, 60);
        assert_eq!(c.check_interval, 30);
        assert_eq!(c.repository_scan_interval, 50);
        assert!(c.schema_strict_match);
        assert!(c.hashes.sha256);
        assert!(!c.hashes.sha1);
        assert_eq!(c.output_mode, "auto");
        assert_eq!(c.repo_version_prefix, "openEuler-");
    }

    #[test]
    fn validate_rejects_bad_output_mode() {
        let c = Configuration {
            output_mode: "xml".into(),
            ..Configuration::for_testing()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn validate_rejects_nonpositive_weight_range() {
        let c = Configuration {
            weight_distribution_range: 0.0,
            ..Configuration::for_testing()
        };
        assert!(c.validate().is_err());
    }

    #[test]
    fn repository_scan_interval_zero_disables_ticker() {
        let c = Configuration {
            repository_scan_interval: 0,
            ..Configuration::for_testing()
        };
        assert!(c.repository_scan_interval().is_none());
    }

    #[test]
    fn load_yaml_file() {
        let mut f = tempfile::NamedTempFile::with_suffix(".yaml").unwrap();
        writeln!(
            f,
            concat!(
                "Repository: /srv/repo\n",
                "RepositoryFileListText: /srv/repo.txt\n",
                "ScanInterval: 15\n",
                "Fallbacks:\n",
                "- URL: https://fallback.example/repo/\n",
                "  CountryCode: cn\n",
                "  ContinentCode: as\n",
                "RepositoryFilter:\n",
                "  SecondDir: [ISO]\n",
                "  ThirdDir: [x86_64, aarch64]\n",
            )
        )
        .unwrap();

        let c = load(f.path()).unwrap();
        assert_eq!(c.repository, "/srv/repo");
        assert_eq!(c.scan_interval, 15);
        assert_eq!(c.fallbacks.len(), 1);
        assert_eq!(c.fallbacks[0].country_code, "cn");
        assert_eq!(c.repository_filter.third_dir, vec!["x86_64", "aarch64"]);
        // Untouched keys keep their defaults.
        assert_eq!(c.check_interval, 30);
    }

    #[test]
    fn subscribers_receive_reload_without_blocking() {
        let mut rx = subscribe();
        set_global(Configuration::for_testing());
        // A second reload while the first event is still queued must not block.
        set_global(Configuration::for_testing());
        assert!(rx.try_recv().is_ok());
        assert!(global().schema_strict_match);
    }
}
