//! Mirror and file records as they round-trip through the KV store.
//!
//! Mirror records live in KV hashes with string-valued fields, so the
//! conversion is explicit rather than serde-driven: `from_hash` tolerates
//! missing or malformed fields (a half-written record must never take the
//! redirector down) and `to_hash` writes every persisted field back.

use crate::ptime::{self, Precision};
use serde::Serialize;
use std::collections::HashMap;
use time::OffsetDateTime;

/// Metadata for one repository file, either from the authoritative source
/// (`FILE_<path>`) or as observed on a mirror (`FILEINFO_<id>_<path>`).
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FileInfo {
    pub path: String,
    pub size: i64,
    #[serde(with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<OffsetDateTime>,
    pub sha256: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sha1: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub md5: String,
}

impl FileInfo {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Decode from the KV hash fields, tolerating absent values.
    pub fn from_hash(path: &str, fields: &HashMap<String, String>) -> Self {
        let get = |k: &str| fields.get(k).cloned().unwrap_or_default();
        Self {
            path: path.to_string(),
            size: get("size").parse().unwrap_or(0),
            mod_time: fields.get("modTime").and_then(|v| ptime::parse_rfc1123(v)),
            sha256: get("sha256"),
            sha1: get("sha1"),
            md5: get("md5"),
        }
    }
}

/// One mirror server, as registered administratively and annotated by the
/// scanning subsystem.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Mirror {
    pub id: i32,
    pub name: String,
    pub http_url: String,
    pub enabled: bool,
    pub up: bool,
    /// Reason recorded by the monitor when the mirror was last marked down,
    /// surfaced by selection instead of a generic "Down".
    pub exclude_reason: String,

    pub continent_only: bool,
    pub country_only: bool,
    pub as_only: bool,

    /// Raw space-separated country codes, primary first.
    pub country_codes: String,
    pub excluded_country_codes: String,
    pub country: String,
    pub continent_code: String,
    pub as_num: u32,

    /// Administrative network-rate weight.
    pub score: i64,
    pub latitude: f64,
    pub longitude: f64,

    #[serde(with = "time::serde::rfc3339::option")]
    pub last_sync: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_successful_sync: Option<OffsetDateTime>,
    pub last_successful_sync_protocol: String,
    pub last_successful_sync_precision: Precision,
    /// Detected systematic clock offset, in milliseconds.
    pub tz_offset_ms: i64,

    /// Parsed from `country_codes` by [`Mirror::prepare`].
    #[serde(skip)]
    pub country_fields: Vec<String>,
    #[serde(skip)]
    pub excluded_country_fields: Vec<String>,

    // Transient, request-scoped fields. Never persisted.
    #[serde(skip)]
    pub distance_km: f64,
    #[serde(skip)]
    pub computed_score: [i64; 3],
    #[serde(skip)]
    pub file_info: Option<FileInfo>,
}

impl Mirror {
    pub fn is_https(&self) -> bool {
        self.http_url.starts_with("https://")
    }

    /// Derive the split country lists from their raw forms. Called after
    /// every load from the KV store.
    pub fn prepare(&mut self) {
        self.country_fields = split_codes(&self.country_codes);
        self.excluded_country_fields = split_codes(&self.excluded_country_codes);
    }

    /// Decode from the `MIRROR_<id>` hash.
    pub fn from_hash(id: i32, fields: &HashMap<String, String>) -> Self {
        let get = |k: &str| fields.get(k).cloned().unwrap_or_default();
        let get_bool = |k: &str| fields.get(k).map(|v| v == "true" || v == "1").unwrap_or(false);
        let get_unix = |k: &str| {
            fields
                .get(k)
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|&ts| ts > 0)
                .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
        };

        let mut m = Self {
            id,
            name: get("name"),
            http_url: get("httpURL"),
            enabled: get_bool("enabled"),
            up: get_bool("up"),
            exclude_reason: get("excludeReason"),
            continent_only: get_bool("continentOnly"),
            country_only: get_bool("countryOnly"),
            as_only: get_bool("asOnly"),
            country_codes: get("countryCodes"),
            excluded_country_codes: get("excludedCountryCodes"),
            country: get("country"),
            continent_code: get("continentCode"),
            as_num: get("asNum").parse().unwrap_or(0),
            score: get("score").parse().unwrap_or(0),
            latitude: get("latitude").parse().unwrap_or(0.0),
            longitude: get("longitude").parse().unwrap_or(0.0),
            last_sync: get_unix("lastSync"),
            last_successful_sync: get_unix("lastSuccessfulSync"),
            last_successful_sync_protocol: get("lastSuccessfulSyncProtocol"),
            last_successful_sync_precision: Precision::from_store(&get(
                "lastSuccessfulSyncPrecision",
            ))
            .or_second(),
            tz_offset_ms: get("tzoffset").parse().unwrap_or(0),
            ..Default::default()
        };
        m.prepare();
        m
    }

    /// Encode the persisted fields for the `MIRROR_<id>` hash.
    pub fn to_hash(&self) -> Vec<(String, String)> {
        let unix = |t: Option<OffsetDateTime>| {
            t.map(|t| t.unix_timestamp().to_string()).unwrap_or_default()
        };
        vec![
            ("name".into(), self.name.clone()),
            ("httpURL".into(), self.http_url.clone()),
            ("enabled".into(), self.enabled.to_string()),
            ("up".into(), self.up.to_string()),
            ("excludeReason".into(), self.exclude_reason.clone()),
            ("continentOnly".into(), self.continent_only.to_string()),
            ("countryOnly".into(), self.country_only.to_string()),
            ("asOnly".into(), self.as_only.to_string()),
            ("countryCodes".into(), self.country_codes.clone()),
            (
                "excludedCountryCodes".into(),
                self.excluded_country_codes.clone(),
            ),
            ("country".into(), self.country.clone()),
            ("continentCode".into(), self.continent_code.clone()),
            ("asNum".into(), self.as_num.to_string()),
            ("score".into(), self.score.to_string()),
            ("latitude".into(), self.latitude.to_string()),
            ("longitude".into(), self.longitude.to_string()),
            ("lastSync".into(), unix(self.last_sync)),
            ("lastSuccessfulSync".into(), unix(self.last_successful_sync)),
            (
                "lastSuccessfulSyncProtocol".into(),
                self.last_successful_sync_protocol.clone(),
            ),
            (
                "lastSuccessfulSyncPrecision".into(),
                self.last_successful_sync_precision.to_store(),
            ),
            ("tzoffset".into(), self.tz_offset_ms.to_string()),
        ]
    }

    /// Rewrite regional country codes to mainland China at the response
    /// boundary.
    pub fn normalize_country(&mut self) {
        if let Some((code, name)) = normalized_country(&self.country_codes) {
            self.country_codes = code.to_string();
            self.country = name.to_string();
        }
    }
}

fn split_codes(raw: &str) -> Vec<String> {
    raw.split([' ', ','])
        .filter(|s| !s.is_empty())
        .map(|s| s.to_uppercase())
        .collect()
}

/// The boundary rewrite applied to mirror country codes: Taiwan, Hong Kong
/// and Macao variants all emerge as CN / China.
pub fn normalized_country(code: &str) -> Option<(&'static str, &'static str)> {
    match code {
        "TW" | "TWN" | "TPE" | "HK" | "HKSAR" | "HKG" | "MO" | "MC" | "OMA" => {
            Some(("CN", "China"))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_hash() -> HashMap<String, String> {
        [
            ("name", "mirror.example"),
            ("httpURL", "https://mirror.example/repo"),
            ("enabled", "true"),
            ("up", "true"),
            ("countryCodes", "DE FR"),
            ("continentCode", "EU"),
            ("asNum", "3320"),
            ("score", "10"),
            ("latitude", "52.52"),
            ("longitude", "13.40"),
            ("lastSuccessfulSync", "1723114889"),
            ("lastSuccessfulSyncPrecision", "1000000000"),
            ("tzoffset", "0"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn hash_round_trip() {
        let m = Mirror::from_hash(4, &sample_hash());
        assert_eq!(m.id, 4);
        assert_eq!(m.name, "mirror.example");
        assert!(m.enabled && m.up);
        assert_eq!(m.country_fields, vec!["DE", "FR"]);
        assert_eq!(m.as_num, 3320);
        assert!(m.last_successful_sync.is_some());

        let encoded: HashMap<String, String> = m.to_hash().into_iter().collect();
        let again = Mirror::from_hash(4, &encoded);
        assert_eq!(again.name, m.name);
        assert_eq!(again.score, m.score);
        assert_eq!(again.last_successful_sync, m.last_successful_sync);
        assert_eq!(
            again.last_successful_sync_precision,
            m.last_successful_sync_precision
        );
    }

    #[test]
    fn malformed_fields_fall_back_to_defaults() {
        let mut fields = sample_hash();
        fields.insert("score".into(), "not-a-number".into());
        fields.insert("lastSuccessfulSync".into(), "".into());
        let m = Mirror::from_hash(1, &fields);
        assert_eq!(m.score, 0);
        assert!(m.last_successful_sync.is_none());
    }

    #[test]
    fn empty_hash_is_benign() {
        let m = Mirror::from_hash(9, &HashMap::new());
        assert_eq!(m.id, 9);
        assert!(!m.enabled);
        assert_eq!(m.last_successful_sync_precision, Precision::SECOND);
    }

    #[test]
    fn country_normalization_covers_all_aliases() {
        for code in ["TW", "TWN", "TPE", "HK", "HKSAR", "HKG", "MO", "MC", "OMA"] {
            assert_eq!(normalized_country(code), Some(("CN", "China")), "{code}");
        }
        assert_eq!(normalized_country("DE"), None);
        assert_eq!(normalized_country("CN"), None);
    }

    #[test]
    fn prepare_splits_and_uppercases() {
        let mut m = Mirror {
            country_codes: "cn,sg de".into(),
            ..Default::default()
        };
        m.prepare();
        assert_eq!(m.country_fields, vec!["CN", "SG", "DE"]);
    }
}
