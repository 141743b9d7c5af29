//! Client geo-IP resolution.
//!
//! The resolver is a seam: the production implementation reads MaxMind
//! databases, tests install a static map. Database provisioning and refresh
//! are external concerns; a missing or stale database degrades every lookup
//! to the invalid record, which selection handles by randomizing.

use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use windrose_core::GeoIpRecord;

pub trait GeoResolver: Send + Sync {
    fn resolve(&self, ip: IpAddr) -> GeoIpRecord;
}

/// MaxMind-backed resolver (City database, optional ASN database).
pub struct MaxMindResolver {
    city: maxminddb::Reader<Vec<u8>>,
    asn: Option<maxminddb::Reader<Vec<u8>>>,
}

impl MaxMindResolver {
    /// Open the databases under the configured path. `path` may be the City
    /// database file itself or a directory holding `GeoLite2-City.mmdb`
    /// (and optionally `GeoLite2-ASN.mmdb`).
    pub fn open(path: impl AsRef<Path>) -> Result<Self, maxminddb::MaxMindDBError> {
        let path = path.as_ref();
        let (city_path, asn_path) = if path.is_dir() {
            (
                path.join("GeoLite2-City.mmdb"),
                Some(path.join("GeoLite2-ASN.mmdb")),
            )
        } else {
            (path.to_path_buf(), None)
        };

        let city = maxminddb::Reader::open_readfile(&city_path)?;
        let asn = asn_path
            .filter(|p| p.exists())
            .and_then(|p| maxminddb::Reader::open_readfile(p).ok());
        Ok(Self { city, asn })
    }
}

impl GeoResolver for MaxMindResolver {
    fn resolve(&self, ip: IpAddr) -> GeoIpRecord {
        let Ok(city) = self.city.lookup::<maxminddb::geoip2::City>(ip) else {
            return GeoIpRecord::default();
        };

        let mut record = GeoIpRecord::default();
        if let Some(country) = city.country {
            record.country_code = country.iso_code.unwrap_or_default().to_string();
            record.country = country
                .names
                .and_then(|n| n.get("en").copied())
                .unwrap_or_default()
                .to_string();
        }
        if let Some(continent) = city.continent {
            record.continent_code = continent.code.unwrap_or_default().to_string();
        }
        if let Some(location) = city.location {
            record.latitude = location.latitude.unwrap_or(0.0);
            record.longitude = location.longitude.unwrap_or(0.0);
        }
        if let Some(asn_reader) = &self.asn {
            if let Ok(asn) = asn_reader.lookup::<maxminddb::geoip2::Asn>(ip) {
                record.as_num = asn.autonomous_system_number.unwrap_or(0);
            }
        }
        record
    }
}

/// A lookup table resolver for tests and fallback-only deployments.
#[derive(Default)]
pub struct StaticResolver {
    records: HashMap<IpAddr, GeoIpRecord>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, ip: IpAddr, record: GeoIpRecord) -> Self {
        self.records.insert(ip, record);
        self
    }
}

impl GeoResolver for StaticResolver {
    fn resolve(&self, ip: IpAddr) -> GeoIpRecord {
        self.records.get(&ip).cloned().unwrap_or_default()
    }
}

/// Extract the client IP from an `X-Forwarded-For` value: the first
/// parseable address wins.
pub fn extract_forwarded_ip(header: &str) -> Option<IpAddr> {
    header.split(',').find_map(|part| part.trim().parse().ok())
}
