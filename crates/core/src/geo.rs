//! Geographic primitives: client geo records and distance math.

use serde::Serialize;

/// Geo-IP information for a requesting client.
///
/// An all-empty record (the default) means the lookup failed or the database
/// is missing; such clients get a randomized mirror selection instead of a
/// distance-ranked one.
#[derive(Clone, Debug, Default, Serialize)]
pub struct GeoIpRecord {
    pub country_code: String,
    pub country: String,
    pub continent_code: String,
    pub as_num: u32,
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoIpRecord {
    /// A record is usable when the lookup produced at least a country.
    pub fn is_valid(&self) -> bool {
        !self.country_code.is_empty()
    }
}

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two coordinates, in kilometres.
pub fn great_circle_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (lat1, lon1) = (lat1.to_radians(), lon1.to_radians());
    let (lat2, lon2) = (lat2.to_radians(), lon2.to_radians());

    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;

    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

/// True when the client's country is the mirror's primary country, i.e. the
/// first entry of its country list.
pub fn is_primary_country(client: &GeoIpRecord, country_fields: &[String]) -> bool {
    if !client.is_valid() {
        return false;
    }
    country_fields
        .first()
        .is_some_and(|c| c == &client.country_code)
}

/// Rank used to order fallback mirrors for a client: same country beats same
/// continent beats everything else. Lower is better.
pub fn fallback_rank(client: &GeoIpRecord, country_code: &str, continent_code: &str) -> u8 {
    if !client.is_valid() {
        return 2;
    }
    if client.country_code == country_code {
        0
    } else if client.continent_code == continent_code {
        1
    } else {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(cc: &str, continent: &str) -> GeoIpRecord {
        GeoIpRecord {
            country_code: cc.to_string(),
            continent_code: continent.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn distance_beijing_berlin() {
        // Beijing (39.9, 116.4) to Berlin (52.5, 13.4) is roughly 7,360 km.
        let d = great_circle_km(39.9, 116.4, 52.5, 13.4);
        assert!((d - 7360.0).abs() < 50.0, "got {d}");
    }

    #[test]
    fn distance_to_self_is_zero() {
        assert_eq!(great_circle_km(48.85, 2.35, 48.85, 2.35), 0.0);
    }

    #[test]
    fn primary_country_is_first_entry_only() {
        let c = client("CN", "AS");
        assert!(is_primary_country(&c, &["CN".into(), "SG".into()]));
        assert!(!is_primary_country(&c, &["SG".into(), "CN".into()]));
        assert!(!is_primary_country(&c, &[]));
    }

    #[test]
    fn invalid_client_is_never_primary() {
        assert!(!is_primary_country(&GeoIpRecord::default(), &["CN".into()]));
    }

    #[test]
    fn fallback_rank_prefers_country_then_continent() {
        let c = client("CN", "AS");
        assert_eq!(fallback_rank(&c, "CN", "AS"), 0);
        assert_eq!(fallback_rank(&c, "SG", "AS"), 1);
        assert_eq!(fallback_rank(&c, "DE", "EU"), 2);
        assert_eq!(fallback_rank(&GeoIpRecord::default(), "CN", "AS"), 2);
    }
}
