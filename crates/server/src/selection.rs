//! The mirror selection engine.
//!
//! Given the candidate mirrors for a file and the client's geo record, the
//! engine filters out ineligible mirrors (recording why), then ranks the
//! survivors. Clients without a usable geo record get a uniformly shuffled
//! subset instead of a ranked one. The engine works on value copies and
//! never mutates cached records.

use rand::seq::SliceRandom;
use time::Duration;
use windrose_core::geo::is_primary_country;
use windrose_core::{Configuration, FileInfo, GeoIpRecord, Mirror, ptime};

/// How many mirrors a redirect response carries.
pub const REDIRECT_LIMIT: usize = 5;

/// Request facts the engine needs.
#[derive(Clone, Copy, Debug, Default)]
pub struct SelectionContext {
    /// Whether the client reached us over TLS; `None` when unknown.
    pub secure: Option<bool>,
    /// Mirror-list responses keep the full ranked list.
    pub mirrorlist: bool,
}

/// Selection algorithm seam; the dispatcher holds one behind the trait.
pub trait SelectionEngine: Send + Sync {
    /// Returns `(selected, excluded)`; excluded mirrors carry their
    /// `exclude_reason`.
    fn select(
        &self,
        ctx: &SelectionContext,
        file_info: &FileInfo,
        client: &GeoIpRecord,
        mirrors: Vec<Mirror>,
        config: &Configuration,
    ) -> (Vec<Mirror>, Vec<Mirror>);
}

/// The default ranking: primary-country match, then administrative network
/// rate, then proximity.
pub struct DefaultEngine;

impl SelectionEngine for DefaultEngine {
    fn select(
        &self,
        ctx: &SelectionContext,
        file_info: &FileInfo,
        client: &GeoIpRecord,
        mirrors: Vec<Mirror>,
        config: &Configuration,
    ) -> (Vec<Mirror>, Vec<Mirror>) {
        let mut selected: Vec<Mirror> = Vec::with_capacity(mirrors.len());
        let mut excluded: Vec<Mirror> = Vec::new();
        let mut closest = 0.0_f64;
        let mut farthest = 0.0_f64;

        for mut mirror in mirrors {
            if let Some(reason) = exclusion_reason(ctx, file_info, client, &mirror, config) {
                mirror.exclude_reason = reason;
                excluded.push(mirror);
                continue;
            }
            if selected.is_empty() || mirror.distance_km < closest {
                closest = mirror.distance_km;
            }
            if mirror.distance_km > farthest {
                farthest = mirror.distance_km;
            }
            selected.push(mirror);
        }

        if !client.is_valid() {
            selected.shuffle(&mut rand::thread_rng());
            if !ctx.mirrorlist {
                selected.truncate(REDIRECT_LIMIT);
            }
            return (selected, excluded);
        }

        if closest == 0.0 {
            closest = f64::MIN_POSITIVE;
        }

        let base_score = farthest as i64;
        for mirror in &mut selected {
            let country_score = i64::from(is_primary_country(client, &mirror.country_fields));
            let net_rate_score = mirror.score;
            let distance_score = base_score - mirror.distance_km as i64 + 1;
            mirror.computed_score = [country_score, net_rate_score, distance_score];
            tracing::debug!(
                mirror = %mirror.name,
                file = %file_info.path,
                score = ?mirror.computed_score,
                base_score,
                closest,
                "mirror scored"
            );
        }

        // Stable sort: ties keep their original (cache) order.
        selected.sort_by(|a, b| b.computed_score.cmp(&a.computed_score));

        (selected, excluded)
    }
}

/// First matching exclusion wins; the order is part of the contract.
fn exclusion_reason(
    ctx: &SelectionContext,
    file_info: &FileInfo,
    client: &GeoIpRecord,
    mirror: &Mirror,
    config: &Configuration,
) -> Option<String> {
    if !mirror.http_url.starts_with("http://") && !mirror.http_url.starts_with("https://") {
        return Some("Invalid URL".into());
    }
    if !mirror.enabled {
        return Some("Disabled".into());
    }
    if !mirror.up {
        // The monitor may have recorded something more specific.
        return Some(if mirror.exclude_reason.is_empty() {
            "Down".into()
        } else {
            mirror.exclude_reason.clone()
        });
    }
    if config.schema_strict_match {
        match ctx.secure {
            Some(true) if !mirror.is_https() => return Some("Not HTTPS".into()),
            Some(false) if mirror.is_https() => return Some("Not HTTP".into()),
            _ => {}
        }
    }
    if let Some(entry) = &mirror.file_info {
        if entry.size != file_info.size {
            return Some("File size mismatch".into());
        }
        if let (Some(remote), Some(local)) = (entry.mod_time, file_info.mod_time) {
            let mut remote = remote;
            if config.fix_timezone_offsets {
                remote += Duration::milliseconds(mirror.tz_offset_ms);
            }
            let precision = mirror.last_successful_sync_precision;
            if ptime::truncate(remote, precision) != ptime::truncate(local, precision) {
                return Some("Mod time mismatch".into());
            }
        }
    }
    if mirror.continent_only
        && (!client.is_valid() || client.continent_code != mirror.continent_code)
    {
        return Some("Continent only".into());
    }
    if mirror.country_only
        && (!client.is_valid() || !mirror.country_fields.contains(&client.country_code))
    {
        return Some("Country only".into());
    }
    if mirror.as_only && (!client.is_valid() || client.as_num != mirror.as_num) {
        return Some("AS only".into());
    }
    if client.is_valid()
        && mirror
            .excluded_country_fields
            .contains(&client.country_code)
    {
        return Some("User's country restriction".into());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use windrose_core::Precision;

    fn file() -> FileInfo {
        FileInfo {
            path: "openEuler-24.03/ISO/x86_64/a.iso".into(),
            size: 100,
            mod_time: Some(datetime!(2024-03-25 16:03:01 UTC)),
            ..Default::default()
        }
    }

    fn mirror(id: i32, cc: &str) -> Mirror {
        let mut m = Mirror {
            id,
            name: format!("mirror-{id}"),
            http_url: "https://m.example/repo".into(),
            enabled: true,
            up: true,
            country_codes: cc.to_string(),
            continent_code: "EU".into(),
            ..Default::default()
        };
        m.prepare();
        m
    }

    fn cn_client() -> GeoIpRecord {
        GeoIpRecord {
            country_code: "CN".into(),
            country: "China".into(),
            continent_code: "AS".into(),
            latitude: 39.9,
            longitude: 116.4,
            ..Default::default()
        }
    }

    fn tls_ctx() -> SelectionContext {
        SelectionContext {
            secure: Some(true),
            mirrorlist: false,
        }
    }

    fn select(
        ctx: &SelectionContext,
        client: &GeoIpRecord,
        mirrors: Vec<Mirror>,
        config: &Configuration,
    ) -> (Vec<Mirror>, Vec<Mirror>) {
        DefaultEngine.select(ctx, &file(), client, mirrors, config)
    }

    #[test]
    fn filter_reasons_in_contract_order() {
        let config = Configuration::for_testing();
        let client = cn_client();

        let mut invalid_url = mirror(1, "CN");
        invalid_url.http_url = "ftp://m.example".into();
        // Disabled AND down: the disabled reason must win.
        let mut disabled = mirror(2, "CN");
        disabled.enabled = false;
        disabled.up = false;
        let mut down = mirror(3, "CN");
        down.up = false;

        let (selected, excluded) =
            select(&tls_ctx(), &client, vec![invalid_url, disabled, down], &config);
        assert!(selected.is_empty());
        let reasons: Vec<&str> = excluded.iter().map(|m| m.exclude_reason.as_str()).collect();
        assert_eq!(reasons, vec!["Invalid URL", "Disabled", "Down"]);
    }

    #[test]
    fn recorded_down_reason_is_preserved() {
        let config = Configuration::for_testing();
        let mut down = mirror(1, "CN");
        down.up = false;
        down.exclude_reason = "File not found a.iso (error 404)".into();

        let (_, excluded) = select(&tls_ctx(), &cn_client(), vec![down], &config);
        assert_eq!(excluded[0].exclude_reason, "File not found a.iso (error 404)");
    }

    #[test]
    fn schema_strict_match_excludes_cross_scheme() {
        let config = Configuration::for_testing();
        assert!(config.schema_strict_match);

        let mut plain = mirror(1, "CN");
        plain.http_url = "http://m.example/repo".into();
        let (selected, excluded) = select(&tls_ctx(), &cn_client(), vec![plain.clone()], &config);
        assert!(selected.is_empty());
        assert_eq!(excluded[0].exclude_reason, "Not HTTPS");

        let https = mirror(2, "CN");
        let ctx = SelectionContext {
            secure: Some(false),
            mirrorlist: false,
        };
        let (selected, excluded) = select(&ctx, &cn_client(), vec![https], &config);
        assert!(selected.is_empty());
        assert_eq!(excluded[0].exclude_reason, "Not HTTP");

        let lax = Configuration {
            schema_strict_match: false,
            ..Configuration::for_testing()
        };
        let (selected, _) = select(&tls_ctx(), &cn_client(), vec![plain], &lax);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn size_and_mod_time_mismatches_exclude() {
        let config = Configuration::for_testing();

        let mut wrong_size = mirror(1, "CN");
        wrong_size.file_info = Some(FileInfo {
            size: 99,
            ..file()
        });
        let (_, excluded) = select(&tls_ctx(), &cn_client(), vec![wrong_size], &config);
        assert_eq!(excluded[0].exclude_reason, "File size mismatch");

        let mut skewed = mirror(2, "CN");
        skewed.file_info = Some(FileInfo {
            mod_time: Some(datetime!(2024-03-25 16:03:03 UTC)),
            ..file()
        });
        let (_, excluded) = select(&tls_ctx(), &cn_client(), vec![skewed], &config);
        assert_eq!(excluded[0].exclude_reason, "Mod time mismatch");
    }

    #[test]
    fn mod_time_compared_at_sync_precision() {
        let config = Configuration::for_testing();
        // Two-second precision: 16:03:01 and 16:03:00 truncate equal.
        let mut coarse = mirror(1, "CN");
        coarse.last_successful_sync_precision = Precision(2_000_000_000);
        coarse.file_info = Some(FileInfo {
            mod_time: Some(datetime!(2024-03-25 16:03:00 UTC)),
            ..file()
        });
        let (selected, _) = select(&tls_ctx(), &cn_client(), vec![coarse], &config);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn tz_offset_applied_when_enabled() {
        // Mirror clock one hour behind; offset corrects it.
        let mut shifted = mirror(1, "CN");
        shifted.tz_offset_ms = 3_600_000;
        shifted.file_info = Some(FileInfo {
            mod_time: Some(datetime!(2024-03-25 15:03:01 UTC)),
            ..file()
        });

        let plain = Configuration::for_testing();
        let (_, excluded) = select(&tls_ctx(), &cn_client(), vec![shifted.clone()], &plain);
        assert_eq!(excluded[0].exclude_reason, "Mod time mismatch");

        let fixing = Configuration {
            fix_timezone_offsets: true,
            ..Configuration::for_testing()
        };
        let (selected, _) = select(&tls_ctx(), &cn_client(), vec![shifted], &fixing);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn geo_restrictions_exclude() {
        let config = Configuration::for_testing();
        let client = cn_client();

        let mut continent_only = mirror(1, "DE");
        continent_only.continent_only = true; // EU mirror, AS client
        let mut country_only = mirror(2, "DE");
        country_only.country_only = true;
        let mut as_only = mirror(3, "CN");
        as_only.as_only = true;
        as_only.as_num = 4134;
        let mut banned = mirror(4, "US");
        banned.excluded_country_codes = "CN".into();
        banned.prepare();

        let (selected, excluded) = select(
            &tls_ctx(),
            &client,
            vec![continent_only, country_only, as_only, banned],
            &config,
        );
        assert!(selected.is_empty());
        let reasons: Vec<&str> = excluded.iter().map(|m| m.exclude_reason.as_str()).collect();
        assert_eq!(
            reasons,
            vec![
                "Continent only",
                "Country only",
                "AS only",
                "User's country restriction"
            ]
        );
    }

    #[test]
    fn geo_only_mirrors_need_a_valid_client() {
        let config = Configuration::for_testing();
        let mut country_only = mirror(1, "CN");
        country_only.country_only = true;

        let (_, excluded) = select(&tls_ctx(), &GeoIpRecord::default(), vec![country_only], &config);
        assert_eq!(excluded[0].exclude_reason, "Country only");
    }

    #[test]
    fn primary_country_outranks_distance_and_rate() {
        let config = Configuration::for_testing();
        let client = cn_client();

        // Berlin mirror: much higher rate, but wrong country.
        let mut de = mirror(1, "DE");
        de.score = 100;
        de.distance_km = 100.0;
        // Beijing mirror: primary country match.
        let mut cn = mirror(2, "CN");
        cn.distance_km = 7000.0;

        let (selected, _) = select(&tls_ctx(), &client, vec![de, cn], &config);
        assert_eq!(selected[0].id, 2);
        assert_eq!(selected[0].computed_score[0], 1);
    }

    #[test]
    fn rate_breaks_country_ties_then_distance() {
        let config = Configuration::for_testing();
        let client = cn_client();

        let mut slow_near = mirror(1, "CN");
        slow_near.score = 1;
        slow_near.distance_km = 10.0;
        let mut fast_far = mirror(2, "CN");
        fast_far.score = 5;
        fast_far.distance_km = 2000.0;
        let mut slow_far = mirror(3, "CN");
        slow_far.score = 1;
        slow_far.distance_km = 2000.0;

        let (selected, _) = select(&tls_ctx(), &client, vec![slow_near, fast_far, slow_far], &config);
        let order: Vec<i32> = selected.iter().map(|m| m.id).collect();
        assert_eq!(order, vec![2, 1, 3]);
    }

    #[test]
    fn equal_scores_keep_original_order() {
        let config = Configuration::for_testing();
        let client = cn_client();

        let mirrors: Vec<Mirror> = (1..=4)
            .map(|id| {
                let mut m = mirror(id, "CN");
                m.distance_km = 500.0;
                m
            })
            .collect();
        let (selected, _) = select(&tls_ctx(), &client, mirrors, &config);
        let order: Vec<i32> = selected.iter().map(|m| m.id).collect();
        assert_eq!(order, vec![1, 2, 3, 4]);
    }

    #[test]
    fn invalid_client_gets_at_most_five_random_mirrors() {
        let config = Configuration::for_testing();
        let mirrors: Vec<Mirror> = (1..=8).map(|id| mirror(id, "DE")).collect();

        let (selected, excluded) =
            select(&tls_ctx(), &GeoIpRecord::default(), mirrors.clone(), &config);
        assert_eq!(selected.len(), REDIRECT_LIMIT);
        assert!(excluded.is_empty());

        // The mirror list variant keeps the full set.
        let ctx = SelectionContext {
            secure: Some(true),
            mirrorlist: true,
        };
        let (selected, _) = DefaultEngine.select(&ctx, &file(), &GeoIpRecord::default(), mirrors, &config);
        assert_eq!(selected.len(), 8);
    }

    #[test]
    fn empty_candidates_yield_empty_lists() {
        let config = Configuration::for_testing();
        let (selected, excluded) = select(&tls_ctx(), &cn_client(), Vec::new(), &config);
        assert!(selected.is_empty());
        assert!(excluded.is_empty());
    }
}
