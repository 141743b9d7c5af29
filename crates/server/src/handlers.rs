//! The request dispatcher and its renderers.
//!
//! Every repository path lands in [`dispatch`], which sanitizes it,
//! resolves the client's geo record, runs the selection engine and picks a
//! renderer from the query string and configuration: a 302 redirect, a JSON
//! document, the HTML mirror list, a checksum line, or download counters.

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::selection::{REDIRECT_LIMIT, SelectionContext};
use crate::state::AppState;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode, Uri, header};
use axum::response::{Html, IntoResponse, Json, Response};
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use windrose_core::{Configuration, FileInfo, GeoIpRecord, Mirror, config};
use windrose_core::geo::fallback_rank;
use windrose_index::tree::{DisplayFileArray, RepoVersion};

/// The response document of the JSON renderer (and the data behind the
/// HTML one).
#[derive(Serialize)]
pub struct Results {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_info: Option<FileInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_tree: Option<Vec<DisplayFileArray>>,
    pub mirror_list: Vec<Mirror>,
    pub excluded_list: Vec<Mirror>,
    pub client_info: GeoIpRecord,
    pub ip: String,
    pub fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_versions: Option<Vec<RepoVersion>>,
}

impl Results {
    fn empty() -> Self {
        Self {
            file_info: None,
            file_tree: None,
            mirror_list: Vec::new(),
            excluded_list: Vec::new(),
            client_info: GeoIpRecord::default(),
            ip: String::new(),
            fallback: false,
            repo_versions: None,
        }
    }
}

/// `GET /healthz`.
pub async fn health() -> &'static str {
    "ok"
}

/// `GET /`: the published repository versions.
pub async fn repo_versions(State(state): State<AppState>) -> Json<Results> {
    let versions = state.tree.versions().as_ref().clone();
    Json(Results {
        repo_versions: Some(versions),
        ..Results::empty()
    })
}

/// Fallback route: everything under a repository path.
pub async fn dispatch(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let query = parse_query(uri.query().unwrap_or(""));
    let config = config::global();

    let result = if query.contains_key("mirrorlist") {
        mirror_handler(&state, &config, &uri, &headers, &query, addr, true).await
    } else if query.contains_key("stats") {
        file_stats_handler(&state, &uri, &query).await
    } else if ["md5", "sha1", "sha256"].iter().any(|h| query.contains_key(*h)) {
        checksum_handler(&state, &config, &uri, &query).await
    } else {
        mirror_handler(&state, &config, &uri, &headers, &query, addr, false).await
    };

    match result {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

/// Minimal query parser; repository queries carry flags and simple values,
/// never encoded payloads.
fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

/// Resolve a request path to a repository-relative path, rejecting
/// traversal outside the root.
fn sanitize_path(url_path: &str) -> ApiResult<String> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in url_path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(ApiError::Forbidden);
                }
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return Err(ApiError::NotFound);
    }
    Ok(parts.join("/"))
}

/// The sanitized path must exist in the local repository.
async fn require_local_file(config: &Configuration, rel: &str) -> ApiResult<()> {
    let local = Path::new(&config.repository).join(rel);
    match tokio::fs::metadata(&local).await {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(ApiError::NotFound),
    }
}

fn client_ip(
    headers: &HeaderMap,
    addr: SocketAddr,
    query: &HashMap<String, String>,
    mirrorlist: bool,
) -> IpAddr {
    // The mirror list page lets operators preview another client's view.
    if mirrorlist {
        if let Some(ip) = query.get("fromip").and_then(|v| v.parse().ok()) {
            return ip;
        }
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(crate::geo::extract_forwarded_ip)
        .unwrap_or(addr.ip())
}

fn secure_option(headers: &HeaderMap) -> Option<bool> {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|proto| proto.eq_ignore_ascii_case("https"))
}

#[allow(clippy::too_many_arguments)]
async fn mirror_handler(
    state: &AppState,
    config: &Configuration,
    uri: &Uri,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    addr: SocketAddr,
    mirrorlist: bool,
) -> ApiResult<Response> {
    let rel = sanitize_path(uri.path())?;
    require_local_file(config, &rel).await?;

    let ip = client_ip(headers, addr, query, mirrorlist);
    let client = state.geo.resolve(ip);
    tracing::info!(client = %ip, path = %rel, "dispatching download");

    let ctx = SelectionContext {
        secure: secure_option(headers),
        mirrorlist,
    };

    let mut fallback_used = false;
    let (mut selected, excluded) = match candidate_selection(state, config, &ctx, &client).await {
        Ok((selected, excluded)) if !selected.is_empty() => (selected, excluded),
        other => {
            if let Err(err) = &other {
                tracing::error!(error = %err, path = %rel, "mirror selection failed");
            }
            metrics::SELECTION_EMPTY_TOTAL.inc();
            let excluded = other.map(|(_, excluded)| excluded).unwrap_or_default();
            let fallbacks = fallback_mirrors(config, &client);
            if fallbacks.is_empty() {
                return Err(ApiError::ServiceUnavailable);
            }
            metrics::FALLBACKS_TOTAL.inc();
            fallback_used = true;
            (fallbacks, excluded)
        }
    };

    for mirror in &mut selected {
        mirror.normalize_country();
    }

    let file_info = state
        .cache
        .get_file_info(&rel)
        .await
        .unwrap_or_else(|_| FileInfo::new(rel.clone()));

    // Accounting happens before the response body is built so the chosen
    // mirror is still at the head of the full list.
    if !mirrorlist {
        if let Some(first) = selected.first() {
            state.stats.count_download(first.id, &rel, file_info.size);
        }
    }

    let limit = if mirrorlist {
        selected.len()
    } else {
        selected.len().min(REDIRECT_LIMIT)
    };
    selected.truncate(limit);

    let version = rel.split('/').next().unwrap_or_default();
    let results = Results {
        file_info: Some(file_info),
        file_tree: mirrorlist
            .then(|| state.tree.file_list(version, config).as_ref().clone()),
        mirror_list: selected,
        excluded_list: excluded,
        client_info: client,
        ip: ip.to_string(),
        fallback: fallback_used,
        repo_versions: None,
    };

    if mirrorlist {
        metrics::REQUESTS_TOTAL.with_label_values(&["mirrorlist"]).inc();
        return Ok(render_mirrorlist(&results).into_response());
    }

    match choose_renderer(config, headers) {
        Renderer::Json => {
            metrics::REQUESTS_TOTAL.with_label_values(&["json"]).inc();
            Ok((no_cache_headers(), Json(results)).into_response())
        }
        Renderer::Redirect => {
            metrics::REQUESTS_TOTAL.with_label_values(&["redirect"]).inc();
            metrics::REDIRECTS_TOTAL.inc();
            let target = format!(
                "{}/{}",
                results.mirror_list[0].http_url.trim_end_matches('/'),
                rel
            );
            Ok((
                StatusCode::FOUND,
                no_cache_headers(),
                [(header::LOCATION, target)],
            )
                .into_response())
        }
    }
}

/// Run the selection engine over the mirrors serving the probe file.
async fn candidate_selection(
    state: &AppState,
    config: &Configuration,
    ctx: &SelectionContext,
    client: &GeoIpRecord,
) -> ApiResult<(Vec<Mirror>, Vec<Mirror>)> {
    let selector = state.tree.selector();
    let Some(probe) = selector.first() else {
        tracing::warn!("selector list is empty, repository not scanned yet");
        return Ok((Vec::new(), Vec::new()));
    };
    let probe_path = probe.path();

    let candidates = state.cache.get_mirrors(&probe_path, client).await?;
    if candidates.is_empty() {
        tracing::warn!(probe = %probe_path, "no mirrors have the requested file");
        return Ok((Vec::new(), Vec::new()));
    }

    let probe_info = state
        .cache
        .get_file_info(&probe_path)
        .await
        .unwrap_or_else(|_| FileInfo {
            path: probe_path.clone(),
            size: probe.size,
            mod_time: probe.mod_time,
            ..Default::default()
        });

    Ok(state
        .engine
        .select(ctx, &probe_info, client, candidates, config))
}

/// Synthesize mirrors from the configured fallbacks, best ranked first.
fn fallback_mirrors(config: &Configuration, client: &GeoIpRecord) -> Vec<Mirror> {
    let mut mirrors: Vec<Mirror> = config
        .fallbacks
        .iter()
        .enumerate()
        .map(|(i, fallback)| {
            let country_code = fallback.country_code.to_uppercase();
            let country = if country_code == "CN" || country_code == "CHINA" {
                "China".to_string()
            } else {
                String::new()
            };
            let mut mirror = Mirror {
                id: -(i as i32),
                name: format!("fallback{i}"),
                http_url: fallback.url.clone(),
                enabled: true,
                up: true,
                country_codes: country_code,
                country,
                continent_code: fallback.continent_code.to_uppercase(),
                score: fallback.network_bandwidth,
                ..Default::default()
            };
            mirror.prepare();
            mirror
        })
        .collect();

    mirrors.sort_by_key(|m| {
        fallback_rank(
            client,
            m.country_fields.first().map(String::as_str).unwrap_or(""),
            &m.continent_code,
        )
    });
    mirrors
}

enum Renderer {
    Json,
    Redirect,
}

fn choose_renderer(config: &Configuration, headers: &HeaderMap) -> Renderer {
    let accepts_json = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("application/json"));

    match config.output_mode.as_str() {
        "json" => Renderer::Json,
        "redirect" => Renderer::Redirect,
        _ => {
            if accepts_json || config.disallow_redirects {
                Renderer::Json
            } else {
                Renderer::Redirect
            }
        }
    }
}

fn no_cache_headers() -> [(header::HeaderName, &'static str); 1] {
    [(header::CACHE_CONTROL, "private, no-cache")]
}

/// The human-readable mirror list. Templating proper is delegated to the
/// deployment; this renders the data as a plain table.
fn render_mirrorlist(results: &Results) -> Html<String> {
    let mut body = String::from(
        "<!DOCTYPE html><html><head><title>Mirror list</title></head><body>",
    );
    if let Some(info) = &results.file_info {
        body.push_str(&format!("<h1>{}</h1>", info.path));
    }

    body.push_str("<h2>Selected mirrors</h2><table>");
    body.push_str("<tr><th>Name</th><th>URL</th><th>Country</th><th>Distance (km)</th></tr>");
    for mirror in &results.mirror_list {
        body.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{:.0}</td></tr>",
            mirror.name, mirror.http_url, mirror.country_codes, mirror.distance_km
        ));
    }
    body.push_str("</table>");

    body.push_str("<h2>Excluded mirrors</h2><table>");
    body.push_str("<tr><th>Name</th><th>Reason</th></tr>");
    for mirror in &results.excluded_list {
        body.push_str(&format!(
            "<tr><td>{}</td><td>{}</td></tr>",
            mirror.name, mirror.exclude_reason
        ));
    }
    body.push_str("</table></body></html>");
    Html(body)
}

async fn checksum_handler(
    state: &AppState,
    config: &Configuration,
    uri: &Uri,
    query: &HashMap<String, String>,
) -> ApiResult<Response> {
    let rel = sanitize_path(uri.path())?;
    require_local_file(config, &rel).await?;

    let info = state.cache.get_file_info(&rel).await?;
    let hash = if query.contains_key("md5") {
        &info.md5
    } else if query.contains_key("sha1") {
        &info.sha1
    } else {
        &info.sha256
    };
    if hash.is_empty() {
        return Ok((StatusCode::NOT_FOUND, "Hash type not supported").into_response());
    }

    metrics::REQUESTS_TOTAL.with_label_values(&["checksum"]).inc();
    let basename = rel.rsplit('/').next().unwrap_or(&rel);
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=UTF-8")],
        format!("{hash}  {basename}"),
    )
        .into_response())
}

async fn file_stats_handler(
    state: &AppState,
    uri: &Uri,
    query: &HashMap<String, String>,
) -> ApiResult<Response> {
    let rel = sanitize_path(uri.path())?;
    let period = query.get("stats").map(String::as_str).unwrap_or("");

    // Period segments must be numeric: empty, YYYY, YYYY-MM or YYYY-MM-DD.
    for part in period.split('-') {
        if part.is_empty() {
            continue;
        }
        if part.parse::<i64>().is_err() {
            return Err(ApiError::BadRequest("Invalid period".into()));
        }
    }

    metrics::REQUESTS_TOTAL.with_label_values(&["stats"]).inc();
    if period.is_empty() {
        let now = state.stats.file_stats_now(&rel).await?;
        Ok(Json(now).into_response())
    } else {
        let key = period.replace('-', "_");
        let mut stats = state.stats.file_stats_period(&rel, &key).await?;
        stats.period = period.to_string();
        Ok(Json(stats).into_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_resolves_dot_segments() {
        assert_eq!(sanitize_path("/a/b/../c").unwrap(), "a/c");
        assert_eq!(sanitize_path("/a//./b").unwrap(), "a/b");
    }

    #[test]
    fn sanitize_rejects_escape_and_empty() {
        assert!(matches!(sanitize_path("/../etc/passwd"), Err(ApiError::Forbidden)));
        assert!(matches!(sanitize_path("/a/../.."), Err(ApiError::Forbidden)));
        assert!(matches!(sanitize_path("/"), Err(ApiError::NotFound)));
    }

    #[test]
    fn query_parser_handles_flags_and_values() {
        let q = parse_query("mirrorlist&fromip=1.2.3.4");
        assert!(q.contains_key("mirrorlist"));
        assert_eq!(q.get("fromip").map(String::as_str), Some("1.2.3.4"));
        assert!(parse_query("").is_empty());
    }

    #[test]
    fn fallbacks_prefer_client_country_then_continent() {
        let config = Configuration {
            fallbacks: vec![
                windrose_core::config::Fallback {
                    url: "https://us.example/repo".into(),
                    country_code: "us".into(),
                    continent_code: "na".into(),
                    ..Default::default()
                },
                windrose_core::config::Fallback {
                    url: "https://sg.example/repo".into(),
                    country_code: "sg".into(),
                    continent_code: "as".into(),
                    ..Default::default()
                },
                windrose_core::config::Fallback {
                    url: "https://cn.example/repo".into(),
                    country_code: "cn".into(),
                    continent_code: "as".into(),
                    ..Default::default()
                },
            ],
            ..Configuration::for_testing()
        };
        let client = GeoIpRecord {
            country_code: "CN".into(),
            continent_code: "AS".into(),
            ..Default::default()
        };

        let mirrors = fallback_mirrors(&config, &client);
        assert_eq!(mirrors[0].http_url, "https://cn.example/repo");
        assert_eq!(mirrors[0].country, "China");
        assert_eq!(mirrors[0].country_codes, "CN");
        assert_eq!(mirrors[1].http_url, "https://sg.example/repo");
        // Synthetic ids are zero and negative.
        assert!(mirrors.iter().all(|m| m.id <= 0));
    }

    #[test]
    fn renderer_auto_honors_accept_and_disallow() {
        let config = Configuration::for_testing();
        let mut headers = HeaderMap::new();
        assert!(matches!(choose_renderer(&config, &headers), Renderer::Redirect));

        headers.insert(header::ACCEPT, "application/json".parse().unwrap());
        assert!(matches!(choose_renderer(&config, &headers), Renderer::Json));

        let no_redirects = Configuration {
            disallow_redirects: true,
            ..Configuration::for_testing()
        };
        assert!(matches!(
            choose_renderer(&no_redirects, &HeaderMap::new()),
            Renderer::Json
        ));

        let forced = Configuration {
            output_mode: "redirect".into(),
            disallow_redirects: true,
            ..Configuration::for_testing()
        };
        assert!(matches!(choose_renderer(&forced, &HeaderMap::new()), Renderer::Redirect));
    }
}
