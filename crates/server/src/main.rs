//! windrosed, the windrose redirector daemon.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use windrose_core::config;
use windrose_daemon::{HttpScanner, Monitor, Scanner};
use windrose_index::{Cache, RepoTree};
use windrose_kv::{KvStore, RedisStore};
use windrose_server::geo::{GeoResolver, MaxMindResolver, StaticResolver};
use windrose_server::{AppState, DefaultEngine, create_router};

/// windrose - a geo-aware download redirector
#[derive(Parser, Debug)]
#[command(name = "windrosed")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "WINDROSE_CONFIG", default_value = "/etc/windrose.yaml")]
    config: String,
}

/// The drain window for in-flight responses after a shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("windrose v{}", env!("CARGO_PKG_VERSION"));

    let configuration = config::load(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config))?;
    let listen = listen_addr(&configuration.listen_address)?;
    config::set_global(configuration.clone());

    // Shared KV store.
    let store: Arc<dyn KvStore> = Arc::new(
        RedisStore::connect(&configuration)
            .await
            .context("failed to connect to the KV store")?,
    );
    tracing::info!(address = %configuration.redis_address, "KV store connected");

    // Caches, repository tree, geo resolver.
    let cache = Cache::new(store.clone());
    let tree = Arc::new(RepoTree::new());
    let geo: Arc<dyn GeoResolver> = match MaxMindResolver::open(&configuration.geoip_database_path)
    {
        Ok(resolver) => Arc::new(resolver),
        Err(err) => {
            if configuration.fallbacks.is_empty() {
                anyhow::bail!(
                    "can't load the GeoIP database from {} and no fallbacks configured: {err}",
                    configuration.geoip_database_path
                );
            }
            tracing::error!(
                error = %err,
                path = %configuration.geoip_database_path,
                "GeoIP database unavailable, all requests will use the fallback mirrors"
            );
            Arc::new(StaticResolver::new())
        }
    };

    // SIGHUP reloads the configuration file; subscribers pick the change
    // up through the global handle.
    #[cfg(unix)]
    {
        let config_path = args.config.clone();
        tokio::spawn(async move {
            let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            {
                Ok(signal) => signal,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to install SIGHUP handler");
                    return;
                }
            };
            while hup.recv().await.is_some() {
                match config::load(&config_path) {
                    Ok(reloaded) => {
                        config::set_global(reloaded);
                        tracing::info!("configuration reloaded");
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "configuration reload failed, keeping the old one");
                    }
                }
            }
        });
    }

    // Background monitor.
    let scanner: Arc<dyn Scanner> = Arc::new(HttpScanner::new(tree.clone()));
    let monitor = Arc::new(Monitor::new(
        store.clone(),
        cache.clone(),
        tree.clone(),
        scanner,
    ));
    let monitor_handle = {
        let monitor = monitor.clone();
        tokio::spawn(async move {
            if let Err(err) = monitor.run().await {
                tracing::error!(error = %err, "monitor terminated");
            }
        })
    };

    // HTTP front end.
    windrose_server::metrics::register_metrics();
    let state = AppState::new(store, cache, tree, Arc::new(DefaultEngine), geo);
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind to {listen}"))?;
    tracing::info!("service listening on {listen}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("shutting down");
    monitor.stop();
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, monitor_handle)
        .await
        .is_err()
    {
        tracing::warn!("monitor did not stop within the drain window");
    }
    Ok(())
}

/// Accept the `":8080"` shorthand of the reference configuration.
fn listen_addr(value: &str) -> Result<SocketAddr> {
    let normalized = if value.starts_with(':') {
        format!("0.0.0.0{value}")
    } else {
        value.to_string()
    };
    normalized
        .parse()
        .with_context(|| format!("invalid listen address: {value}"))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listen_addr_accepts_port_shorthand() {
        assert_eq!(
            listen_addr(":8080").unwrap(),
            "0.0.0.0:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            listen_addr("127.0.0.1:9000").unwrap(),
            "127.0.0.1:9000".parse::<SocketAddr>().unwrap()
        );
        assert!(listen_addr("not-an-address").is_err());
    }
}
