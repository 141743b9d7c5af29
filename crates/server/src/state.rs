//! Application state shared across handlers.

use crate::geo::GeoResolver;
use crate::selection::SelectionEngine;
use crate::stats::Stats;
use std::sync::Arc;
use windrose_index::{Cache, RepoTree};
use windrose_kv::KvStore;

/// Shared application state. Configuration is intentionally absent: it is
/// read through the process-global handle so a reload reaches in-flight
/// handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn KvStore>,
    pub cache: Cache,
    pub tree: Arc<RepoTree>,
    pub engine: Arc<dyn SelectionEngine>,
    pub geo: Arc<dyn GeoResolver>,
    pub stats: Stats,
}

impl AppState {
    pub fn new(
        store: Arc<dyn KvStore>,
        cache: Cache,
        tree: Arc<RepoTree>,
        engine: Arc<dyn SelectionEngine>,
        geo: Arc<dyn GeoResolver>,
    ) -> Self {
        let stats = Stats::new(store.clone());
        Self {
            store,
            cache,
            tree,
            engine,
            geo,
            stats,
        }
    }
}
