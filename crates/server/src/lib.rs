//! HTTP front end for the windrose redirector.
//!
//! This crate provides the request path:
//! - path sanitization and renderer selection
//! - the mirror selection engine
//! - JSON / redirect / mirror-list / checksum / stats responses
//! - download accounting
//! - geo-IP resolution behind a seam

pub mod error;
pub mod geo;
pub mod handlers;
pub mod metrics;
pub mod routes;
pub mod selection;
pub mod state;
pub mod stats;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use selection::{DefaultEngine, SelectionContext, SelectionEngine};
pub use state::AppState;
