//! Core domain types shared across the windrose crates.
//!
//! This crate holds everything the background daemon and the HTTP front end
//! agree on: the configuration (with its process-global reload handle), the
//! mirror and file records as they round-trip through the shared KV store,
//! geographic helpers, and the modification-time precision type used to
//! compare source and mirror timestamps with slack.

pub mod config;
pub mod error;
pub mod geo;
pub mod mirror;
pub mod ptime;

pub use config::Configuration;
pub use error::{ConfigError, Result};
pub use geo::GeoIpRecord;
pub use mirror::{FileInfo, Mirror};
pub use ptime::Precision;
