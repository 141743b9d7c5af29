//! Background control plane.
//!
//! One [`monitor::Monitor`] per replica drives everything that happens off
//! the request path: rescanning the authoritative repository manifest,
//! health-checking mirrors, and running per-mirror file scans. The
//! [`cluster::Cluster`] partitions mirrors across live replicas so each
//! mirror is scanned by exactly one of them.

pub mod cluster;
pub mod error;
pub mod monitor;
pub mod scanner;
pub mod source;

pub use cluster::Cluster;
pub use error::{ScanError, ScanResult};
pub use monitor::Monitor;
pub use scanner::{HttpScanner, ScanOutcome, Scanner, scan_mirror};
pub use source::scan_source;
