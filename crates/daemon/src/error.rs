//! Error types for the background control plane.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("scan aborted")]
    Aborted,

    #[error("scan already in progress")]
    InProgress,

    #[error("{url} does not start with https://")]
    NotHttps { url: String },

    #[error("mirror base URL {url} answered status {status}")]
    BaseUnreachable { url: String, status: u16 },

    #[error("file {path}: request answered status {status}")]
    File { path: String, status: u16 },

    #[error("file {path}: size mismatch (source {expected}, mirror {actual})")]
    SizeMismatch {
        path: String,
        expected: i64,
        actual: i64,
    },

    #[error("selector list is empty, nothing to probe")]
    EmptySelector,

    #[error("source manifest: {0}")]
    Source(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Kv(#[from] windrose_kv::KvError),
}

impl ScanError {
    /// The selector file the scan failed on, when one is attributable.
    pub fn file_path(&self) -> Option<&str> {
        match self {
            Self::File { path, .. } | Self::SizeMismatch { path, .. } => Some(path),
            _ => None,
        }
    }
}

pub type ScanResult<T> = std::result::Result<T, ScanError>;
