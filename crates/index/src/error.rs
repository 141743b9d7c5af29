//! Error types for the index crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("manifest error: {0}")]
    Manifest(String),

    #[error(transparent)]
    Kv(#[from] windrose_kv::KvError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type IndexResult<T> = std::result::Result<T, IndexError>;
