use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by blob store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to access blob file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed value under `{key}`: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("blob file {0} is not a JSON object")]
    NotAnObject(PathBuf),
}

pub type StoreResult<T> = Result<T, StoreError>;
