use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocalError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("Password hashing failed: {0}")]
    Hash(String),
}
