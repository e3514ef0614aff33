use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while constructing a remote authenticator.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Failed to read CA bundle {path}: {source}")]
    CaFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("Unsupported configuration: {0}")]
    Unsupported(String),

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}
