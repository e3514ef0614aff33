use crate::RemoteError;
use reqwest::{Certificate, Client};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport settings shared by the HTTP based backends.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    /// PEM bundle trusted in addition to the system roots.
    pub ca_file: Option<PathBuf>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            ca_file: None,
        }
    }
}

/// Builds the client used for every outbound call of one backend. Its
/// timeout is the only bound on how long a login waits for that backend.
pub fn build_http_client(config: &HttpClientConfig) -> Result<Client, RemoteError> {
    let mut builder = Client::builder().timeout(config.timeout);

    if let Some(path) = &config.ca_file {
        let pem = std::fs::read(path).map_err(|source| RemoteError::CaFile {
            path: path.clone(),
            source,
        })?;
        builder = builder.add_root_certificate(Certificate::from_pem(&pem)?);
    }

    Ok(builder.build()?)
}
