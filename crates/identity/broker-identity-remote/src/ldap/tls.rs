use crate::RemoteError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, crypto};

/// How the directory connection is secured.
///
/// Unless `insecure` is set, `ldaps://` connects with TLS and `ldap://` is
/// upgraded with StartTLS before anything is sent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LdapTlsConfig {
    /// Talk to the directory in cleartext. Not allowed with `ldaps://`.
    #[serde(default)]
    pub insecure: bool,
    /// PEM bundle trusted instead of the built-in web PKI roots.
    #[serde(default)]
    pub ca_file: Option<PathBuf>,
}

fn root_store(ca_file: Option<&Path>) -> Result<RootCertStore, RemoteError> {
    let mut roots = RootCertStore::empty();
    let Some(path) = ca_file else {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        return Ok(roots);
    };

    let ca_error = |source| RemoteError::CaFile {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = BufReader::new(File::open(path).map_err(ca_error)?);
    for cert in rustls_pemfile::certs(&mut reader) {
        roots
            .add(cert.map_err(ca_error)?)
            .map_err(|e| RemoteError::Tls(format!("{}: {e}", path.display())))?;
    }
    if roots.is_empty() {
        return Err(RemoteError::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(roots)
}

pub(crate) fn connector(ca_file: Option<&Path>) -> Result<TlsConnector, RemoteError> {
    let config = ClientConfig::builder_with_provider(Arc::new(crypto::ring::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| RemoteError::Tls(e.to_string()))?
        .with_root_certificates(root_store(ca_file)?)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// The name the directory certificate must carry, from a `host:port` address.
pub(crate) fn server_name(address: &str) -> Result<ServerName<'static>, RemoteError> {
    let host = match address.strip_prefix('[') {
        Some(rest) => rest.split_once(']').map_or(rest, |(host, _)| host),
        None => address.rsplit_once(':').map_or(address, |(host, _)| host),
    };
    ServerName::try_from(host.to_string())
        .map_err(|_| RemoteError::Tls(format!("invalid TLS server name {host:?}")))
}
