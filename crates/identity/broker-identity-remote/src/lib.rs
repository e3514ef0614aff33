//! Password authenticators that delegate to a remote service.
//!
//! Every backend answers "wrong credentials" with `Ok(None)` and reserves
//! errors for failures of the backend itself, so that a union can move on to
//! the next provider.

mod basic_auth;
mod error;
mod http;
mod keystone;
pub mod ldap;

pub use basic_auth::BasicAuthPasswordAuthenticator;
pub use error::RemoteError;
pub use http::{HttpClientConfig, build_http_client};
pub use keystone::KeystonePasswordAuthenticator;
pub use ldap::{
    BindCredentials, DirectoryClient, LdapAttributeMapping, LdapPasswordAuthenticator,
    LdapTlsConfig, LdapUrl, TcpDirectoryClient,
};
