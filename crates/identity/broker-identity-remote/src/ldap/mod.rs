//! Search-then-bind password authentication against an LDAP directory.

mod ber;
mod client;
mod filter;
mod tls;

pub use client::{BindCredentials, TcpDirectoryClient};
pub use filter::{Filter, escape_filter_value};
pub use tls::LdapTlsConfig;

use crate::RemoteError;
use async_trait::async_trait;
use broker_auth_core::{AuthError, AuthOutcome, PasswordAuthenticator};
use broker_identity_core::{
    EXTRA_EMAIL, EXTRA_NAME, EXTRA_PREFERRED_USERNAME, ExternalIdentity, IdentityMapper,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LdapScheme {
    Ldap,
    Ldaps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Base = 0,
    One = 1,
    Sub = 2,
}

/// An RFC 2255 URL: `ldap[s]://host[:port]/baseDN?attribute?scope?filter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapUrl {
    pub scheme: LdapScheme,
    /// `host:port`, with the scheme's default port filled in.
    pub host: String,
    pub base_dn: String,
    /// Attribute compared against the login name. Defaults to `uid`.
    pub attribute: String,
    pub scope: SearchScope,
    pub filter: String,
}

impl LdapUrl {
    pub fn parse(url: &str) -> Result<Self, RemoteError> {
        let invalid = |reason: &str| RemoteError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = if let Some(rest) = url.strip_prefix("ldap://") {
            (LdapScheme::Ldap, rest)
        } else if let Some(rest) = url.strip_prefix("ldaps://") {
            (LdapScheme::Ldaps, rest)
        } else {
            return Err(invalid("scheme must be ldap or ldaps"));
        };

        let (host, rest) = rest.split_once('/').unwrap_or((rest, ""));
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let host = if host.contains(':') {
            host.to_string()
        } else {
            let port = match scheme {
                LdapScheme::Ldap => 389,
                LdapScheme::Ldaps => 636,
            };
            format!("{host}:{port}")
        };

        let mut parts = rest.splitn(4, '?');
        let base_dn = parts.next().unwrap_or_default().to_string();

        let attribute = match parts.next().unwrap_or_default() {
            "" => "uid".to_string(),
            attributes => {
                let mut attributes = attributes.split(',');
                let first = attributes.next().unwrap_or_default().to_string();
                if attributes.next().is_some() {
                    return Err(invalid("only one search attribute is allowed"));
                }
                first
            }
        };

        let scope = match parts.next().unwrap_or_default() {
            "" | "sub" => SearchScope::Sub,
            "one" => SearchScope::One,
            "base" => SearchScope::Base,
            _ => return Err(invalid("scope must be base, one or sub")),
        };

        let filter = match parts.next().unwrap_or_default() {
            "" => "(objectClass=*)".to_string(),
            filter => filter.to_string(),
        };
        Filter::parse(&filter).map_err(|e| invalid(&e))?;

        Ok(Self {
            scheme,
            host,
            base_dn,
            attribute,
            scope,
            filter,
        })
    }

    /// Filter selecting the entry of `username`.
    pub fn user_filter(&self, username: &str) -> String {
        format!(
            "(&{}({}={}))",
            self.filter,
            self.attribute,
            escape_filter_value(username)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub base_dn: String,
    pub scope: SearchScope,
    pub filter: String,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attributes: HashMap<String, Vec<String>>,
}

impl DirectoryEntry {
    /// First non-empty value of the first listed attribute that has one. The
    /// pseudo attribute `dn` names the entry's DN.
    pub fn first_value(&self, names: &[String]) -> Option<String> {
        names.iter().find_map(|name| {
            if name.eq_ignore_ascii_case("dn") {
                return Some(self.dn.clone()).filter(|dn| !dn.is_empty());
            }
            self.attributes
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(name))
                .and_then(|(_, values)| values.iter().find(|v| !v.is_empty()).cloned())
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Directory unreachable: {0}")]
    Connection(String),

    #[error("Directory operation failed with result code {code}: {message}")]
    Operation { code: i64, message: String },

    #[error("Malformed directory response: {0}")]
    Protocol(String),
}

/// The two directory operations a search-then-bind login needs.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    async fn search(&self, request: &SearchRequest) -> Result<Vec<DirectoryEntry>, DirectoryError>;

    async fn bind(&self, dn: &str, password: &str) -> Result<(), DirectoryError>;
}

/// Which entry attributes populate the identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LdapAttributeMapping {
    pub id: Vec<String>,
    pub preferred_username: Vec<String>,
    pub name: Vec<String>,
    pub email: Vec<String>,
}

impl Default for LdapAttributeMapping {
    fn default() -> Self {
        Self {
            id: vec!["dn".to_string()],
            preferred_username: vec!["uid".to_string()],
            name: vec!["cn".to_string()],
            email: vec!["mail".to_string()],
        }
    }
}

impl LdapAttributeMapping {
    fn requested_attributes(&self) -> Vec<String> {
        let mut attributes: Vec<String> = Vec::new();
        for name in self
            .id
            .iter()
            .chain(&self.preferred_username)
            .chain(&self.name)
            .chain(&self.email)
        {
            if !name.eq_ignore_ascii_case("dn") && !attributes.contains(name) {
                attributes.push(name.clone());
            }
        }
        attributes
    }
}

pub struct LdapPasswordAuthenticator {
    provider_name: String,
    url: LdapUrl,
    mapping: LdapAttributeMapping,
    client: Arc<dyn DirectoryClient>,
    mapper: Arc<dyn IdentityMapper>,
}

impl LdapPasswordAuthenticator {
    pub fn new(
        provider_name: impl Into<String>,
        url: LdapUrl,
        mapping: LdapAttributeMapping,
        client: Arc<dyn DirectoryClient>,
        mapper: Arc<dyn IdentityMapper>,
    ) -> Self {
        Self {
            provider_name: provider_name.into(),
            url,
            mapping,
            client,
            mapper,
        }
    }

    fn directory_failure(&self, err: DirectoryError) -> AuthError {
        warn!(provider = %self.provider_name, error = %err, "ldap directory failure");
        AuthError::Infrastructure(err.to_string())
    }
}

#[async_trait]
impl PasswordAuthenticator for LdapPasswordAuthenticator {
    async fn authenticate_password(&self, username: &str, password: &str) -> AuthOutcome {
        let username = username.trim();
        // An empty password would be an anonymous bind, which always succeeds.
        if username.is_empty() || password.is_empty() {
            return Ok(None);
        }

        let request = SearchRequest {
            base_dn: self.url.base_dn.clone(),
            scope: self.url.scope,
            filter: self.url.user_filter(username),
            attributes: self.mapping.requested_attributes(),
        };
        let mut entries = self
            .client
            .search(&request)
            .await
            .map_err(|e| self.directory_failure(e))?;

        let entry = match entries.len() {
            0 => {
                debug!(provider = %self.provider_name, "no directory entry for login");
                return Ok(None);
            }
            1 => entries.remove(0),
            n => {
                return Err(AuthError::Protocol(format!(
                    "multiple directory entries ({n}) matched the login"
                )));
            }
        };

        match self.client.bind(&entry.dn, password).await {
            Ok(()) => {}
            Err(DirectoryError::InvalidCredentials) => {
                debug!(provider = %self.provider_name, "directory bind rejected password");
                return Ok(None);
            }
            Err(err) => return Err(self.directory_failure(err)),
        }

        let id = entry.first_value(&self.mapping.id).ok_or_else(|| {
            AuthError::Protocol(format!("entry {} has no identity attribute", entry.dn))
        })?;

        let mut identity = ExternalIdentity::new(&self.provider_name, id);
        for (key, names) in [
            (EXTRA_PREFERRED_USERNAME, &self.mapping.preferred_username),
            (EXTRA_NAME, &self.mapping.name),
            (EXTRA_EMAIL, &self.mapping.email),
        ] {
            if let Some(value) = entry.first_value(names) {
                identity = identity.with_extra(key, value);
            }
        }

        Ok(Some(self.mapper.user_for(&identity).await?))
    }
}
