//! Broker configuration.
//!
//! Identity providers are a tagged list: the `kind` field selects the
//! backend and the remaining fields are that backend's settings. Everything
//! is checked by [`BrokerConfig::validate`] before any provider is built.

use crate::client::{GrantMethod, OAuthClient};
use broker_identity_core::MappingMethod;
use broker_identity_oauth2::OpenIdConfig;
use broker_identity_remote::ldap::LdapScheme;
use broker_identity_remote::{LdapAttributeMapping, LdapTlsConfig, LdapUrl};
use broker_identity_request::RequestHeaderConfig;
use broker_identity_session::MIN_SECRET_LEN;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid URL for {field}: {reason}")]
    InvalidUrl { field: String, reason: String },

    #[error("Identity provider names must be non-empty")]
    EmptyProviderName,

    #[error("Identity provider {0:?} is configured twice")]
    DuplicateProvider(String),

    #[error("Session secret must be at least {MIN_SECRET_LEN} bytes")]
    SessionSecretTooShort,

    #[error("Identity provider {provider:?}: {reason}")]
    Provider { provider: String, reason: String },

    #[error("Client {0:?} is configured twice")]
    DuplicateClient(String),

    #[error("Client {0:?} has no redirect URIs")]
    MissingRedirectUri(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Public base URL of the broker, used to build provider callback URLs.
    pub master_public_url: String,

    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    pub session: SessionSettings,

    #[serde(default)]
    pub grant: GrantSettings,

    #[serde(default)]
    pub token_cache: TokenCacheSettings,

    #[serde(default)]
    pub tokens: TokenSettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    /// Error page that failed interactive logins are redirected to.
    #[serde(default = "default_error_url")]
    pub error_url: String,

    #[serde(default)]
    pub identity_providers: Vec<IdentityProviderConfig>,

    #[serde(default)]
    pub clients: Vec<OAuthClient>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    pub secret: String,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default = "default_session_max_age")]
    pub max_age_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GrantSettings {
    /// Used for clients without a grant method of their own.
    #[serde(default)]
    pub method: GrantMethod,
}

/// Caching of bearer token lookups. A zero TTL or capacity disables it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCacheSettings {
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSettings {
    #[serde(default = "default_access_token_max_age")]
    pub access_token_max_age_seconds: u64,
    #[serde(default = "default_authorize_code_max_age")]
    pub authorize_code_max_age_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// A level or a full `EnvFilter` directive.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_listen_address() -> String {
    "127.0.0.1:8443".to_string()
}

fn default_error_url() -> String {
    "/login/error".to_string()
}

fn default_cookie_name() -> String {
    broker_identity_session::DEFAULT_COOKIE_NAME.to_string()
}

fn default_session_max_age() -> u64 {
    broker_identity_session::DEFAULT_MAX_AGE.as_secs()
}

fn default_cache_ttl() -> u64 {
    10
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_access_token_max_age() -> u64 {
    crate::tokens::DEFAULT_ACCESS_TOKEN_MAX_AGE.as_secs()
}

fn default_authorize_code_max_age() -> u64 {
    crate::tokens::DEFAULT_AUTHORIZE_CODE_MAX_AGE.as_secs()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for TokenCacheSettings {
    fn default() -> Self {
        Self {
            ttl_seconds: default_cache_ttl(),
            capacity: default_cache_capacity(),
        }
    }
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            access_token_max_age_seconds: default_access_token_max_age(),
            authorize_code_max_age_seconds: default_authorize_code_max_age(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl TokenCacheSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityProviderConfig {
    pub name: String,

    /// Accept credentials sent with the request and answer unauthenticated
    /// CLI clients with a challenge.
    #[serde(default)]
    pub challenge: bool,

    /// Offer the provider for interactive browser logins.
    #[serde(default = "default_true")]
    pub login: bool,

    #[serde(default)]
    pub mapping_method: MappingMethod,

    /// Groups added to every user authenticated by a `request_header`
    /// provider.
    #[serde(default)]
    pub groups: Vec<String>,

    #[serde(flatten)]
    pub provider: ProviderConfig,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    AllowAll,
    DenyAll,
    Htpasswd {
        file: PathBuf,
    },
    TokenFile {
        file: PathBuf,
    },
    BasicAuth {
        url: String,
        #[serde(default)]
        ca_file: Option<PathBuf>,
    },
    Keystone {
        url: String,
        domain_name: String,
        #[serde(default)]
        use_keystone_identity: bool,
        #[serde(default)]
        ca_file: Option<PathBuf>,
    },
    Ldap {
        url: String,
        #[serde(default)]
        bind_dn: Option<String>,
        #[serde(default)]
        bind_password: Option<String>,
        #[serde(default)]
        attributes: LdapAttributeMapping,
        #[serde(flatten)]
        tls: LdapTlsConfig,
    },
    RequestHeader(RequestHeaderConfig),
    Github {
        client_id: String,
        client_secret: String,
        #[serde(default)]
        organizations: Vec<String>,
    },
    Gitlab {
        url: String,
        client_id: String,
        client_secret: String,
    },
    Google {
        client_id: String,
        client_secret: String,
        #[serde(default)]
        hosted_domain: Option<String>,
    },
    Openid(OpenIdConfig),
}

impl ProviderConfig {
    /// Providers that can check a user name and password.
    pub fn checks_passwords(&self) -> bool {
        matches!(
            self,
            ProviderConfig::AllowAll
                | ProviderConfig::DenyAll
                | ProviderConfig::Htpasswd { .. }
                | ProviderConfig::BasicAuth { .. }
                | ProviderConfig::Keystone { .. }
                | ProviderConfig::Ldap { .. }
        )
    }

    /// Providers that log browsers in by redirecting them elsewhere.
    pub fn is_external_oauth(&self) -> bool {
        matches!(
            self,
            ProviderConfig::Github { .. }
                | ProviderConfig::Gitlab { .. }
                | ProviderConfig::Google { .. }
                | ProviderConfig::Openid(_)
        )
    }
}

fn check_url(field: impl Into<String>, url: &str) -> Result<(), ConfigError> {
    Url::parse(url).map(|_| ()).map_err(|e| ConfigError::InvalidUrl {
        field: field.into(),
        reason: e.to_string(),
    })
}

impl IdentityProviderConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::Provider {
            provider: self.name.clone(),
            reason: reason.to_string(),
        };
        let field = |name: &str| format!("{}.{}", self.name, name);

        match &self.provider {
            ProviderConfig::BasicAuth { url, .. } | ProviderConfig::Keystone { url, .. } => {
                check_url(field("url"), url)?;
            }
            ProviderConfig::Gitlab { url, .. } => check_url(field("url"), url)?,
            ProviderConfig::Ldap {
                url,
                bind_dn,
                bind_password,
                tls,
                ..
            } => {
                let url = LdapUrl::parse(url).map_err(|e| ConfigError::InvalidUrl {
                    field: field("url"),
                    reason: e.to_string(),
                })?;
                if bind_dn.is_some() != bind_password.is_some() {
                    return Err(invalid("bind_dn and bind_password must be set together"));
                }
                if tls.insecure && url.scheme == LdapScheme::Ldaps {
                    return Err(invalid("insecure cannot be combined with ldaps://"));
                }
            }
            ProviderConfig::Openid(config) => {
                check_url(field("authorize_url"), &config.authorize.authorize_url)?;
                check_url(field("token_url"), &config.authorize.token_url)?;
                if let Some(userinfo) = &config.userinfo_url {
                    check_url(field("userinfo_url"), userinfo)?;
                }
                if config.claims.id.is_empty() {
                    return Err(invalid("at least one id claim is required"));
                }
            }
            ProviderConfig::RequestHeader(headers) if headers.id_headers.is_empty() => {
                return Err(invalid("at least one id header is required"));
            }
            _ => {}
        }

        let secret = match &self.provider {
            ProviderConfig::Github { client_secret, .. }
            | ProviderConfig::Gitlab { client_secret, .. }
            | ProviderConfig::Google { client_secret, .. } => Some(client_secret),
            ProviderConfig::Openid(config) => Some(&config.authorize.client_secret),
            _ => None,
        };
        if secret.is_some_and(|s| s.is_empty()) {
            return Err(invalid("client_secret is required"));
        }

        if self.challenge
            && !self.provider.checks_passwords()
            && !matches!(self.provider, ProviderConfig::Openid(_))
        {
            return Err(invalid("challenge requires a password checking provider"));
        }
        if !self.groups.is_empty() && !matches!(self.provider, ProviderConfig::RequestHeader(_)) {
            return Err(invalid("groups are only supported for request_header providers"));
        }
        Ok(())
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_url("master_public_url", &self.master_public_url)?;
        if self.session.secret.len() < MIN_SECRET_LEN {
            return Err(ConfigError::SessionSecretTooShort);
        }

        let mut names = HashSet::new();
        for provider in &self.identity_providers {
            if provider.name.is_empty() {
                return Err(ConfigError::EmptyProviderName);
            }
            if !names.insert(provider.name.as_str()) {
                return Err(ConfigError::DuplicateProvider(provider.name.clone()));
            }
            provider.validate()?;
        }

        let mut clients = HashSet::new();
        for client in &self.clients {
            if !clients.insert(client.id.as_str()) {
                return Err(ConfigError::DuplicateClient(client.id.clone()));
            }
            if client.redirect_uris.is_empty() {
                return Err(ConfigError::MissingRedirectUri(client.id.clone()));
            }
            for uri in &client.redirect_uris {
                check_url(format!("{}.redirect_uris", client.id), uri)?;
            }
        }
        Ok(())
    }

    /// The `EnvFilter` directive for the configured level.
    pub fn log_filter(&self) -> String {
        let level = &self.logging.level;
        if level.contains('=') || level.contains(',') {
            level.clone()
        } else {
            format!(
                "broker_server={level},broker_oauth_server={level},\
                 broker_identity_oauth2={level},{level}"
            )
        }
    }

    /// The callback URL registered with external provider `name`.
    pub fn callback_url(&self, name: &str) -> String {
        format!(
            "{}/oauth2callback/{}",
            self.master_public_url.trim_end_matches('/'),
            name
        )
    }
}
