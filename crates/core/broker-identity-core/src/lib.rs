//! Core identity types and the mapping of external identities onto users.

mod mapper;
mod registry;

pub use mapper::RegistryIdentityMapper;
pub use registry::{
    IdentityRecord, InMemoryUserRegistry, RegistryError, UserRecord, UserRef, UserRegistry,
};

use async_trait::async_trait;
use broker_auth_core::{AuthError, MappingFailure, User};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Well-known key of [`ExternalIdentity::extra`] holding an email address.
pub const EXTRA_EMAIL: &str = "email";
/// Well-known key of [`ExternalIdentity::extra`] holding a display name.
pub const EXTRA_NAME: &str = "name";
/// Well-known key of [`ExternalIdentity::extra`] holding the user name the
/// provider suggests for the principal.
pub const EXTRA_PREFERRED_USERNAME: &str = "preferred_username";

/// A principal as asserted by one identity provider.
///
/// `provider_user_name` is only unique within `provider_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalIdentity {
    pub provider_name: String,
    pub provider_user_name: String,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl ExternalIdentity {
    pub fn new(provider_name: impl Into<String>, provider_user_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            provider_user_name: provider_user_name.into(),
            extra: HashMap::new(),
        }
    }

    /// Adds an extra attribute. Empty values are dropped.
    pub fn with_extra(mut self, key: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        if !value.is_empty() {
            self.extra.insert(key.to_string(), value);
        }
        self
    }

    /// Globally unique key of this identity: `provider:providerUserName`.
    pub fn key(&self) -> String {
        identity_key(&self.provider_name, &self.provider_user_name)
    }

    /// The user name this identity would like to have.
    pub fn preferred_user_name(&self) -> &str {
        self.extra
            .get(EXTRA_PREFERRED_USERNAME)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.provider_user_name)
    }

    pub fn email(&self) -> Option<&str> {
        self.extra.get(EXTRA_EMAIL).map(String::as_str)
    }

    pub fn display_name(&self) -> Option<&str> {
        self.extra.get(EXTRA_NAME).map(String::as_str)
    }
}

pub fn identity_key(provider_name: &str, provider_user_name: &str) -> String {
    format!("{provider_name}:{provider_user_name}")
}

/// How an identity without an existing mapping is turned into a user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingMethod {
    /// Map to a new user, or to an existing same-named user that has no
    /// identity from this provider yet.
    #[default]
    Claim,
    /// Only resolve identities that are already mapped.
    Lookup,
    /// Like `Claim`, but a user may collect several identities of one provider.
    Add,
    /// Pick a fresh user name (`name2`, `name3`, ...) when the preferred one is
    /// taken.
    Generate,
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("Lookup of user for {0} failed: no mapping exists")]
    Lookup(String),

    #[error(
        "Identity {identity} cannot claim user {user}: it already has an identity from {provider}"
    )]
    Claim {
        identity: String,
        user: String,
        provider: String,
    },

    #[error("Could not allocate a user name for {0}")]
    NameExhausted(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl From<MappingError> for AuthError {
    fn from(err: MappingError) -> Self {
        let failure = match &err {
            MappingError::Lookup(_) => MappingFailure::Lookup,
            MappingError::Claim { .. } => MappingFailure::Claim,
            MappingError::NameExhausted(_) | MappingError::Registry(_) => MappingFailure::Other,
        };
        AuthError::Mapping {
            failure,
            message: err.to_string(),
        }
    }
}

/// Resolves an external identity to exactly one user.
///
/// Repeated calls for the same identity must return the same user.
#[async_trait]
pub trait IdentityMapper: Send + Sync {
    async fn user_for(&self, identity: &ExternalIdentity) -> Result<User, MappingError>;
}
