//! Generic OpenID Connect provider.

use crate::claims::Claims;
use crate::client::OAuth2Client;
use crate::error::{OAuth2Error, OAuth2Result};
use crate::jwt::decode_jwt_payload;
use crate::provider::{AuthorizeConfig, ExternalProvider};
use crate::types::TokenResponse;
use async_trait::async_trait;
use broker_identity_core::{
    EXTRA_EMAIL, EXTRA_NAME, EXTRA_PREFERRED_USERNAME, ExternalIdentity,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};
use url::Url;

const OPENID_SCOPE: &str = "openid";

/// Which claims feed the identity. Each list is tried in order and the first
/// present, non-empty claim wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenIdClaims {
    #[serde(default = "default_id_claims")]
    pub id: Vec<String>,
    #[serde(default = "default_preferred_username_claims")]
    pub preferred_username: Vec<String>,
    #[serde(default = "default_name_claims")]
    pub name: Vec<String>,
    #[serde(default = "default_email_claims")]
    pub email: Vec<String>,
}

fn default_id_claims() -> Vec<String> {
    vec!["sub".to_string()]
}

fn default_preferred_username_claims() -> Vec<String> {
    vec!["preferred_username".to_string()]
}

fn default_name_claims() -> Vec<String> {
    vec!["name".to_string()]
}

fn default_email_claims() -> Vec<String> {
    vec!["email".to_string()]
}

impl Default for OpenIdClaims {
    fn default() -> Self {
        Self {
            id: default_id_claims(),
            preferred_username: default_preferred_username_claims(),
            name: default_name_claims(),
            email: default_email_claims(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenIdConfig {
    #[serde(flatten)]
    pub authorize: AuthorizeConfig,
    #[serde(default)]
    pub userinfo_url: Option<String>,
    #[serde(default)]
    pub extra_authorize_parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub claims: OpenIdClaims,
}

pub struct OpenIdProvider {
    name: String,
    config: OpenIdConfig,
    client: OAuth2Client,
}

impl OpenIdProvider {
    pub fn new(
        name: impl Into<String>,
        mut config: OpenIdConfig,
        client: OAuth2Client,
    ) -> OAuth2Result<Self> {
        Url::parse(&config.authorize.authorize_url)?;
        Url::parse(&config.authorize.token_url)?;
        if let Some(userinfo) = &config.userinfo_url {
            Url::parse(userinfo)?;
        }
        if config.claims.id.is_empty() {
            return Err(OAuth2Error::ConfigError(
                "at least one id claim is required".to_string(),
            ));
        }

        if !config.authorize.scopes.iter().any(|s| s == OPENID_SCOPE) {
            config.authorize.scopes.insert(0, OPENID_SCOPE.to_string());
        }

        Ok(Self {
            name: name.into(),
            config,
            client,
        })
    }

    /// Claims asserted for the token response: the id_token payload, merged
    /// with the userinfo document when one is configured.
    ///
    /// Userinfo is only trusted when its `sub` equals the id_token's.
    pub async fn identity_claims(&self, tokens: &TokenResponse) -> OAuth2Result<Claims> {
        let id_token = tokens
            .id_token
            .as_deref()
            .ok_or(OAuth2Error::MissingIdToken)?;
        let mut claims = decode_jwt_payload(id_token)?;

        let Some(userinfo_url) = &self.config.userinfo_url else {
            return Ok(claims);
        };

        let id_token_subject = claims
            .subject()
            .ok_or_else(|| OAuth2Error::MissingClaim(vec!["sub".to_string()]))?;
        let userinfo = self
            .client
            .get_claims(userinfo_url, &tokens.access_token)
            .await?;
        let userinfo_subject = userinfo.subject().unwrap_or_default();
        if userinfo_subject != id_token_subject {
            warn!(provider = %self.name, "userinfo subject does not match id_token");
            return Err(OAuth2Error::SubjectMismatch {
                id_token: id_token_subject,
                userinfo: userinfo_subject,
            });
        }

        claims.merge(userinfo);
        Ok(claims)
    }

    pub fn identity_from_claims(&self, claims: &Claims) -> OAuth2Result<ExternalIdentity> {
        let mapping = &self.config.claims;
        let id = claims
            .first_of(&mapping.id)
            .ok_or_else(|| OAuth2Error::MissingClaim(mapping.id.clone()))?;

        let mut identity = ExternalIdentity::new(&self.name, id);
        for (key, names) in [
            (EXTRA_PREFERRED_USERNAME, &mapping.preferred_username),
            (EXTRA_NAME, &mapping.name),
            (EXTRA_EMAIL, &mapping.email),
        ] {
            if let Some(value) = claims.first_of(names) {
                identity = identity.with_extra(key, value);
            }
        }

        debug!(provider = %self.name, identity = %identity.key(), "extracted OpenID identity");
        Ok(identity)
    }
}

#[async_trait]
impl ExternalProvider for OpenIdProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn authorize_config(&self) -> &AuthorizeConfig {
        &self.config.authorize
    }

    fn add_custom_parameters(&self, params: &mut Vec<(String, String)>) {
        params.extend(
            self.config
                .extra_authorize_parameters
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
    }

    async fn get_user_identity(&self, tokens: &TokenResponse) -> OAuth2Result<ExternalIdentity> {
        let claims = self.identity_claims(tokens).await?;
        self.identity_from_claims(&claims)
    }
}
