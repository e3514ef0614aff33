use crate::client::OAuth2Client;
use crate::error::{OAuth2Error, OAuth2Result};
use crate::openid::{OpenIdClaims, OpenIdConfig, OpenIdProvider};
use crate::provider::{AuthorizeConfig, ExternalProvider};
use crate::types::TokenResponse;
use async_trait::async_trait;
use broker_identity_core::ExternalIdentity;
use std::collections::BTreeMap;

pub const GOOGLE_AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://www.googleapis.com/oauth2/v3/token";
pub const GOOGLE_USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v3/userinfo";

/// Google accounts, optionally restricted to one G Suite hosted domain.
pub struct GoogleProvider {
    openid: OpenIdProvider,
    hosted_domain: Option<String>,
}

impl GoogleProvider {
    pub fn new(
        name: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        hosted_domain: Option<String>,
        client: OAuth2Client,
    ) -> OAuth2Result<Self> {
        let config = OpenIdConfig {
            authorize: AuthorizeConfig {
                client_id: client_id.into(),
                client_secret: client_secret.into(),
                authorize_url: GOOGLE_AUTHORIZE_URL.to_string(),
                token_url: GOOGLE_TOKEN_URL.to_string(),
                scopes: vec!["openid".to_string(), "email".to_string(), "profile".to_string()],
            },
            userinfo_url: Some(GOOGLE_USERINFO_URL.to_string()),
            extra_authorize_parameters: BTreeMap::new(),
            claims: OpenIdClaims {
                preferred_username: vec!["preferred_username".to_string(), "email".to_string()],
                ..OpenIdClaims::default()
            },
        };
        Self::with_config(name, config, hosted_domain, client)
    }

    /// Like [`GoogleProvider::new`] with explicit endpoints.
    pub fn with_config(
        name: impl Into<String>,
        config: OpenIdConfig,
        hosted_domain: Option<String>,
        client: OAuth2Client,
    ) -> OAuth2Result<Self> {
        Ok(Self {
            openid: OpenIdProvider::new(name, config, client)?,
            hosted_domain: hosted_domain.filter(|hd| !hd.is_empty()),
        })
    }
}

#[async_trait]
impl ExternalProvider for GoogleProvider {
    fn name(&self) -> &str {
        self.openid.name()
    }

    fn authorize_config(&self) -> &AuthorizeConfig {
        self.openid.authorize_config()
    }

    fn add_custom_parameters(&self, params: &mut Vec<(String, String)>) {
        self.openid.add_custom_parameters(params);
        if let Some(hd) = &self.hosted_domain {
            params.push(("hd".to_string(), hd.clone()));
        }
    }

    async fn get_user_identity(&self, tokens: &TokenResponse) -> OAuth2Result<ExternalIdentity> {
        let claims = self.openid.identity_claims(tokens).await?;

        // The hd authorize parameter is only a hint to the account chooser.
        if let Some(expected) = &self.hosted_domain {
            let actual = claims.string("hd").unwrap_or_default();
            if &actual != expected {
                return Err(OAuth2Error::Rejected(format!(
                    "hosted domain {actual:?} is not {expected:?}"
                )));
            }
        }

        self.openid.identity_from_claims(&claims)
    }
}
