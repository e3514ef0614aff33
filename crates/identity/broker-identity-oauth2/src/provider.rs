//! The contract every external identity provider fulfils.

use crate::error::OAuth2Result;
use crate::types::TokenResponse;
use async_trait::async_trait;
use broker_identity_core::ExternalIdentity;
use serde::{Deserialize, Serialize};

/// Client registration and endpoints of one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizeConfig {
    pub client_id: String,
    pub client_secret: String,
    pub authorize_url: String,
    pub token_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// An external OAuth2 identity provider.
#[async_trait]
pub trait ExternalProvider: Send + Sync {
    /// Name used as `ExternalIdentity::provider_name`.
    fn name(&self) -> &str;

    fn authorize_config(&self) -> &AuthorizeConfig;

    /// Provider specific query parameters for the authorize redirect.
    fn add_custom_parameters(&self, _params: &mut Vec<(String, String)>) {}

    /// Turns the token endpoint's answer into the identity it asserts.
    async fn get_user_identity(&self, tokens: &TokenResponse) -> OAuth2Result<ExternalIdentity>;
}
