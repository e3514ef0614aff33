use crate::{HttpClientConfig, RemoteError, build_http_client};
use async_trait::async_trait;
use broker_auth_core::{AuthError, AuthOutcome, PasswordAuthenticator};
use broker_identity_core::{EXTRA_PREFERRED_USERNAME, ExternalIdentity, IdentityMapper};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    user: TokenUser,
}

#[derive(Debug, Deserialize)]
struct TokenUser {
    id: String,
    #[serde(default)]
    name: String,
}

/// Authenticates against the Keystone v3 password method.
///
/// The provider user name is the login name, or the Keystone user id when
/// `use_keystone_identity` is set so that renamed Keystone users keep their
/// broker user.
pub struct KeystonePasswordAuthenticator {
    provider_name: String,
    tokens_url: Url,
    domain_name: String,
    use_keystone_identity: bool,
    client: Client,
    mapper: Arc<dyn IdentityMapper>,
}

impl KeystonePasswordAuthenticator {
    pub fn new(
        provider_name: impl Into<String>,
        url: &str,
        domain_name: impl Into<String>,
        use_keystone_identity: bool,
        http: &HttpClientConfig,
        mapper: Arc<dyn IdentityMapper>,
    ) -> Result<Self, RemoteError> {
        let invalid = |reason: String| RemoteError::InvalidUrl {
            url: url.to_string(),
            reason,
        };
        let base = Url::parse(&format!("{}/", url.trim_end_matches('/')))
            .map_err(|e| invalid(e.to_string()))?;
        let tokens_url = base
            .join("v3/auth/tokens")
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            provider_name: provider_name.into(),
            tokens_url,
            domain_name: domain_name.into(),
            use_keystone_identity,
            client: build_http_client(http)?,
            mapper,
        })
    }
}

#[async_trait]
impl PasswordAuthenticator for KeystonePasswordAuthenticator {
    async fn authenticate_password(&self, username: &str, password: &str) -> AuthOutcome {
        if username.is_empty() || password.is_empty() {
            return Ok(None);
        }

        let request = json!({"auth": {"identity": {
            "methods": ["password"],
            "password": {
                "user": {
                    "name": username,
                    "password": password,
                    "domain": {"name": self.domain_name},
                }
            }
        }}});

        let response = self
            .client
            .post(self.tokens_url.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                warn!(provider = %self.provider_name, error = %e, "keystone unreachable");
                AuthError::Infrastructure(e.to_string())
            })?;

        match response.status() {
            StatusCode::CREATED => {}
            StatusCode::UNAUTHORIZED => {
                debug!(provider = %self.provider_name, "keystone rejected credentials");
                return Ok(None);
            }
            status => {
                warn!(provider = %self.provider_name, %status, "keystone authentication failed");
                return Err(AuthError::Infrastructure(format!(
                    "keystone returned {status}"
                )));
            }
        }

        let provider_user_name = if self.use_keystone_identity {
            let token: TokenResponse = response
                .json()
                .await
                .map_err(|e| AuthError::Protocol(format!("invalid keystone token: {e}")))?;
            debug!(keystone_name = %token.token.user.name, "using keystone user id as identity");
            token.token.user.id
        } else {
            username.to_string()
        };

        let identity = ExternalIdentity::new(&self.provider_name, provider_user_name)
            .with_extra(EXTRA_PREFERRED_USERNAME, username);
        Ok(Some(self.mapper.user_for(&identity).await?))
    }
}
