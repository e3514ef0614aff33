use crate::client::OAuth2Client;
use crate::provider::ExternalProvider;
use async_trait::async_trait;
use broker_auth_core::{AuthOutcome, PasswordAuthenticator};
use broker_identity_core::IdentityMapper;
use std::sync::Arc;
use tracing::debug;

/// Checks passwords with the provider's resource owner password grant, for
/// clients that cannot follow a browser redirect.
pub struct OAuthPasswordAuthenticator {
    provider: Arc<dyn ExternalProvider>,
    client: OAuth2Client,
    mapper: Arc<dyn IdentityMapper>,
}

impl OAuthPasswordAuthenticator {
    pub fn new(
        provider: Arc<dyn ExternalProvider>,
        client: OAuth2Client,
        mapper: Arc<dyn IdentityMapper>,
    ) -> Self {
        Self {
            provider,
            client,
            mapper,
        }
    }
}

#[async_trait]
impl PasswordAuthenticator for OAuthPasswordAuthenticator {
    async fn authenticate_password(&self, username: &str, password: &str) -> AuthOutcome {
        if username.is_empty() || password.is_empty() {
            return Ok(None);
        }

        let Some(tokens) = self
            .client
            .password_grant(self.provider.as_ref(), username, password)
            .await?
        else {
            return Ok(None);
        };

        let identity = self.provider.get_user_identity(&tokens).await?;
        debug!(
            provider = self.provider.name(),
            identity = %identity.key(),
            "password grant succeeded"
        );
        Ok(Some(self.mapper.user_for(&identity).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::openid::OpenIdProvider;
    use crate::openid::tests::{config, id_token};
    use broker_identity_core::{InMemoryUserRegistry, MappingMethod, RegistryIdentityMapper};
    use reqwest::Client;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn authenticator(server: &MockServer) -> OAuthPasswordAuthenticator {
        let client = OAuth2Client::new(Client::new());
        let provider = OpenIdProvider::new("corp", config(&server.uri(), false), client.clone())
            .unwrap();
        let mapper = RegistryIdentityMapper::new(
            Arc::new(InMemoryUserRegistry::new()),
            MappingMethod::Claim,
        );
        OAuthPasswordAuthenticator::new(Arc::new(provider), client, Arc::new(mapper))
    }

    #[tokio::test]
    async fn test_password_grant_login() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("username=alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at",
                "id_token": id_token(serde_json::json!({
                    "sub": "a-1",
                    "preferred_username": "alice"
                }))
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(serde_json::json!({"error": "invalid_grant"})),
            )
            .mount(&server)
            .await;

        let auth = authenticator(&server).await;
        let user = auth
            .authenticate_password("alice", "secret")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.name, "alice");

        assert_eq!(auth.authenticate_password("bob", "wrong").await, Ok(None));
        assert_eq!(auth.authenticate_password("alice", "").await, Ok(None));
    }

    #[tokio::test]
    async fn test_provider_failure_is_infrastructure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = authenticator(&server)
            .await
            .authenticate_password("alice", "secret")
            .await
            .unwrap_err();
        assert!(matches!(err, broker_auth_core::AuthError::Infrastructure(_)));
    }
}
