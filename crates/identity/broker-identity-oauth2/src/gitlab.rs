use crate::client::OAuth2Client;
use crate::error::{OAuth2Error, OAuth2Result};
use crate::provider::{AuthorizeConfig, ExternalProvider};
use crate::types::TokenResponse;
use async_trait::async_trait;
use broker_identity_core::{
    EXTRA_EMAIL, EXTRA_NAME, EXTRA_PREFERRED_USERNAME, ExternalIdentity,
};
use serde::Deserialize;
use url::Url;

#[derive(Debug, Deserialize)]
struct GitLabUser {
    id: u64,
    #[serde(default)]
    username: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    email: String,
}

/// Accounts of a GitLab installation.
pub struct GitLabProvider {
    name: String,
    config: AuthorizeConfig,
    user_url: String,
    client: OAuth2Client,
}

impl GitLabProvider {
    /// `url` is the base URL of the installation, e.g. `https://gitlab.com`.
    pub fn new(
        name: impl Into<String>,
        url: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        client: OAuth2Client,
    ) -> OAuth2Result<Self> {
        let base = Url::parse(url)?;
        let base = base.as_str().trim_end_matches('/');

        Ok(Self {
            name: name.into(),
            config: AuthorizeConfig {
                client_id: client_id.into(),
                client_secret: client_secret.into(),
                authorize_url: format!("{base}/oauth/authorize"),
                token_url: format!("{base}/oauth/token"),
                scopes: vec!["api".to_string()],
            },
            user_url: format!("{base}/api/v3/user"),
            client,
        })
    }
}

#[async_trait]
impl ExternalProvider for GitLabProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn authorize_config(&self) -> &AuthorizeConfig {
        &self.config
    }

    async fn get_user_identity(&self, tokens: &TokenResponse) -> OAuth2Result<ExternalIdentity> {
        let user = self
            .client
            .get_json(&self.user_url, &tokens.access_token)
            .await?;
        let user: GitLabUser = serde_json::from_value(user)
            .map_err(|e| OAuth2Error::InvalidUserInfoResponse(e.to_string()))?;

        Ok(ExternalIdentity::new(&self.name, user.id.to_string())
            .with_extra(EXTRA_PREFERRED_USERNAME, user.username)
            .with_extra(EXTRA_NAME, user.name)
            .with_extra(EXTRA_EMAIL, user.email))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Client;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_endpoints_derive_from_base_url() {
        let gitlab = GitLabProvider::new(
            "gitlab",
            "https://gitlab.example.com/",
            "id",
            "secret",
            OAuth2Client::new(Client::new()),
        )
        .unwrap();
        let config = gitlab.authorize_config();
        assert_eq!(config.authorize_url, "https://gitlab.example.com/oauth/authorize");
        assert_eq!(config.token_url, "https://gitlab.example.com/oauth/token");
    }

    #[tokio::test]
    async fn test_user_document() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v3/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 7,
                "username": "root",
                "name": "Administrator",
                "email": "admin@example.com"
            })))
            .mount(&server)
            .await;

        let gitlab = GitLabProvider::new(
            "gitlab",
            &server.uri(),
            "id",
            "secret",
            OAuth2Client::new(Client::new()),
        )
        .unwrap();
        let identity = gitlab
            .get_user_identity(&TokenResponse {
                access_token: "at".to_string(),
                ..TokenResponse::default()
            })
            .await
            .unwrap();
        assert_eq!(identity.key(), "gitlab:7");
        assert_eq!(identity.preferred_user_name(), "root");
        assert_eq!(identity.email(), Some("admin@example.com"));
    }
}
