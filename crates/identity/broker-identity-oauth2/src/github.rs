use crate::client::OAuth2Client;
use crate::error::{OAuth2Error, OAuth2Result};
use crate::provider::{AuthorizeConfig, ExternalProvider};
use crate::types::TokenResponse;
use async_trait::async_trait;
use broker_identity_core::{
    EXTRA_EMAIL, EXTRA_NAME, EXTRA_PREFERRED_USERNAME, ExternalIdentity,
};
use serde::Deserialize;
use tracing::debug;

pub const GITHUB_AUTHORIZE_URL: &str = "https://github.com/login/oauth/authorize";
pub const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
pub const GITHUB_API_URL: &str = "https://api.github.com";

#[derive(Debug, Deserialize)]
struct GitHubUser {
    id: u64,
    #[serde(default)]
    login: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GitHubOrg {
    login: String,
}

/// GitHub accounts, optionally limited to members of some organizations.
pub struct GitHubProvider {
    name: String,
    config: AuthorizeConfig,
    api_url: String,
    organizations: Vec<String>,
    client: OAuth2Client,
}

impl GitHubProvider {
    pub fn new(
        name: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        organizations: Vec<String>,
        client: OAuth2Client,
    ) -> Self {
        let mut scopes = vec!["user:email".to_string()];
        if !organizations.is_empty() {
            scopes.push("read:org".to_string());
        }

        Self {
            name: name.into(),
            config: AuthorizeConfig {
                client_id: client_id.into(),
                client_secret: client_secret.into(),
                authorize_url: GITHUB_AUTHORIZE_URL.to_string(),
                token_url: GITHUB_TOKEN_URL.to_string(),
                scopes,
            },
            api_url: GITHUB_API_URL.to_string(),
            organizations,
            client,
        }
    }

    /// Points the provider at a GitHub Enterprise installation.
    pub fn with_endpoints(
        mut self,
        authorize_url: impl Into<String>,
        token_url: impl Into<String>,
        api_url: impl Into<String>,
    ) -> Self {
        self.config.authorize_url = authorize_url.into();
        self.config.token_url = token_url.into();
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    async fn check_organizations(&self, access_token: &str, login: &str) -> OAuth2Result<()> {
        if self.organizations.is_empty() {
            return Ok(());
        }

        let orgs = self
            .client
            .get_json(&format!("{}/user/orgs", self.api_url), access_token)
            .await?;
        let orgs: Vec<GitHubOrg> = serde_json::from_value(orgs)
            .map_err(|e| OAuth2Error::InvalidUserInfoResponse(e.to_string()))?;

        let member = orgs.iter().any(|org| {
            self.organizations
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(&org.login))
        });
        if !member {
            debug!(provider = %self.name, login, "user is in none of the allowed organizations");
            return Err(OAuth2Error::Rejected(format!(
                "{login} is not a member of any of {:?}",
                self.organizations
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ExternalProvider for GitHubProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn authorize_config(&self) -> &AuthorizeConfig {
        &self.config
    }

    async fn get_user_identity(&self, tokens: &TokenResponse) -> OAuth2Result<ExternalIdentity> {
        let user = self
            .client
            .get_json(&format!("{}/user", self.api_url), &tokens.access_token)
            .await?;
        let user: GitHubUser = serde_json::from_value(user)
            .map_err(|e| OAuth2Error::InvalidUserInfoResponse(e.to_string()))?;

        self.check_organizations(&tokens.access_token, &user.login)
            .await?;

        Ok(ExternalIdentity::new(&self.name, user.id.to_string())
            .with_extra(EXTRA_PREFERRED_USERNAME, user.login)
            .with_extra(EXTRA_NAME, user.name.unwrap_or_default())
            .with_extra(EXTRA_EMAIL, user.email.unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::Client;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer, orgs: &[&str]) -> GitHubProvider {
        GitHubProvider::new(
            "github",
            "client",
            "secret",
            orgs.iter().map(|o| o.to_string()).collect(),
            OAuth2Client::new(Client::new()),
        )
        .with_endpoints(
            format!("{}/login/oauth/authorize", server.uri()),
            format!("{}/login/oauth/access_token", server.uri()),
            server.uri(),
        )
    }

    fn tokens() -> TokenResponse {
        TokenResponse {
            access_token: "gho_token".to_string(),
            ..TokenResponse::default()
        }
    }

    async fn mount_user(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/user"))
            .and(header("authorization", "Bearer gho_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": 583231,
                "login": "octocat",
                "name": "The Octocat",
                "email": null
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_numeric_id_is_the_identity() {
        let server = MockServer::start().await;
        mount_user(&server).await;

        let identity = provider(&server, &[]).get_user_identity(&tokens()).await.unwrap();
        assert_eq!(identity.provider_user_name, "583231");
        assert_eq!(identity.preferred_user_name(), "octocat");
        assert_eq!(identity.display_name(), Some("The Octocat"));
        assert_eq!(identity.email(), None);
    }

    #[tokio::test]
    async fn test_organization_allow_list() {
        let server = MockServer::start().await;
        mount_user(&server).await;
        Mock::given(method("GET"))
            .and(path("/user/orgs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"login": "GitHub"},
                {"login": "rust-lang"}
            ])))
            .mount(&server)
            .await;

        let allowed = provider(&server, &["github"]);
        assert_eq!(allowed.authorize_config().scopes, vec!["user:email", "read:org"]);
        assert!(allowed.get_user_identity(&tokens()).await.is_ok());

        let err = provider(&server, &["other-org"])
            .get_user_identity(&tokens())
            .await
            .unwrap_err();
        assert!(matches!(err, OAuth2Error::Rejected(_)));
    }
}
