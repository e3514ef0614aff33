//! OAuth2 client for the authorization code and password grants.

use crate::claims::Claims;
use crate::error::{OAuth2Error, OAuth2Result};
use crate::provider::ExternalProvider;
use crate::types::{TokenErrorResponse, TokenResponse};
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode};
use tracing::{debug, error};
use url::Url;

const BROKER_USER_AGENT: &str = concat!("identity-broker/", env!("CARGO_PKG_VERSION"));

/// Talks to provider token and userinfo endpoints.
#[derive(Clone)]
pub struct OAuth2Client {
    http_client: Client,
}

impl OAuth2Client {
    /// `http_client` carries the timeout that bounds every provider call.
    pub fn new(http_client: Client) -> Self {
        Self { http_client }
    }

    /// Builds the URL the browser is sent to.
    pub fn authorization_url(
        &self,
        provider: &dyn ExternalProvider,
        redirect_uri: &str,
        state: &str,
    ) -> OAuth2Result<String> {
        let config = provider.authorize_config();
        let mut url = Url::parse(&config.authorize_url)?;

        let mut custom = Vec::new();
        provider.add_custom_parameters(&mut custom);

        {
            let mut params = url.query_pairs_mut();
            params.append_pair("response_type", "code");
            params.append_pair("client_id", &config.client_id);
            params.append_pair("redirect_uri", redirect_uri);
            if !config.scopes.is_empty() {
                params.append_pair("scope", &config.scopes.join(" "));
            }
            params.append_pair("state", state);
            for (key, value) in &custom {
                params.append_pair(key, value);
            }
        }

        debug!(provider = provider.name(), "generated authorization URL");
        Ok(url.to_string())
    }

    /// Exchanges an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        provider: &dyn ExternalProvider,
        code: &str,
        redirect_uri: &str,
    ) -> OAuth2Result<TokenResponse> {
        let config = provider.authorize_config();
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
        ];

        let response = self
            .http_client
            .post(&config.token_url)
            .header(ACCEPT, "application/json")
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(provider = provider.name(), %status, "token exchange failed");
            return Err(OAuth2Error::TokenExchangeFailed {
                status: status.as_u16(),
                body,
            });
        }

        let tokens = parse_token_response(&response.text().await?)?;
        debug!(provider = provider.name(), "exchanged code for tokens");
        Ok(tokens)
    }

    /// Resource owner password grant.
    ///
    /// Returns `Ok(None)` when the provider answers `invalid_grant`, i.e. the
    /// credentials are wrong.
    pub async fn password_grant(
        &self,
        provider: &dyn ExternalProvider,
        username: &str,
        password: &str,
    ) -> OAuth2Result<Option<TokenResponse>> {
        let config = provider.authorize_config();
        let scope = config.scopes.join(" ");
        let mut params = vec![
            ("grant_type", "password"),
            ("username", username),
            ("password", password),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
        ];
        if !scope.is_empty() {
            params.push(("scope", scope.as_str()));
        }

        let response = self
            .http_client
            .post(&config.token_url)
            .header(ACCEPT, "application/json")
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status == StatusCode::BAD_REQUEST {
            if let Ok(err) = serde_json::from_str::<TokenErrorResponse>(&body) {
                if err.error == "invalid_grant" {
                    debug!(provider = provider.name(), "password grant rejected");
                    return Ok(None);
                }
            }
        }
        if !status.is_success() {
            error!(provider = provider.name(), %status, "password grant failed");
            return Err(OAuth2Error::TokenExchangeFailed {
                status: status.as_u16(),
                body,
            });
        }

        parse_token_response(&body).map(Some)
    }

    /// Fetches a JSON document with the access token as bearer credential.
    pub async fn get_claims(&self, url: &str, access_token: &str) -> OAuth2Result<Claims> {
        let value = self.get_json(url, access_token).await?;
        serde_json::from_value(value)
            .map_err(|e| OAuth2Error::InvalidUserInfoResponse(e.to_string()))
    }

    pub async fn get_json(&self, url: &str, access_token: &str) -> OAuth2Result<serde_json::Value> {
        let response = self
            .http_client
            .get(url)
            .bearer_auth(access_token)
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, BROKER_USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            error!(%url, %status, "user info request failed");
            return Err(OAuth2Error::UserInfoFailed {
                status: status.as_u16(),
            });
        }

        response
            .json()
            .await
            .map_err(|e| OAuth2Error::InvalidUserInfoResponse(e.to_string()))
    }
}

fn parse_token_response(body: &str) -> OAuth2Result<TokenResponse> {
    let tokens: TokenResponse = serde_json::from_str(body)
        .map_err(|e| OAuth2Error::InvalidTokenResponse(e.to_string()))?;
    if tokens.access_token.is_empty() {
        return Err(OAuth2Error::InvalidTokenResponse(
            "empty access_token".to_string(),
        ));
    }
    Ok(tokens)
}
