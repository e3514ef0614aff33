use crate::{HttpClientConfig, RemoteError, build_http_client};
use async_trait::async_trait;
use broker_auth_core::{AuthError, AuthOutcome, PasswordAuthenticator};
use broker_identity_core::{
    EXTRA_EMAIL, EXTRA_NAME, EXTRA_PREFERRED_USERNAME, ExternalIdentity, IdentityMapper,
};
use reqwest::{Client, StatusCode, header::ACCEPT};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

/// Body returned by the remote endpoint for a successful login.
#[derive(Debug, Default, Deserialize)]
struct RemoteUserData {
    #[serde(default)]
    sub: Option<Value>,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    name: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    preferred_username: String,
}

impl RemoteUserData {
    /// `sub`, falling back to `id`; numeric ids are accepted.
    fn subject(&self) -> String {
        [&self.sub, &self.id]
            .into_iter()
            .flatten()
            .map(|value| match value {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                _ => String::new(),
            })
            .find(|subject| !subject.is_empty())
            .unwrap_or_default()
    }
}

/// Body returned by the remote endpoint to report a failure. An empty
/// `error` does not count.
#[derive(Debug, Deserialize)]
struct RemoteErrorBody {
    #[serde(default)]
    error: Option<String>,
}

/// Checks credentials by replaying them as HTTP Basic auth against a remote
/// URL.
///
/// A `401` means the credentials are wrong. Any other non-success status, or
/// a JSON body with a non-empty `error` field, is a failure of the remote.
pub struct BasicAuthPasswordAuthenticator {
    provider_name: String,
    url: Url,
    client: Client,
    mapper: Arc<dyn IdentityMapper>,
}

impl BasicAuthPasswordAuthenticator {
    pub fn new(
        provider_name: impl Into<String>,
        url: &str,
        http: &HttpClientConfig,
        mapper: Arc<dyn IdentityMapper>,
    ) -> Result<Self, RemoteError> {
        let url = Url::parse(url).map_err(|e| RemoteError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            provider_name: provider_name.into(),
            url,
            client: build_http_client(http)?,
            mapper,
        })
    }
}

#[async_trait]
impl PasswordAuthenticator for BasicAuthPasswordAuthenticator {
    async fn authenticate_password(&self, username: &str, password: &str) -> AuthOutcome {
        let response = self
            .client
            .get(self.url.clone())
            .basic_auth(username, Some(password))
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| {
                warn!(provider = %self.provider_name, error = %e, "basic-auth backend unreachable");
                AuthError::Infrastructure(e.to_string())
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            debug!(provider = %self.provider_name, "basic-auth backend rejected credentials");
            return Ok(None);
        }

        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Infrastructure(e.to_string()))?;

        if let Ok(RemoteErrorBody { error: Some(error) }) = serde_json::from_str(&body)
            && !error.is_empty()
        {
            return Err(AuthError::Unauthorized(error));
        }
        if !status.is_success() {
            warn!(provider = %self.provider_name, %status, "basic-auth backend failed");
            return Err(AuthError::Infrastructure(format!(
                "unexpected response from {}: {status}",
                self.url
            )));
        }

        let data: RemoteUserData = serde_json::from_str(&body)
            .map_err(|e| AuthError::Protocol(format!("invalid user data: {e}")))?;
        let subject = data.subject();
        if subject.is_empty() {
            return Err(AuthError::Protocol(
                "user data did not contain a subject".to_string(),
            ));
        }

        let identity = ExternalIdentity::new(&self.provider_name, subject)
            .with_extra(EXTRA_NAME, data.name)
            .with_extra(EXTRA_EMAIL, data.email)
            .with_extra(EXTRA_PREFERRED_USERNAME, data.preferred_username);
        Ok(Some(self.mapper.user_for(&identity).await?))
    }
}
