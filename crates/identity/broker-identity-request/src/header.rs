use async_trait::async_trait;
use broker_auth_core::{AuthOutcome, RequestAuthenticator};
use broker_identity_core::{
    EXTRA_EMAIL, EXTRA_NAME, EXTRA_PREFERRED_USERNAME, ExternalIdentity, IdentityMapper,
};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Which headers a trusted front proxy sets.
///
/// Header names are matched case-insensitively. Within each list the first
/// header carrying a non-empty value wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeaderConfig {
    #[serde(default = "default_id_headers")]
    pub id_headers: Vec<String>,
    #[serde(default)]
    pub preferred_username_headers: Vec<String>,
    #[serde(default)]
    pub name_headers: Vec<String>,
    #[serde(default)]
    pub email_headers: Vec<String>,
}

fn default_id_headers() -> Vec<String> {
    vec!["X-Remote-User".to_string()]
}

impl Default for RequestHeaderConfig {
    fn default() -> Self {
        Self {
            id_headers: default_id_headers(),
            preferred_username_headers: Vec::new(),
            name_headers: Vec::new(),
            email_headers: Vec::new(),
        }
    }
}

fn first_header_value<'a>(headers: &'a HeaderMap, names: &[String]) -> Option<&'a str> {
    names.iter().find_map(|name| {
        headers
            .get_all(name.as_str())
            .iter()
            .filter_map(|value| value.to_str().ok())
            .map(str::trim)
            .find(|value| !value.is_empty())
    })
}

/// Trusts identity headers set by an authenticating proxy in front of the
/// broker.
pub struct RequestHeaderAuthenticator {
    provider_name: String,
    config: RequestHeaderConfig,
    mapper: Arc<dyn IdentityMapper>,
}

impl RequestHeaderAuthenticator {
    pub fn new(
        provider_name: impl Into<String>,
        config: RequestHeaderConfig,
        mapper: Arc<dyn IdentityMapper>,
    ) -> Self {
        Self {
            provider_name: provider_name.into(),
            config,
            mapper,
        }
    }
}

#[async_trait]
impl RequestAuthenticator for RequestHeaderAuthenticator {
    async fn authenticate_request(&self, headers: &HeaderMap) -> AuthOutcome {
        let Some(id) = first_header_value(headers, &self.config.id_headers) else {
            return Ok(None);
        };

        let mut identity = ExternalIdentity::new(&self.provider_name, id);
        for (key, names) in [
            (EXTRA_PREFERRED_USERNAME, &self.config.preferred_username_headers),
            (EXTRA_NAME, &self.config.name_headers),
            (EXTRA_EMAIL, &self.config.email_headers),
        ] {
            if let Some(value) = first_header_value(headers, names) {
                identity = identity.with_extra(key, value);
            }
        }

        debug!(
            provider = %self.provider_name,
            identity = %identity.key(),
            "request header identity"
        );
        let user = self.mapper.user_for(&identity).await?;
        Ok(Some(user))
    }
}
