use async_trait::async_trait;
use broker_auth_core::{AuthOutcome, PasswordAuthenticator};
use broker_identity_core::{ExternalIdentity, IdentityMapper};
use std::sync::Arc;
use tracing::debug;

/// Accepts any non-empty user name and password.
///
/// The user name becomes the provider user name of an identity that is then
/// mapped like any other. Meant for development clusters only.
pub struct AllowAnyPasswordAuthenticator {
    provider_name: String,
    mapper: Arc<dyn IdentityMapper>,
}

impl AllowAnyPasswordAuthenticator {
    pub fn new(provider_name: impl Into<String>, mapper: Arc<dyn IdentityMapper>) -> Self {
        Self {
            provider_name: provider_name.into(),
            mapper,
        }
    }
}

#[async_trait]
impl PasswordAuthenticator for AllowAnyPasswordAuthenticator {
    async fn authenticate_password(&self, username: &str, password: &str) -> AuthOutcome {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Ok(None);
        }

        debug!(
            provider = %self.provider_name,
            user = %username,
            "accepting password without verification"
        );
        let identity = ExternalIdentity::new(&self.provider_name, username);
        let user = self.mapper.user_for(&identity).await?;
        Ok(Some(user))
    }
}
