use async_trait::async_trait;
use broker_auth_core::{AuthOutcome, PasswordAuthenticator};

/// Rejects every login by declining to recognise it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyPasswordAuthenticator;

#[async_trait]
impl PasswordAuthenticator for DenyPasswordAuthenticator {
    async fn authenticate_password(&self, _username: &str, _password: &str) -> AuthOutcome {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_denies_everyone() {
        let outcome = DenyPasswordAuthenticator
            .authenticate_password("admin", "admin")
            .await;
        assert_eq!(outcome, Ok(None));
    }
}
