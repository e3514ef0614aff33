use async_trait::async_trait;
use broker_auth_core::{AuthError, AuthOutcome, RequestAuthenticator, TokenAuthenticator};
use http::HeaderMap;
use http::header::AUTHORIZATION;
use std::sync::Arc;

/// Authenticates `Authorization: Bearer <token>` with a token authenticator.
///
/// The scheme is matched case-insensitively and must be followed by exactly
/// one space. Any other header shape does not apply. A well-formed bearer
/// token that the token authenticator does not recognise is rejected.
pub struct BearerTokenAuthenticator {
    tokens: Arc<dyn TokenAuthenticator>,
}

impl BearerTokenAuthenticator {
    pub fn new(tokens: Arc<dyn TokenAuthenticator>) -> Self {
        Self { tokens }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let mut parts = value.splitn(3, ' ');
    let scheme = parts.next()?;
    let token = parts.next()?;
    if !scheme.eq_ignore_ascii_case("bearer") || token.is_empty() {
        return None;
    }
    Some(token)
}

#[async_trait]
impl RequestAuthenticator for BearerTokenAuthenticator {
    async fn authenticate_request(&self, headers: &HeaderMap) -> AuthOutcome {
        let Some(token) = bearer_token(headers) else {
            return Ok(None);
        };

        match self.tokens.authenticate_token(token).await? {
            Some(user) => Ok(Some(user)),
            None => Err(AuthError::Unauthorized("invalid bearer token".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_auth_core::User;
    use http::HeaderValue;

    struct Known;

    #[async_trait]
    impl TokenAuthenticator for Known {
        async fn authenticate_token(&self, token: &str) -> AuthOutcome {
            Ok((token == "good-token").then(|| User::new("svc", "svc-uid")))
        }
    }

    fn request(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[tokio::test]
    async fn test_bearer_token_is_validated() {
        let auth = BearerTokenAuthenticator::new(Arc::new(Known));

        let user = auth
            .authenticate_request(&request("bearer good-token"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.name, "svc");

        let err = auth
            .authenticate_request(&request("Bearer bad-token"))
            .await
            .unwrap_err();
        assert!(err.is_auth_class());
    }

    #[tokio::test]
    async fn test_other_shapes_do_not_apply() {
        let auth = BearerTokenAuthenticator::new(Arc::new(Known));

        for value in ["Basic abc", "Bearer", "Bearer  good-token", "Bearergood-token"] {
            assert_eq!(
                auth.authenticate_request(&request(value)).await,
                Ok(None),
                "{value}"
            );
        }
        assert_eq!(auth.authenticate_request(&HeaderMap::new()).await, Ok(None));
    }
}
