use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use broker_auth_core::{AuthError, AuthOutcome, PasswordAuthenticator, RequestAuthenticator};
use http::HeaderMap;
use http::header::AUTHORIZATION;
use std::sync::Arc;

/// Extracts `(username, password)` from an `Authorization: Basic` header.
///
/// A missing header or another scheme yields `Ok(None)`. A Basic header whose
/// payload is not base64 or has no `:` is an error. The password is
/// everything after the first `:` and may itself contain colons.
pub fn basic_auth_credentials(headers: &HeaderMap) -> Result<Option<(String, String)>, AuthError> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| AuthError::Malformed("authorization header is not ASCII".to_string()))?
        .trim();

    let Some((scheme, payload)) = value.split_once(' ') else {
        return Ok(None);
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return Ok(None);
    }

    let decoded = STANDARD
        .decode(payload.trim())
        .map_err(|e| AuthError::Malformed(format!("invalid basic auth encoding: {e}")))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| AuthError::Malformed("basic auth payload is not UTF-8".to_string()))?;

    match decoded.split_once(':') {
        Some((username, password)) => Ok(Some((username.to_string(), password.to_string()))),
        None => Err(AuthError::Malformed(
            "basic auth payload has no ':' separator".to_string(),
        )),
    }
}

/// Authenticates requests carrying Basic credentials with a password
/// authenticator.
pub struct BasicAuthRequestAuthenticator {
    password: Arc<dyn PasswordAuthenticator>,
}

impl BasicAuthRequestAuthenticator {
    pub fn new(password: Arc<dyn PasswordAuthenticator>) -> Self {
        Self { password }
    }
}

#[async_trait]
impl RequestAuthenticator for BasicAuthRequestAuthenticator {
    async fn authenticate_request(&self, headers: &HeaderMap) -> AuthOutcome {
        match basic_auth_credentials(headers)? {
            Some((username, password)) => {
                self.password
                    .authenticate_password(&username, &password)
                    .await
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_auth_core::User;
    use http::HeaderValue;

    fn with_authorization(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_valid_basic_header() {
        let encoded = STANDARD.encode("frightened_donut:don't eat me!");
        let headers = with_authorization(&format!("Basic {encoded}"));

        let credentials = basic_auth_credentials(&headers).unwrap();
        assert_eq!(
            credentials,
            Some(("frightened_donut".to_string(), "don't eat me!".to_string()))
        );
    }

    #[test]
    fn test_other_schemes_do_not_apply() {
        assert_eq!(
            basic_auth_credentials(&with_authorization("notbasic")).unwrap(),
            None
        );
        assert_eq!(
            basic_auth_credentials(&with_authorization("Bearer abc")).unwrap(),
            None
        );
        assert_eq!(basic_auth_credentials(&HeaderMap::new()).unwrap(), None);
    }

    #[test]
    fn test_invalid_base64_is_an_error() {
        let err = basic_auth_credentials(&with_authorization("Basic !!!not-base64")).unwrap_err();
        assert!(matches!(err, AuthError::Malformed(_)));
    }

    #[test]
    fn test_missing_separator_is_an_error() {
        let encoded = STANDARD.encode("no-separator");
        let err = basic_auth_credentials(&with_authorization(&format!("basic {encoded}")))
            .unwrap_err();
        assert!(matches!(err, AuthError::Malformed(_)));
    }

    #[test]
    fn test_password_may_contain_colons() {
        let encoded = STANDARD.encode("user:pa:ss");
        let credentials = basic_auth_credentials(&with_authorization(&format!("BASIC {encoded}")))
            .unwrap()
            .unwrap();
        assert_eq!(credentials, ("user".to_string(), "pa:ss".to_string()));
    }

    struct OnlyAlice;

    #[async_trait]
    impl PasswordAuthenticator for OnlyAlice {
        async fn authenticate_password(&self, username: &str, password: &str) -> AuthOutcome {
            if username == "alice" && password == "secret" {
                Ok(Some(User::new("alice", "1")))
            } else {
                Ok(None)
            }
        }
    }

    #[tokio::test]
    async fn test_request_delegates_to_password_authenticator() {
        let auth = BasicAuthRequestAuthenticator::new(Arc::new(OnlyAlice));

        let good = with_authorization(&format!("Basic {}", STANDARD.encode("alice:secret")));
        let user = auth.authenticate_request(&good).await.unwrap().unwrap();
        assert_eq!(user.name, "alice");

        let bad = with_authorization(&format!("Basic {}", STANDARD.encode("alice:nope")));
        assert_eq!(auth.authenticate_request(&bad).await, Ok(None));

        assert_eq!(auth.authenticate_request(&HeaderMap::new()).await, Ok(None));
    }
}
