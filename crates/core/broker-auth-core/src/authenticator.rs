use crate::{AuthError, User};
use async_trait::async_trait;
use http::HeaderMap;
use std::sync::Arc;

/// Result of a single authentication attempt.
///
/// `Ok(None)` means the authenticator has no opinion about the request, which
/// lets a [`Union`](crate::Union) fall through to its next member.
pub type AuthOutcome = Result<Option<User>, AuthError>;

/// Validates an opaque token (bearer token, API key, session token, ...).
#[async_trait]
pub trait TokenAuthenticator: Send + Sync {
    async fn authenticate_token(&self, token: &str) -> AuthOutcome;
}

/// Validates a user name and password pair.
#[async_trait]
pub trait PasswordAuthenticator: Send + Sync {
    async fn authenticate_password(&self, username: &str, password: &str) -> AuthOutcome;
}

/// Extracts and validates credentials carried by an HTTP request.
#[async_trait]
pub trait RequestAuthenticator: Send + Sync {
    async fn authenticate_request(&self, headers: &HeaderMap) -> AuthOutcome;
}

#[async_trait]
impl<T: TokenAuthenticator + ?Sized> TokenAuthenticator for Arc<T> {
    async fn authenticate_token(&self, token: &str) -> AuthOutcome {
        (**self).authenticate_token(token).await
    }
}

#[async_trait]
impl<T: PasswordAuthenticator + ?Sized> PasswordAuthenticator for Arc<T> {
    async fn authenticate_password(&self, username: &str, password: &str) -> AuthOutcome {
        (**self).authenticate_password(username, password).await
    }
}

#[async_trait]
impl<T: RequestAuthenticator + ?Sized> RequestAuthenticator for Arc<T> {
    async fn authenticate_request(&self, headers: &HeaderMap) -> AuthOutcome {
        (**self).authenticate_request(headers).await
    }
}
