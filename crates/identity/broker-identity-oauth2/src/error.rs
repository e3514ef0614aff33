//! OAuth2 error types.

use broker_auth_core::AuthError;
use thiserror::Error;

pub type OAuth2Result<T> = Result<T, OAuth2Error>;

#[derive(Debug, Error)]
pub enum OAuth2Error {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("URL parsing error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("Invalid state parameter: {0}")]
    InvalidState(String),

    #[error("Missing authorization code")]
    MissingAuthorizationCode,

    #[error("Identity provider denied access: {0}")]
    AccessDenied(String),

    #[error("Identity provider returned an error: {error}: {description}")]
    CallbackError { error: String, description: String },

    #[error("Token exchange failed with status {status}: {body}")]
    TokenExchangeFailed { status: u16, body: String },

    #[error("Invalid token response: {0}")]
    InvalidTokenResponse(String),

    #[error("User info request failed with status {status}")]
    UserInfoFailed { status: u16 },

    #[error("Invalid user info response: {0}")]
    InvalidUserInfoResponse(String),

    #[error("Token response did not contain an id_token")]
    MissingIdToken,

    #[error("Malformed JWT: {0}")]
    JwtFormat(String),

    #[error("Missing claim: none of {0:?} is present")]
    MissingClaim(Vec<String>),

    #[error("userinfo subject {userinfo:?} does not match id_token subject {id_token:?}")]
    SubjectMismatch { id_token: String, userinfo: String },

    #[error("Identity rejected by provider policy: {0}")]
    Rejected(String),
}

impl From<OAuth2Error> for AuthError {
    fn from(err: OAuth2Error) -> Self {
        let message = err.to_string();
        match err {
            OAuth2Error::HttpError(_)
            | OAuth2Error::ConfigError(_)
            | OAuth2Error::UrlError(_)
            | OAuth2Error::TokenExchangeFailed { .. }
            | OAuth2Error::UserInfoFailed { .. } => AuthError::Infrastructure(message),
            OAuth2Error::InvalidState(_) => AuthError::InvalidState(message),
            OAuth2Error::AccessDenied(_) | OAuth2Error::Rejected(_) => {
                AuthError::Unauthorized(message)
            }
            OAuth2Error::MissingAuthorizationCode
            | OAuth2Error::CallbackError { .. }
            | OAuth2Error::InvalidTokenResponse(_)
            | OAuth2Error::InvalidUserInfoResponse(_)
            | OAuth2Error::MissingIdToken
            | OAuth2Error::JwtFormat(_)
            | OAuth2Error::MissingClaim(_)
            | OAuth2Error::SubjectMismatch { .. } => AuthError::Protocol(message),
        }
    }
}
