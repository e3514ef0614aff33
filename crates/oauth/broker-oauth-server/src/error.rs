use broker_auth_core::AuthError;
use thiserror::Error;

/// Errors of the grant store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Authorization for {0} already exists")]
    AlreadyExists(String),

    #[error("Authorization for {0} was modified concurrently")]
    Conflict(String),

    #[error("Authorization store failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_race(&self) -> bool {
        matches!(self, StoreError::AlreadyExists(_) | StoreError::Conflict(_))
    }
}

impl From<StoreError> for AuthError {
    fn from(err: StoreError) -> Self {
        AuthError::Infrastructure(err.to_string())
    }
}

/// Errors of the token endpoint, rendered as RFC 6749 error responses.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OAuthServerError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Client authentication failed")]
    InvalidClient,

    #[error("Invalid grant: {0}")]
    InvalidGrant(String),

    #[error("Unsupported grant type: {0}")]
    UnsupportedGrantType(String),

    #[error("Server error: {0}")]
    ServerError(String),
}

impl OAuthServerError {
    /// The `error` field of the JSON error response.
    pub fn code(&self) -> &'static str {
        match self {
            OAuthServerError::InvalidRequest(_) => "invalid_request",
            OAuthServerError::InvalidClient => "invalid_client",
            OAuthServerError::InvalidGrant(_) => "invalid_grant",
            OAuthServerError::UnsupportedGrantType(_) => "unsupported_grant_type",
            OAuthServerError::ServerError(_) => "server_error",
        }
    }

    pub fn status(&self) -> http::StatusCode {
        match self {
            OAuthServerError::InvalidClient => http::StatusCode::UNAUTHORIZED,
            OAuthServerError::ServerError(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
            _ => http::StatusCode::BAD_REQUEST,
        }
    }
}
