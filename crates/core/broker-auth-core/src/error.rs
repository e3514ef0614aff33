use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which part of identity mapping failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MappingFailure {
    /// No mapping exists and the provider is configured for lookup only.
    Lookup,
    /// The target user is already claimed by another identity of the provider.
    Claim,
    /// Persistence failed while mapping.
    Other,
}

/// Errors that can occur during authentication.
///
/// `AuthError` is `Clone` so that cached outcomes can be replayed verbatim.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthError {
    /// The backend explicitly rejected the credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The credentials were valid once but have expired.
    #[error("Token expired")]
    TokenExpired,

    /// A backend could not be reached or answered with something unusable.
    #[error("Authentication backend error: {0}")]
    Infrastructure(String),

    /// A protocol invariant was violated (malformed JWT, subject mismatch, ...).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The anti-forgery state of an external login did not verify.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The request carried credentials that could not be decoded.
    #[error("Malformed credentials: {0}")]
    Malformed(String),

    /// The external identity could not be mapped to a user.
    #[error("{message}")]
    Mapping {
        failure: MappingFailure,
        message: String,
    },

    /// Every member of a union failed.
    #[error("[{}]", join(.0))]
    Aggregate(Vec<AuthError>),
}

fn join(errors: &[AuthError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

impl AuthError {
    /// Whether this error is a definitive answer about the credentials rather
    /// than a transient failure of the machinery checking them.
    ///
    /// Only authentication-class outcomes may be cached.
    pub fn is_auth_class(&self) -> bool {
        match self {
            AuthError::Unauthorized(_) | AuthError::TokenExpired => true,
            AuthError::Aggregate(errors) => {
                !errors.is_empty() && errors.iter().all(AuthError::is_auth_class)
            }
            _ => false,
        }
    }

    /// Machine-readable reason code used when redirecting to an error page.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::Unauthorized(_) => "access_denied",
            AuthError::TokenExpired => "token_expired",
            AuthError::InvalidState(_) => "invalid_state",
            AuthError::Mapping {
                failure: MappingFailure::Lookup,
                ..
            } => "mapping_lookup_error",
            AuthError::Mapping {
                failure: MappingFailure::Claim,
                ..
            } => "mapping_claim_error",
            AuthError::Infrastructure(_) => "server_error",
            AuthError::Aggregate(errors) => {
                let mut reasons = errors.iter().map(AuthError::reason);
                match reasons.next() {
                    Some(first) if reasons.all(|r| r == first) => first,
                    _ => "authentication_error",
                }
            }
            _ => "authentication_error",
        }
    }

    /// Collapse a list of failures into a single error.
    pub fn aggregate(mut errors: Vec<AuthError>) -> Option<AuthError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(AuthError::Aggregate(errors)),
        }
    }
}
