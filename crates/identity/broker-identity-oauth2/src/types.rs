//! OAuth2 protocol types.

use serde::{Deserialize, Serialize};
use url::form_urlencoded;

/// Query parameters of the redirect back from the identity provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationResponse {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl AuthorizationResponse {
    /// Parses a raw query string. Unknown parameters are ignored and the first
    /// occurrence of a repeated parameter wins.
    pub fn from_query(query: &str) -> Self {
        let mut response = Self::default();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            let slot = match key.as_ref() {
                "code" => &mut response.code,
                "state" => &mut response.state,
                "error" => &mut response.error,
                "error_description" => &mut response.error_description,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        response
    }
}

/// OAuth2 token response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: String,
    pub expires_in: Option<u64>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub id_token: Option<String>,
}

/// Error body of a failed token request (RFC 6749 section 5.2).
#[derive(Debug, Clone, Deserialize)]
pub struct TokenErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_query_parsing() {
        let response = AuthorizationResponse::from_query("code=abc&state=xyz%3D%3D&code=ignored");
        assert_eq!(response.code.as_deref(), Some("abc"));
        assert_eq!(response.state.as_deref(), Some("xyz=="));
        assert!(response.error.is_none());

        let denied = AuthorizationResponse::from_query("error=access_denied&state=s");
        assert_eq!(denied.error.as_deref(), Some("access_denied"));
        assert!(denied.code.is_none());
    }
}
