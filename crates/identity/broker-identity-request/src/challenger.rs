use broker_auth_core::{AuthError, AuthenticationChallenger};
use http::header::{HeaderMap, HeaderValue, WWW_AUTHENTICATE};

/// Asks non-browser clients for Basic credentials.
#[derive(Debug, Clone)]
pub struct BasicAuthChallenger {
    realm: String,
}

impl BasicAuthChallenger {
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
        }
    }
}

impl AuthenticationChallenger for BasicAuthChallenger {
    fn authentication_challenge(&self, _request: &HeaderMap) -> Result<HeaderMap, AuthError> {
        let value = HeaderValue::from_str(&format!("Basic realm=\"{}\"", self.realm))
            .map_err(|_| AuthError::Protocol(format!("invalid realm {:?}", self.realm)))?;

        let mut headers = HeaderMap::new();
        headers.insert(WWW_AUTHENTICATE, value);
        Ok(headers)
    }
}
