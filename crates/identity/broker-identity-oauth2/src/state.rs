//! The opaque `state` round-tripped through the identity provider.

use crate::csrf::CsrfTokens;
use crate::error::OAuth2Error;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use broker_auth_core::{AuthError, FlowResponse};
use http::HeaderMap;
use std::sync::Arc;
use url::form_urlencoded;

const CSRF_KEY: &str = "csrf";
const THEN_KEY: &str = "then";

/// Decoded contents of a state parameter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OAuthState {
    pub csrf: String,
    pub then: String,
}

impl OAuthState {
    /// `base64url(form_urlencode({csrf, then}))`
    pub fn encode(&self) -> String {
        let form = form_urlencoded::Serializer::new(String::new())
            .append_pair(CSRF_KEY, &self.csrf)
            .append_pair(THEN_KEY, &self.then)
            .finish();
        URL_SAFE_NO_PAD.encode(form)
    }

    pub fn decode(state: &str) -> Result<Self, OAuth2Error> {
        let bytes = URL_SAFE_NO_PAD
            .decode(state.trim_end_matches('='))
            .map_err(|e| OAuth2Error::InvalidState(format!("undecodable state: {e}")))?;

        let mut decoded = Self::default();
        for (key, value) in form_urlencoded::parse(&bytes) {
            match key.as_ref() {
                CSRF_KEY => decoded.csrf = value.into_owned(),
                THEN_KEY => decoded.then = value.into_owned(),
                _ => {}
            }
        }
        Ok(decoded)
    }
}

/// Creates states bound to the browser's CSRF token and verifies them on
/// the way back.
#[derive(Clone)]
pub struct StateHandler {
    csrf: Arc<dyn CsrfTokens>,
}

impl StateHandler {
    pub fn new(csrf: Arc<dyn CsrfTokens>) -> Self {
        Self { csrf }
    }

    pub fn generate(
        &self,
        then: &str,
        request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<String, AuthError> {
        let csrf = self.csrf.generate(request, response)?;
        Ok(OAuthState {
            csrf,
            then: then.to_string(),
        }
        .encode())
    }

    /// Verifies `state` and returns its redirect target.
    pub fn check(&self, state: &str, request: &HeaderMap) -> Result<String, OAuth2Error> {
        let decoded = OAuthState::decode(state)?;
        if !self.csrf.check(request, &decoded.csrf) {
            return Err(OAuth2Error::InvalidState("csrf token mismatch".to_string()));
        }
        if decoded.then.is_empty() {
            return Err(OAuth2Error::InvalidState(
                "state carries no redirect target".to_string(),
            ));
        }
        Ok(decoded.then)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csrf::{CookieCsrf, DEFAULT_CSRF_COOKIE};
    use broker_auth_core::new_flow_response;
    use http::header::{COOKIE, HeaderValue};

    fn handler() -> StateHandler {
        StateHandler::new(Arc::new(CookieCsrf::new(DEFAULT_CSRF_COOKIE, false)))
    }

    fn browser(csrf: &str) -> HeaderMap {
        let mut request = HeaderMap::new();
        request.insert(COOKIE, HeaderValue::from_str(&format!("csrf={csrf}")).unwrap());
        request
    }

    #[test]
    fn test_state_survives_special_characters() {
        let state = OAuthState {
            csrf: "a+b/c=".to_string(),
            then: "/oauth/authorize?client_id=x&scope=a b".to_string(),
        };
        assert_eq!(OAuthState::decode(&state.encode()).unwrap(), state);
    }

    #[test]
    fn test_valid_state_yields_then() {
        let request = browser("token-1");
        let mut response = new_flow_response();
        let state = handler()
            .generate("/oauth/authorize?x=1", &request, &mut response)
            .unwrap();

        assert_eq!(
            handler().check(&state, &request).unwrap(),
            "/oauth/authorize?x=1"
        );
    }

    #[test]
    fn test_altered_csrf_is_rejected() {
        let forged = OAuthState {
            csrf: "token-2".to_string(),
            then: "/".to_string(),
        }
        .encode();
        let err = handler().check(&forged, &browser("token-1")).unwrap_err();
        assert!(matches!(err, OAuth2Error::InvalidState(_)));
    }

    #[test]
    fn test_missing_then_or_garbage_is_rejected() {
        let no_then = OAuthState {
            csrf: "token-1".to_string(),
            then: String::new(),
        }
        .encode();
        assert!(handler().check(&no_then, &browser("token-1")).is_err());
        assert!(handler().check("%%%", &browser("token-1")).is_err());
    }
}
