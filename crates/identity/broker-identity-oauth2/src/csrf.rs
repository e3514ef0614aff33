use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use broker_auth_core::cookie::{SetCookie, request_cookie};
use broker_auth_core::{AuthError, FlowResponse};
use http::HeaderMap;

pub const DEFAULT_CSRF_COOKIE: &str = "csrf";

/// Issues and checks anti-forgery tokens bound to the browser.
pub trait CsrfTokens: Send + Sync {
    /// Returns the token for this browser, issuing one into `response` if the
    /// request does not carry one yet.
    fn generate(
        &self,
        request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<String, AuthError>;

    fn check(&self, request: &HeaderMap, token: &str) -> bool;
}

/// Keeps the CSRF token in an HttpOnly cookie.
#[derive(Debug, Clone)]
pub struct CookieCsrf {
    name: String,
    secure: bool,
}

impl CookieCsrf {
    /// `secure` should be set when the broker is served over https.
    pub fn new(name: impl Into<String>, secure: bool) -> Self {
        Self {
            name: name.into(),
            secure,
        }
    }
}

fn new_token() -> String {
    URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>())
}

impl CsrfTokens for CookieCsrf {
    fn generate(
        &self,
        request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<String, AuthError> {
        if let Some(existing) = request_cookie(request, &self.name).filter(|v| !v.is_empty()) {
            return Ok(existing);
        }

        let token = new_token();
        SetCookie::new(&self.name, &token)
            .secure(self.secure)
            .append_to(response.headers_mut())
            .map_err(|e| AuthError::Protocol(format!("invalid csrf cookie: {e}")))?;
        Ok(token)
    }

    fn check(&self, request: &HeaderMap, token: &str) -> bool {
        !token.is_empty() && request_cookie(request, &self.name).as_deref() == Some(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_auth_core::new_flow_response;
    use http::header::{COOKIE, HeaderValue, SET_COOKIE};

    #[test]
    fn test_generated_token_round_trips_through_cookie() {
        let csrf = CookieCsrf::new(DEFAULT_CSRF_COOKIE, true);
        let mut response = new_flow_response();

        let token = csrf.generate(&HeaderMap::new(), &mut response).unwrap();
        let set_cookie = response.headers()[SET_COOKIE].to_str().unwrap();
        assert!(set_cookie.starts_with(&format!("csrf={token};")));
        assert!(set_cookie.contains("Secure"));

        let mut request = HeaderMap::new();
        request.insert(COOKIE, HeaderValue::from_str(&format!("csrf={token}")).unwrap());
        assert!(csrf.check(&request, &token));
        assert!(!csrf.check(&request, "forged"));
        assert!(!csrf.check(&HeaderMap::new(), &token));
    }

    #[test]
    fn test_existing_token_is_reused() {
        let csrf = CookieCsrf::new(DEFAULT_CSRF_COOKIE, false);
        let mut request = HeaderMap::new();
        request.insert(COOKIE, HeaderValue::from_static("csrf=abc"));

        let mut response = new_flow_response();
        assert_eq!(csrf.generate(&request, &mut response).unwrap(), "abc");
        assert!(response.headers().get(SET_COOKIE).is_none());
    }
}
