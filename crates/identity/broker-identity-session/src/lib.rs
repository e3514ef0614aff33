//! Cookie backed sessions signed as JWTs.
//!
//! The session only has to outlive the redirects of one authorize exchange,
//! so it is short lived and holds nothing but the user's name and uid.

use async_trait::async_trait;
use broker_auth_core::cookie::{SetCookie, request_cookie};
use broker_auth_core::{
    AuthError, AuthOutcome, AuthenticationSuccessHandler, FlowResponse, RequestAuthenticator, User,
};
use chrono::Utc;
use http::HeaderMap;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_COOKIE_NAME: &str = "ssn";
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(300);
pub const MIN_SECRET_LEN: usize = 32;

const USER_NAME_KEY: &str = "user.name";
const USER_UID_KEY: &str = "user.uid";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("JWT error: {0}")]
    JwtError(#[from] jsonwebtoken::errors::Error),

    #[error("Session secret must be at least {MIN_SECRET_LEN} bytes, got {0}")]
    SecretTooShort(usize),

    #[error("Session max age {0:?} is out of range")]
    InvalidMaxAge(Duration),

    #[error("Invalid session cookie: {0}")]
    InvalidCookie(String),
}

impl From<SessionError> for AuthError {
    fn from(err: SessionError) -> Self {
        AuthError::Infrastructure(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub cookie_name: String,
    pub secret: String,
    pub max_age: Duration,
    /// Mark the cookie `Secure`; set when the broker is served over https.
    pub secure: bool,
}

impl SessionConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            cookie_name: DEFAULT_COOKIE_NAME.to_string(),
            secret: secret.into(),
            max_age: DEFAULT_MAX_AGE,
            secure: false,
        }
    }
}

/// String values kept in one browser session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    values: BTreeMap<String, String>,
}

impl Session {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionClaims {
    values: BTreeMap<String, String>,
    iat: i64,
    exp: i64,
}

/// Reads and writes [`Session`]s as HS256 signed cookies.
pub struct SessionStore {
    cookie_name: String,
    max_age: Duration,
    ttl: chrono::Duration,
    secure: bool,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Result<Self, SessionError> {
        if config.secret.len() < MIN_SECRET_LEN {
            return Err(SessionError::SecretTooShort(config.secret.len()));
        }
        let ttl = chrono::Duration::from_std(config.max_age)
            .map_err(|_| SessionError::InvalidMaxAge(config.max_age))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        Ok(Self {
            cookie_name: config.cookie_name,
            max_age: config.max_age,
            ttl,
            secure: config.secure,
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            validation,
        })
    }

    /// The session carried by `request`. A missing, expired or forged cookie
    /// yields an empty session.
    pub fn get(&self, request: &HeaderMap) -> Session {
        let Some(cookie) = request_cookie(request, &self.cookie_name) else {
            return Session::default();
        };

        match decode::<SessionClaims>(&cookie, &self.decoding_key, &self.validation) {
            Ok(data) => Session {
                values: data.claims.values,
            },
            Err(e) => {
                debug!(error = %e, "ignoring unusable session cookie");
                Session::default()
            }
        }
    }

    /// Writes `session` into a `Set-Cookie` header of `response`.
    pub fn put(&self, response: &mut HeaderMap, session: &Session) -> Result<(), SessionError> {
        let now = Utc::now();
        let claims = SessionClaims {
            values: session.values.clone(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)?;

        SetCookie::new(&self.cookie_name, token)
            .max_age(self.max_age)
            .secure(self.secure)
            .append_to(response)
            .map_err(|e| SessionError::InvalidCookie(e.to_string()))
    }
}

/// Remembers the logged-in user in the session.
///
/// Registered both as a request authenticator and as a success handler, so
/// a login made during the authorize flow is picked up when the browser comes
/// back to `/oauth/authorize`.
#[derive(Clone)]
pub struct SessionAuthenticator {
    store: Arc<SessionStore>,
}

impl SessionAuthenticator {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    /// Removes the user from the session.
    pub fn invalidate_authentication(
        &self,
        request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<(), SessionError> {
        let mut session = self.store.get(request);
        session.remove(USER_NAME_KEY);
        session.remove(USER_UID_KEY);
        self.store.put(response.headers_mut(), &session)
    }
}

#[async_trait]
impl RequestAuthenticator for SessionAuthenticator {
    async fn authenticate_request(&self, headers: &HeaderMap) -> AuthOutcome {
        let session = self.store.get(headers);
        let (Some(name), Some(uid)) = (session.get(USER_NAME_KEY), session.get(USER_UID_KEY)) else {
            return Ok(None);
        };
        if name.is_empty() {
            return Ok(None);
        }
        Ok(Some(User::new(name, uid)))
    }
}

#[async_trait]
impl AuthenticationSuccessHandler for SessionAuthenticator {
    async fn authentication_succeeded(
        &self,
        user: &User,
        _then: &str,
        request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<bool, AuthError> {
        let mut session = self.store.get(request);
        session.set(USER_NAME_KEY, &user.name);
        session.set(USER_UID_KEY, &user.uid);
        self.store.put(response.headers_mut(), &session)?;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_auth_core::new_flow_response;
    use http::header::{COOKIE, HeaderValue, SET_COOKIE};

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn store() -> Arc<SessionStore> {
        Arc::new(SessionStore::new(SessionConfig::new(SECRET)).unwrap())
    }

    /// Turns the `Set-Cookie` of a response into the `Cookie` of the next request.
    fn follow(response: &FlowResponse) -> HeaderMap {
        let set_cookie = response.headers()[SET_COOKIE].to_str().unwrap();
        let pair = set_cookie.split(';').next().unwrap();
        let mut request = HeaderMap::new();
        request.insert(COOKIE, HeaderValue::from_str(pair).unwrap());
        request
    }

    #[test]
    fn test_short_secret_is_rejected() {
        assert!(matches!(
            SessionStore::new(SessionConfig::new("too-short")),
            Err(SessionError::SecretTooShort(9))
        ));
    }

    #[tokio::test]
    async fn test_login_is_remembered() {
        let auth = SessionAuthenticator::new(store());
        let user = User::new("alice", "uid-1");

        let mut response = new_flow_response();
        let handled = auth
            .authentication_succeeded(&user, "/then", &HeaderMap::new(), &mut response)
            .await
            .unwrap();
        assert!(!handled);

        let set_cookie = response.headers()[SET_COOKIE].to_str().unwrap();
        assert!(set_cookie.starts_with("ssn="));
        assert!(set_cookie.contains("Max-Age=300"));

        let remembered = auth
            .authenticate_request(&follow(&response))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(remembered, user);
    }

    #[tokio::test]
    async fn test_invalidation_forgets_user() {
        let auth = SessionAuthenticator::new(store());
        let mut response = new_flow_response();
        let alice = User::new("alice", "uid-1");
        auth.authentication_succeeded(&alice, "/", &HeaderMap::new(), &mut response)
            .await
            .unwrap();

        let mut cleared = new_flow_response();
        auth.invalidate_authentication(&follow(&response), &mut cleared)
            .unwrap();

        assert_eq!(auth.authenticate_request(&follow(&cleared)).await, Ok(None));
    }

    #[tokio::test]
    async fn test_forged_or_missing_cookie_is_no_session() {
        let auth = SessionAuthenticator::new(store());
        assert_eq!(auth.authenticate_request(&HeaderMap::new()).await, Ok(None));

        let other =
            SessionStore::new(SessionConfig::new("another-secret-that-is-long-enough!")).unwrap();
        let mut session = Session::default();
        session.set(USER_NAME_KEY, "mallory");
        session.set(USER_UID_KEY, "uid-x");
        let mut response = new_flow_response();
        other.put(response.headers_mut(), &session).unwrap();

        assert_eq!(auth.authenticate_request(&follow(&response)).await, Ok(None));

        let mut garbage = HeaderMap::new();
        garbage.insert(COOKIE, HeaderValue::from_static("ssn=not-a-jwt"));
        assert_eq!(auth.authenticate_request(&garbage).await, Ok(None));
    }

    #[tokio::test]
    async fn test_expired_session_is_empty() {
        let mut config = SessionConfig::new(SECRET);
        config.max_age = Duration::ZERO;
        let store = SessionStore::new(config).unwrap();

        let mut session = Session::default();
        session.set(USER_NAME_KEY, "alice");
        session.set(USER_UID_KEY, "uid-1");
        let mut response = new_flow_response();
        store.put(response.headers_mut(), &session).unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(store.get(&follow(&response)).is_empty());
    }

    #[tokio::test]
    async fn test_empty_name_is_not_authenticated() {
        let store = store();
        let mut session = Session::default();
        session.set(USER_NAME_KEY, "");
        session.set(USER_UID_KEY, "uid-1");
        let mut response = new_flow_response();
        store.put(response.headers_mut(), &session).unwrap();

        let auth = SessionAuthenticator::new(store);
        assert_eq!(auth.authenticate_request(&follow(&response)).await, Ok(None));
    }
}
