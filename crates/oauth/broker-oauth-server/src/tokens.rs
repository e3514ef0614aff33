//! Authorization codes and access tokens issued by the broker.

use crate::error::OAuthServerError;
use crate::grant::Grant;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use broker_auth_core::{AuthError, AuthOutcome, TokenAuthenticator, User};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const DEFAULT_AUTHORIZE_CODE_MAX_AGE: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_ACCESS_TOKEN_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

fn new_secret() -> String {
    URL_SAFE_NO_PAD.encode(rand::random::<[u8; 32]>())
}

const LONGEST_MAX_AGE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn to_chrono(max_age: Duration) -> chrono::Duration {
    chrono::Duration::from_std(max_age.min(LONGEST_MAX_AGE))
        .unwrap_or_else(|_| chrono::Duration::zero())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizeCode {
    pub code: String,
    pub client_id: String,
    pub redirect_uri: String,
    /// The authorize request named `redirect_uri`, so redeeming the code
    /// must repeat it.
    pub redirect_uri_required: bool,
    pub scopes: Vec<String>,
    pub user: User,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub user: User,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Whole seconds left, for the `expires_in` field.
    pub fn expires_in(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// Process-local store of outstanding codes and tokens.
pub struct TokenStore {
    codes: RwLock<HashMap<String, AuthorizeCode>>,
    tokens: RwLock<HashMap<String, AccessToken>>,
    code_max_age: chrono::Duration,
    token_max_age: chrono::Duration,
}

impl TokenStore {
    pub fn new(code_max_age: Duration, token_max_age: Duration) -> Self {
        Self {
            codes: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            code_max_age: to_chrono(code_max_age),
            token_max_age: to_chrono(token_max_age),
        }
    }

    /// Issues a code for the grant.
    pub async fn issue_code(
        &self,
        user: &User,
        grant: &Grant,
        redirect_uri_required: bool,
    ) -> AuthorizeCode {
        let now = Utc::now();
        let code = AuthorizeCode {
            code: new_secret(),
            client_id: grant.client.id.clone(),
            redirect_uri: grant.redirect_uri.clone(),
            redirect_uri_required,
            scopes: grant.scopes.clone(),
            user: user.clone(),
            expires_at: now + self.code_max_age,
        };

        let mut codes = self.codes.write().await;
        codes.retain(|_, c| c.expires_at > now);
        codes.insert(code.code.clone(), code.clone());
        debug!(user = %user.name, client = %grant.client.id, "issued authorization code");
        code
    }

    /// Redeems a code for an access token. A code can be redeemed once, and
    /// only by the client and redirect URI it was issued to.
    pub async fn exchange_code(
        &self,
        code: &str,
        client_id: &str,
        redirect_uri: Option<&str>,
    ) -> Result<AccessToken, OAuthServerError> {
        let Some(issued) = self.codes.write().await.remove(code) else {
            return Err(OAuthServerError::InvalidGrant("unknown authorization code".to_string()));
        };

        let now = Utc::now();
        if issued.expires_at <= now {
            return Err(OAuthServerError::InvalidGrant("authorization code expired".to_string()));
        }
        if issued.client_id != client_id {
            return Err(OAuthServerError::InvalidGrant(
                "authorization code was issued to another client".to_string(),
            ));
        }
        match redirect_uri {
            Some(uri) if uri != issued.redirect_uri => {
                return Err(OAuthServerError::InvalidGrant("redirect_uri mismatch".to_string()));
            }
            None if issued.redirect_uri_required => {
                return Err(OAuthServerError::InvalidGrant("redirect_uri is required".to_string()));
            }
            _ => {}
        }

        let token = AccessToken {
            token: new_secret(),
            client_id: issued.client_id,
            scopes: issued.scopes,
            user: issued.user,
            expires_at: now + self.token_max_age,
        };

        let mut tokens = self.tokens.write().await;
        tokens.retain(|_, t| t.expires_at > now);
        tokens.insert(token.token.clone(), token.clone());
        info!(user = %token.user.name, client = %token.client_id, "issued access token");
        Ok(token)
    }

    pub async fn access_token(&self, token: &str) -> Option<AccessToken> {
        self.tokens.read().await.get(token).cloned()
    }
}

/// Authenticates bearer tokens issued by [`TokenStore::exchange_code`].
#[derive(Clone)]
pub struct IssuedTokenAuthenticator {
    store: Arc<TokenStore>,
}

impl IssuedTokenAuthenticator {
    pub fn new(store: Arc<TokenStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TokenAuthenticator for IssuedTokenAuthenticator {
    async fn authenticate_token(&self, token: &str) -> AuthOutcome {
        let Some(issued) = self.store.access_token(token).await else {
            return Err(AuthError::Unauthorized("unknown access token".to_string()));
        };
        if issued.expires_at <= Utc::now() {
            return Err(AuthError::TokenExpired);
        }
        Ok(Some(issued.user))
    }
}
