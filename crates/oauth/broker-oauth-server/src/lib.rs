//! The identity broker's OAuth2 authorization server.
//!
//! [`AuthorizeServer`] authenticates the browser or CLI behind an authorize
//! request, makes sure the user has granted the client what it asks for, and
//! hands out a one-time code that the client redeems at the token endpoint.
//! [`BrokerBuilder`] assembles it, together with every login flow, from a
//! [`BrokerConfig`].

mod authorize;
mod builder;
mod client;
pub mod config;
mod error;
mod grant;
mod grant_handler;
mod login;
mod tokens;

pub use authorize::{
    AuthorizeFinalizer, AuthorizeRequest, AuthorizeServer, IssuedToken, LoginFormRedirector,
    LoginProvider, ProviderChoice, ProviderSelection, TokenErrorBody,
};
pub use builder::{Broker, BrokerBuilder, BuildError};
pub use client::{ClientRegistry, GrantMethod, OAuthClient};
pub use config::{BrokerConfig, ConfigError, IdentityProviderConfig, ProviderConfig};
pub use error::{OAuthServerError, StoreError};
pub use grant::{
    ClientAuthorization, ClientAuthorizationStore, DefaultGrantChecker, Grant, GrantChecker,
    InMemoryClientAuthorizationStore, parse_scopes, record_authorization,
};
pub use grant_handler::{
    AutoGrant, DEFAULT_APPROVE_PATH, DenyGrant, GrantApproval, GrantDecision, GrantHandler,
    GrantPrompt, PerClientGrant, RedirectGrant,
};
pub use login::PasswordLoginHandler;
pub use tokens::{
    AccessToken, AuthorizeCode, DEFAULT_ACCESS_TOKEN_MAX_AGE, DEFAULT_AUTHORIZE_CODE_MAX_AGE,
    IssuedTokenAuthenticator, TokenStore,
};

/// Appends an encoded query to `base`, which may already carry one.
pub(crate) fn with_query(base: &str, query: &str) -> String {
    if query.is_empty() {
        return base.to_string();
    }
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{base}{separator}{query}")
}
