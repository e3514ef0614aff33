//! Login through external OAuth2 and OpenID Connect identity providers.
//!
//! An [`ExternalOAuthHandler`] sends the browser to the provider with a
//! CSRF-bound `state`, exchanges the returned code for tokens, asks the
//! [`ExternalProvider`] who the tokens belong to, and only then checks the
//! state before mapping the identity onto a user.

mod claims;
mod client;
mod csrf;
mod error;
mod github;
mod gitlab;
mod google;
mod handler;
mod jwt;
mod openid;
mod password;
mod provider;
mod state;
mod types;

pub use claims::Claims;
pub use client::OAuth2Client;
pub use csrf::{CookieCsrf, CsrfTokens, DEFAULT_CSRF_COOKIE};
pub use error::{OAuth2Error, OAuth2Result};
pub use github::GitHubProvider;
pub use gitlab::GitLabProvider;
pub use google::GoogleProvider;
pub use handler::ExternalOAuthHandler;
pub use jwt::decode_jwt_payload;
pub use openid::{OpenIdClaims, OpenIdConfig, OpenIdProvider};
pub use password::OAuthPasswordAuthenticator;
pub use provider::{AuthorizeConfig, ExternalProvider};
pub use state::{OAuthState, StateHandler};
pub use types::{AuthorizationResponse, TokenResponse};
