//! Authentication traits and composition primitives for the identity broker.
//!
//! Every authenticator in the broker implements exactly one capability trait
//! ([`TokenAuthenticator`], [`PasswordAuthenticator`] or [`RequestAuthenticator`])
//! and answers with an [`AuthOutcome`]:
//!
//! - `Ok(Some(user))` - the credentials were accepted
//! - `Ok(None)` - the authenticator does not apply to this request
//! - `Err(error)` - the credentials were rejected or the backend failed
//!
//! Authenticators are combined with [`Union`] and decorated with
//! [`CachingTokenAuthenticator`] or [`GroupAdder`].

mod authenticator;
mod cache;
mod clock;
pub mod cookie;
mod error;
mod group;
mod handler;
mod union;
mod user;

pub use authenticator::{
    AuthOutcome, PasswordAuthenticator, RequestAuthenticator, TokenAuthenticator,
};
pub use cache::{CachingTokenAuthenticator, new_caching_authenticator};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{AuthError, MappingFailure};
pub use group::GroupAdder;
pub use handler::{
    AuthenticationChallenger, AuthenticationErrorHandler, AuthenticationRedirector,
    AuthenticationSuccessHandler, ErrorHandlers, FlowResponse, ReasonRedirectErrorHandler,
    RedirectSuccessHandler, SuccessHandlers, new_flow_response, redirect,
};
pub use union::Union;
pub use user::User;
