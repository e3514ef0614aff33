//! Authenticators that find credentials in HTTP request headers.

mod basic;
mod bearer;
mod challenger;
mod header;

pub use basic::{BasicAuthRequestAuthenticator, basic_auth_credentials};
pub use bearer::BearerTokenAuthenticator;
pub use challenger::BasicAuthChallenger;
pub use header::{RequestHeaderAuthenticator, RequestHeaderConfig};
