//! Authenticators that need no remote backend.

mod allow_any;
mod deny;
mod error;
mod htpasswd;
mod token_file;

pub use allow_any::AllowAnyPasswordAuthenticator;
pub use deny::DenyPasswordAuthenticator;
pub use error::LocalError;
pub use htpasswd::{HtpasswdAuthenticator, hash_password};
pub use token_file::TokenFileAuthenticator;
