use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use subtle::ConstantTimeEq;

/// How a missing grant is obtained for a client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantMethod {
    /// Record the grant without asking; for trusted first-party clients.
    Auto,
    /// Ask the user to approve.
    #[default]
    Prompt,
    /// Refuse every grant.
    Deny,
}

/// A registered OAuth client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthClient {
    pub id: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    /// CLI style clients get a `WWW-Authenticate` challenge instead of a
    /// login redirect.
    #[serde(default)]
    pub respond_with_challenges: bool,
    /// Falls back to the server default when unset.
    #[serde(default)]
    pub grant_method: Option<GrantMethod>,
}

impl OAuthClient {
    /// Resolves the redirect URI of an authorize request. Only an exact match
    /// against a registered URI is accepted; an omitted URI is allowed when
    /// exactly one is registered.
    pub fn resolve_redirect_uri(&self, requested: Option<&str>) -> Option<String> {
        match requested.filter(|uri| !uri.is_empty()) {
            Some(uri) => self
                .redirect_uris
                .iter()
                .find(|registered| registered.as_str() == uri)
                .cloned(),
            None if self.redirect_uris.len() == 1 => self.redirect_uris.first().cloned(),
            None => None,
        }
    }

    /// A client registered without a secret is public and must present none.
    pub fn check_secret(&self, secret: &str) -> bool {
        self.secret.as_bytes().ct_eq(secret.as_bytes()).into()
    }
}

/// Registered clients by id.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, OAuthClient>,
}

impl ClientRegistry {
    pub fn new(clients: impl IntoIterator<Item = OAuthClient>) -> Self {
        Self {
            clients: clients
                .into_iter()
                .map(|client| (client.id.clone(), client))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&OAuthClient> {
        self.clients.get(id)
    }
}
