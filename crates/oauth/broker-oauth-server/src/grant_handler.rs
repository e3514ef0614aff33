//! What happens when an authorize request needs a grant the user has not
//! given yet.

use crate::client::{ClientRegistry, GrantMethod};
use crate::grant::{ClientAuthorizationStore, Grant, parse_scopes, record_authorization};
use async_trait::async_trait;
use broker_auth_core::{AuthError, FlowResponse, RequestAuthenticator, User, redirect};
use broker_identity_oauth2::CsrfTokens;
use http::HeaderMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};
use url::form_urlencoded;

pub const DEFAULT_APPROVE_PATH: &str = "/oauth/authorize/approve";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrantDecision {
    /// The grant is recorded; the authorize request may proceed.
    Approved,
    /// The handler wrote the response, e.g. a redirect to a consent prompt.
    Handled,
    Denied,
}

#[async_trait]
pub trait GrantHandler: Send + Sync {
    /// `then` is the authorize request to resume once the grant is given.
    async fn grant_needed(
        &self,
        user: &User,
        grant: &Grant,
        then: &str,
        request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<GrantDecision, AuthError>;
}

/// Approves every grant without asking.
#[derive(Clone)]
pub struct AutoGrant {
    store: Arc<dyn ClientAuthorizationStore>,
}

impl AutoGrant {
    pub fn new(store: Arc<dyn ClientAuthorizationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl GrantHandler for AutoGrant {
    async fn grant_needed(
        &self,
        user: &User,
        grant: &Grant,
        _then: &str,
        _request: &HeaderMap,
        _response: &mut FlowResponse,
    ) -> Result<GrantDecision, AuthError> {
        record_authorization(self.store.as_ref(), user, &grant.client.id, &grant.scopes).await?;
        Ok(GrantDecision::Approved)
    }
}

/// Sends the user to the consent prompt.
#[derive(Debug, Clone)]
pub struct RedirectGrant {
    approve_path: String,
}

impl RedirectGrant {
    pub fn new(approve_path: impl Into<String>) -> Self {
        Self {
            approve_path: approve_path.into(),
        }
    }
}

impl Default for RedirectGrant {
    fn default() -> Self {
        Self::new(DEFAULT_APPROVE_PATH)
    }
}

#[async_trait]
impl GrantHandler for RedirectGrant {
    async fn grant_needed(
        &self,
        user: &User,
        grant: &Grant,
        then: &str,
        _request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<GrantDecision, AuthError> {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("then", then)
            .append_pair("client_id", &grant.client.id)
            .append_pair("scope", &grant.scopes.join(" "))
            .finish();
        debug!(user = %user.name, client = %grant.client.id, "asking for grant approval");
        redirect(response, &format!("{}?{}", self.approve_path, query))?;
        Ok(GrantDecision::Handled)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DenyGrant;

#[async_trait]
impl GrantHandler for DenyGrant {
    async fn grant_needed(
        &self,
        user: &User,
        grant: &Grant,
        _then: &str,
        _request: &HeaderMap,
        _response: &mut FlowResponse,
    ) -> Result<GrantDecision, AuthError> {
        debug!(user = %user.name, client = %grant.client.id, "grant denied");
        Ok(GrantDecision::Denied)
    }
}

/// Dispatches on the client's [`GrantMethod`], falling back to a default.
pub struct PerClientGrant {
    auto: AutoGrant,
    prompt: RedirectGrant,
    default_method: GrantMethod,
}

impl PerClientGrant {
    pub fn new(auto: AutoGrant, prompt: RedirectGrant, default_method: GrantMethod) -> Self {
        Self {
            auto,
            prompt,
            default_method,
        }
    }
}

#[async_trait]
impl GrantHandler for PerClientGrant {
    async fn grant_needed(
        &self,
        user: &User,
        grant: &Grant,
        then: &str,
        request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<GrantDecision, AuthError> {
        let method = grant.client.grant_method.unwrap_or(self.default_method);
        let handler: &dyn GrantHandler = match method {
            GrantMethod::Auto => &self.auto,
            GrantMethod::Prompt => &self.prompt,
            GrantMethod::Deny => &DenyGrant,
        };
        handler.grant_needed(user, grant, then, request, response).await
    }
}

/// The data a consent page shows and posts back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrantPrompt {
    pub user_name: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub then: String,
    pub csrf: String,
}

fn form_value(pairs: &[(String, String)], name: &str) -> Option<String> {
    pairs
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.clone())
}

/// `then` must be a path on this server so the approve endpoint cannot be
/// used as an open redirect.
fn local_path(then: &str) -> Result<&str, AuthError> {
    if then.starts_with('/') && !then.starts_with("//") {
        Ok(then)
    } else {
        Err(AuthError::Protocol(format!("invalid redirect target: {then}")))
    }
}

/// Serves the consent prompt and records the user's answer.
pub struct GrantApproval {
    clients: Arc<ClientRegistry>,
    authenticator: Arc<dyn RequestAuthenticator>,
    csrf: Arc<dyn CsrfTokens>,
    store: Arc<dyn ClientAuthorizationStore>,
}

impl GrantApproval {
    pub fn new(
        clients: Arc<ClientRegistry>,
        authenticator: Arc<dyn RequestAuthenticator>,
        csrf: Arc<dyn CsrfTokens>,
        store: Arc<dyn ClientAuthorizationStore>,
    ) -> Self {
        Self {
            clients,
            authenticator,
            csrf,
            store,
        }
    }

    async fn user(&self, request: &HeaderMap) -> Result<User, AuthError> {
        self.authenticator
            .authenticate_request(request)
            .await?
            .ok_or_else(|| {
                AuthError::Unauthorized("approving a grant requires a login".to_string())
            })
    }

    /// Describes the grant named by the `then`, `client_id` and `scope`
    /// query parameters, issuing a CSRF token into `response`.
    pub async fn prompt(
        &self,
        query: &str,
        request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<GrantPrompt, AuthError> {
        let params: Vec<(String, String)> = form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        let user = self.user(request).await?;

        let client_id = form_value(&params, "client_id").unwrap_or_default();
        if self.clients.get(&client_id).is_none() {
            return Err(AuthError::Protocol(format!("unknown client {client_id:?}")));
        }
        let then = form_value(&params, "then").unwrap_or_default();
        local_path(&then)?;

        Ok(GrantPrompt {
            user_name: user.name,
            client_id,
            scopes: parse_scopes(&form_value(&params, "scope").unwrap_or_default()),
            then,
            csrf: self.csrf.generate(request, response)?,
        })
    }

    /// Handles the posted consent form. An `approve` field records the
    /// grant and resumes the authorize request; anything else sends the
    /// browser back to the client with `error=access_denied`.
    pub async fn decide(
        &self,
        form: &str,
        request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<(), AuthError> {
        let params: Vec<(String, String)> = form_urlencoded::parse(form.as_bytes())
            .into_owned()
            .collect();

        let csrf = form_value(&params, "csrf").unwrap_or_default();
        if !self.csrf.check(request, &csrf) {
            return Err(AuthError::InvalidState("grant form csrf mismatch".to_string()));
        }
        let user = self.user(request).await?;

        let client_id = form_value(&params, "client_id").unwrap_or_default();
        let Some(client) = self.clients.get(&client_id) else {
            return Err(AuthError::Protocol(format!("unknown client {client_id:?}")));
        };
        let then = form_value(&params, "then").unwrap_or_default();
        let then = local_path(&then)?;

        if form_value(&params, "approve").is_some() {
            let scopes = parse_scopes(&form_value(&params, "scope").unwrap_or_default());
            record_authorization(self.store.as_ref(), &user, &client.id, &scopes).await?;
            info!(user = %user.name, client = %client.id, "grant approved");
            return redirect(response, then);
        }

        // The client learns about the denial at the redirect URI of the
        // authorize request being resumed.
        let original: Vec<(String, String)> = then
            .split_once('?')
            .map(|(_, query)| form_urlencoded::parse(query.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        let requested = form_value(&original, "redirect_uri");
        let Some(redirect_uri) = client.resolve_redirect_uri(requested.as_deref()) else {
            return Err(AuthError::Protocol(
                "grant denied without a valid redirect URI".to_string(),
            ));
        };

        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("error", "access_denied");
        if let Some(state) = form_value(&original, "state") {
            query.append_pair("state", &state);
        }
        info!(user = %user.name, client = %client.id, "grant denied by user");
        redirect(response, &crate::with_query(&redirect_uri, &query.finish()))
    }
}
