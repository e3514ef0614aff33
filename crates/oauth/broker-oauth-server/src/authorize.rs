//! The `/oauth/authorize` and `/oauth/token` endpoints.

use crate::client::{ClientRegistry, OAuthClient};
use crate::error::OAuthServerError;
use crate::grant::{Grant, GrantChecker, parse_scopes};
use crate::grant_handler::{GrantDecision, GrantHandler};
use crate::tokens::TokenStore;
use crate::with_query;
use async_trait::async_trait;
use broker_auth_core::{
    AuthError, AuthenticationChallenger, AuthenticationRedirector, FlowResponse,
    RequestAuthenticator, User, new_flow_response, redirect,
};
use broker_identity_request::basic_auth_credentials;
use broker_identity_session::SessionAuthenticator;
use http::header::{CONTENT_TYPE, HeaderValue};
use http::{HeaderMap, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::form_urlencoded;

/// The query of an authorize request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizeRequest {
    pub client_id: String,
    pub response_type: String,
    pub redirect_uri: Option<String>,
    pub scopes: Vec<String>,
    pub state: Option<String>,
}

impl AuthorizeRequest {
    /// Parses the query; repeated parameters keep their first value.
    pub fn from_query(query: &str) -> Self {
        let mut request = AuthorizeRequest::default();
        let mut seen = Vec::new();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if seen.contains(&key) {
                continue;
            }
            match key.as_ref() {
                "client_id" => request.client_id = value.into_owned(),
                "response_type" => request.response_type = value.into_owned(),
                "redirect_uri" => request.redirect_uri = Some(value.into_owned()),
                "scope" => request.scopes = parse_scopes(&value),
                "state" => request.state = Some(value.into_owned()),
                _ => {}
            }
            seen.push(key);
        }
        request
    }
}

/// Runs right before an authorization code is handed out.
#[async_trait]
pub trait AuthorizeFinalizer: Send + Sync {
    async fn finalize(
        &self,
        user: &User,
        request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<(), AuthError>;
}

/// The login session only drives the authorize redirects, so it is dropped
/// once a code is issued.
#[async_trait]
impl AuthorizeFinalizer for SessionAuthenticator {
    async fn finalize(
        &self,
        _user: &User,
        request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<(), AuthError> {
        Ok(self.invalidate_authentication(request, response)?)
    }
}

/// Sends the browser to one of the broker's own password login forms.
#[derive(Debug, Clone)]
pub struct LoginFormRedirector {
    login_path: String,
}

impl LoginFormRedirector {
    pub fn new(login_path: impl Into<String>) -> Self {
        Self {
            login_path: login_path.into(),
        }
    }
}

#[async_trait]
impl AuthenticationRedirector for LoginFormRedirector {
    async fn authentication_redirect(
        &self,
        then: &str,
        _request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<(), AuthError> {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("then", then)
            .finish();
        redirect(response, &with_query(&self.login_path, &query))
    }
}

/// One way for a browser to log in, offered when a request is not
/// authenticated.
#[derive(Clone)]
pub struct LoginProvider {
    pub name: String,
    pub redirector: Arc<dyn AuthenticationRedirector>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderChoice {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderSelection {
    pub providers: Vec<ProviderChoice>,
}

/// Successful token endpoint response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuedToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub scope: String,
}

/// Token endpoint error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenErrorBody {
    pub error: &'static str,
    pub error_description: String,
}

impl From<&OAuthServerError> for TokenErrorBody {
    fn from(err: &OAuthServerError) -> Self {
        Self {
            error: err.code(),
            error_description: err.to_string(),
        }
    }
}

fn text_response(status: StatusCode, body: impl Into<String>) -> FlowResponse {
    let mut response = new_flow_response();
    *response.status_mut() = status;
    *response.body_mut() = body.into();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> FlowResponse {
    match serde_json::to_string(body) {
        Ok(json) => {
            let mut response = new_flow_response();
            *response.status_mut() = status;
            *response.body_mut() = json;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// Where an authorize request reports its outcome once the client and
/// redirect URI are known.
struct Reply<'a> {
    redirect_uri: &'a str,
    state: Option<&'a str>,
}

impl Reply<'_> {
    fn redirect(&self, mut response: FlowResponse, params: &[(&str, &str)]) -> FlowResponse {
        let mut query = form_urlencoded::Serializer::new(String::new());
        for (key, value) in params {
            query.append_pair(key, value);
        }
        if let Some(state) = self.state {
            query.append_pair("state", state);
        }
        match redirect(&mut response, &with_query(self.redirect_uri, &query.finish())) {
            Ok(()) => response,
            Err(e) => text_response(StatusCode::BAD_REQUEST, e.to_string()),
        }
    }

    fn error(&self, code: &str, response: FlowResponse) -> FlowResponse {
        self.redirect(response, &[("error", code)])
    }

    fn auth_error(&self, err: &AuthError, response: FlowResponse) -> FlowResponse {
        warn!(error = %err, "authorize request failed");
        let code = if err.is_auth_class() {
            "access_denied"
        } else {
            "server_error"
        };
        self.error(code, response)
    }
}

/// The broker's OAuth authorization server.
pub struct AuthorizeServer {
    clients: Arc<ClientRegistry>,
    authenticator: Arc<dyn RequestAuthenticator>,
    challengers: Vec<Arc<dyn AuthenticationChallenger>>,
    login_providers: Vec<LoginProvider>,
    grant_checker: Arc<dyn GrantChecker>,
    grant_handler: Arc<dyn GrantHandler>,
    finalizers: Vec<Arc<dyn AuthorizeFinalizer>>,
    tokens: Arc<TokenStore>,
}

impl AuthorizeServer {
    pub fn new(
        clients: Arc<ClientRegistry>,
        authenticator: Arc<dyn RequestAuthenticator>,
        grant_checker: Arc<dyn GrantChecker>,
        grant_handler: Arc<dyn GrantHandler>,
        tokens: Arc<TokenStore>,
    ) -> Self {
        Self {
            clients,
            authenticator,
            challengers: Vec::new(),
            login_providers: Vec::new(),
            grant_checker,
            grant_handler,
            finalizers: Vec::new(),
            tokens,
        }
    }

    pub fn with_challenger(mut self, challenger: Arc<dyn AuthenticationChallenger>) -> Self {
        self.challengers.push(challenger);
        self
    }

    pub fn with_login_provider(
        mut self,
        name: impl Into<String>,
        redirector: Arc<dyn AuthenticationRedirector>,
    ) -> Self {
        self.login_providers.push(LoginProvider {
            name: name.into(),
            redirector,
        });
        self
    }

    pub fn with_finalizer(mut self, finalizer: Arc<dyn AuthorizeFinalizer>) -> Self {
        self.finalizers.push(finalizer);
        self
    }

    pub fn login_provider(&self, name: &str) -> Option<&LoginProvider> {
        self.login_providers.iter().find(|p| p.name == name)
    }

    /// Handles `GET /oauth/authorize`. `request_uri` is the path and query
    /// of the request; it is where a login flow resumes.
    pub async fn authorize(&self, request_uri: &str, request: &HeaderMap) -> FlowResponse {
        let query = request_uri.split_once('?').map_or("", |(_, query)| query);
        let params = AuthorizeRequest::from_query(query);

        // Until the redirect URI is known to belong to the client, errors
        // must not be sent anywhere.
        let Some(client) = self.clients.get(&params.client_id) else {
            debug!(client = %params.client_id, "authorize request for unknown client");
            return text_response(StatusCode::BAD_REQUEST, "unknown client_id");
        };
        let Some(redirect_uri) = client.resolve_redirect_uri(params.redirect_uri.as_deref()) else {
            debug!(client = %client.id, "authorize request with unregistered redirect_uri");
            return text_response(StatusCode::BAD_REQUEST, "invalid redirect_uri");
        };
        let reply = Reply {
            redirect_uri: &redirect_uri,
            state: params.state.as_deref(),
        };
        if params.response_type != "code" {
            return reply.error("unsupported_response_type", new_flow_response());
        }

        let user = match self.authenticator.authenticate_request(request).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                return self
                    .authentication_needed(client, request_uri, request, &reply)
                    .await;
            }
            Err(e) if e.is_auth_class() && client.respond_with_challenges => {
                debug!(error = %e, "rejected credentials, challenging");
                return self.challenge(request, &reply);
            }
            Err(e) => return reply.auth_error(&e, new_flow_response()),
        };

        let grant = Grant {
            client: client.clone(),
            scopes: params.scopes.clone(),
            redirect_uri: redirect_uri.clone(),
        };
        let mut response = new_flow_response();

        match self.grant_checker.has_authorized_client(&user, &grant).await {
            Ok(true) => {}
            Ok(false) => {
                match self
                    .grant_handler
                    .grant_needed(&user, &grant, request_uri, request, &mut response)
                    .await
                {
                    Ok(GrantDecision::Approved) => {}
                    Ok(GrantDecision::Handled) => return response,
                    Ok(GrantDecision::Denied) => return reply.error("access_denied", response),
                    Err(e) => return reply.auth_error(&e, response),
                }
            }
            Err(e) => return reply.auth_error(&AuthError::from(e), response),
        }

        for finalizer in &self.finalizers {
            if let Err(e) = finalizer.finalize(&user, request, &mut response).await {
                return reply.auth_error(&e, response);
            }
        }

        let redirect_uri_named = params.redirect_uri.as_deref().is_some_and(|uri| !uri.is_empty());
        let code = self.tokens.issue_code(&user, &grant, redirect_uri_named).await;
        info!(user = %user.name, client = %client.id, "authorization code issued");
        reply.redirect(response, &[("code", code.code.as_str())])
    }

    async fn authentication_needed(
        &self,
        client: &OAuthClient,
        request_uri: &str,
        request: &HeaderMap,
        reply: &Reply<'_>,
    ) -> FlowResponse {
        if client.respond_with_challenges {
            return self.challenge(request, reply);
        }

        match self.login_providers.as_slice() {
            [] => reply.error("access_denied", new_flow_response()),
            [provider] => {
                let mut response = new_flow_response();
                match provider
                    .redirector
                    .authentication_redirect(request_uri, request, &mut response)
                    .await
                {
                    Ok(()) => response,
                    Err(e) => reply.auth_error(&e, response),
                }
            }
            providers => {
                let providers = providers
                    .iter()
                    .map(|provider| {
                        let query = form_urlencoded::Serializer::new(String::new())
                            .append_pair("then", request_uri)
                            .finish();
                        ProviderChoice {
                            name: provider.name.clone(),
                            url: format!("/oauth/login/{}?{}", provider.name, query),
                        }
                    })
                    .collect();
                json_response(StatusCode::OK, &ProviderSelection { providers })
            }
        }
    }

    fn challenge(&self, request: &HeaderMap, reply: &Reply<'_>) -> FlowResponse {
        if self.challengers.is_empty() {
            return reply.error("access_denied", new_flow_response());
        }

        let mut response = text_response(StatusCode::UNAUTHORIZED, "authentication required");
        for challenger in &self.challengers {
            match challenger.authentication_challenge(request) {
                Ok(headers) => {
                    for (name, value) in &headers {
                        response.headers_mut().append(name, value.clone());
                    }
                }
                Err(e) => return reply.auth_error(&e, new_flow_response()),
            }
        }
        response
    }

    /// Handles `POST /oauth/token`. Client credentials come from the form or
    /// from a Basic `Authorization` header.
    pub async fn token(
        &self,
        form: &str,
        request: &HeaderMap,
    ) -> Result<IssuedToken, OAuthServerError> {
        let mut grant_type = None;
        let mut code = None;
        let mut redirect_uri = None;
        let mut client_id = None;
        let mut client_secret = None;
        for (key, value) in form_urlencoded::parse(form.as_bytes()) {
            let slot = match key.as_ref() {
                "grant_type" => &mut grant_type,
                "code" => &mut code,
                "redirect_uri" => &mut redirect_uri,
                "client_id" => &mut client_id,
                "client_secret" => &mut client_secret,
                _ => continue,
            };
            slot.get_or_insert_with(|| value.into_owned());
        }

        if let Some((id, secret)) = basic_auth_credentials(request)
            .map_err(|e| OAuthServerError::InvalidRequest(e.to_string()))?
        {
            client_id = Some(id);
            client_secret = Some(secret);
        }

        let grant_type = grant_type.unwrap_or_default();
        if grant_type != "authorization_code" {
            return Err(OAuthServerError::UnsupportedGrantType(grant_type));
        }

        let client_id = client_id.unwrap_or_default();
        let Some(client) = self.clients.get(&client_id) else {
            return Err(OAuthServerError::InvalidClient);
        };
        if !client.check_secret(client_secret.as_deref().unwrap_or_default()) {
            warn!(client = %client.id, "token request with wrong client secret");
            return Err(OAuthServerError::InvalidClient);
        }

        let Some(code) = code.filter(|c| !c.is_empty()) else {
            return Err(OAuthServerError::InvalidRequest("missing code".to_string()));
        };
        let token = self
            .tokens
            .exchange_code(&code, &client.id, redirect_uri.as_deref())
            .await?;

        Ok(IssuedToken {
            expires_in: token.expires_in(),
            scope: token.scopes.join(" "),
            access_token: token.token,
            token_type: "Bearer".to_string(),
        })
    }
}
