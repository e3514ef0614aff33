//! Browser login through an external identity provider.

use crate::client::OAuth2Client;
use crate::error::OAuth2Error;
use crate::provider::ExternalProvider;
use crate::state::StateHandler;
use crate::types::AuthorizationResponse;
use async_trait::async_trait;
use broker_auth_core::{
    AuthError, AuthenticationErrorHandler, AuthenticationRedirector, AuthenticationSuccessHandler,
    FlowResponse, new_flow_response, redirect,
};
use broker_identity_core::IdentityMapper;
use http::HeaderMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Drives the authorization code flow against one provider: the redirect to
/// the provider, and the callback that turns a code into a logged-in user.
pub struct ExternalOAuthHandler {
    provider: Arc<dyn ExternalProvider>,
    client: OAuth2Client,
    redirect_uri: String,
    state: StateHandler,
    mapper: Arc<dyn IdentityMapper>,
    success: Arc<dyn AuthenticationSuccessHandler>,
    errors: Arc<dyn AuthenticationErrorHandler>,
}

impl ExternalOAuthHandler {
    /// `redirect_uri` is the broker's callback URL registered with the provider.
    pub fn new(
        provider: Arc<dyn ExternalProvider>,
        client: OAuth2Client,
        redirect_uri: impl Into<String>,
        state: StateHandler,
        mapper: Arc<dyn IdentityMapper>,
        success: Arc<dyn AuthenticationSuccessHandler>,
        errors: Arc<dyn AuthenticationErrorHandler>,
    ) -> Self {
        Self {
            provider,
            client,
            redirect_uri: redirect_uri.into(),
            state,
            mapper,
            success,
            errors,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Handles the provider's redirect back to the broker.
    ///
    /// Failures are offered to the error handler first; an error is only
    /// returned when no handler wrote a response.
    pub async fn handle_callback(
        &self,
        query: &str,
        request: &HeaderMap,
    ) -> Result<FlowResponse, AuthError> {
        let mut response = new_flow_response();
        match self.complete(query, request, &mut response).await {
            Ok(()) => Ok(response),
            Err(err) => {
                warn!(provider = self.provider.name(), error = %err, "external login failed");
                let mut response = new_flow_response();
                if self
                    .errors
                    .authentication_error(&err, request, &mut response)
                    .await?
                {
                    Ok(response)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn complete(
        &self,
        query: &str,
        request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<(), AuthError> {
        let callback = AuthorizationResponse::from_query(query);

        if let Some(error) = callback.error {
            let description = callback.error_description.unwrap_or_default();
            let err = if error == "access_denied" {
                OAuth2Error::AccessDenied(description)
            } else {
                OAuth2Error::CallbackError { error, description }
            };
            return Err(err.into());
        }
        let code = callback
            .code
            .filter(|c| !c.is_empty())
            .ok_or(OAuth2Error::MissingAuthorizationCode)?;

        let tokens = self
            .client
            .exchange_code(self.provider.as_ref(), &code, &self.redirect_uri)
            .await?;
        let identity = self.provider.get_user_identity(&tokens).await?;

        // The identity is only used once the state proves this browser started
        // the flow.
        let then = self
            .state
            .check(callback.state.as_deref().unwrap_or_default(), request)?;

        let user = self.mapper.user_for(&identity).await?;
        info!(provider = self.provider.name(), user = %user.name, "external login succeeded");

        if !self
            .success
            .authentication_succeeded(&user, &then, request, response)
            .await?
        {
            redirect(response, &then)?;
        }
        Ok(())
    }
}

#[async_trait]
impl AuthenticationRedirector for ExternalOAuthHandler {
    async fn authentication_redirect(
        &self,
        then: &str,
        request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<(), AuthError> {
        let state = self.state.generate(then, request, response)?;
        let url = self
            .client
            .authorization_url(self.provider.as_ref(), &self.redirect_uri, &state)?;
        debug!(provider = self.provider.name(), "redirecting to identity provider");
        redirect(response, &url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csrf::{CookieCsrf, DEFAULT_CSRF_COOKIE};
    use crate::openid::OpenIdProvider;
    use crate::openid::tests::{config, id_token};
    use crate::state::OAuthState;
    use broker_auth_core::{ReasonRedirectErrorHandler, RedirectSuccessHandler};
    use broker_identity_core::{InMemoryUserRegistry, MappingMethod, RegistryIdentityMapper};
    use http::StatusCode;
    use http::header::{COOKIE, HeaderValue, LOCATION};
    use reqwest::Client;
    use std::collections::HashMap;
    use url::Url;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        server: MockServer,
        registry: Arc<InMemoryUserRegistry>,
        handler: ExternalOAuthHandler,
    }

    async fn fixture(with_error_page: bool) -> Fixture {
        let server = MockServer::start().await;
        let client = OAuth2Client::new(Client::new());
        let provider =
            OpenIdProvider::new("corp", config(&server.uri(), false), client.clone()).unwrap();
        let registry = Arc::new(InMemoryUserRegistry::new());
        let mapper = RegistryIdentityMapper::new(registry.clone(), MappingMethod::Claim);

        let errors: Arc<dyn AuthenticationErrorHandler> = if with_error_page {
            Arc::new(ReasonRedirectErrorHandler::new("/login/error"))
        } else {
            Arc::new(broker_auth_core::ErrorHandlers::default())
        };

        let handler = ExternalOAuthHandler::new(
            Arc::new(provider),
            client,
            "https://broker.example.com/oauth2callback/corp",
            StateHandler::new(Arc::new(CookieCsrf::new(DEFAULT_CSRF_COOKIE, true))),
            Arc::new(mapper),
            Arc::new(RedirectSuccessHandler),
            errors,
        );

        Fixture {
            server,
            registry,
            handler,
        }
    }

    async fn mount_token(server: &MockServer, claims: serde_json::Value) {
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at",
                "token_type": "Bearer",
                "id_token": id_token(claims)
            })))
            .mount(server)
            .await;
    }

    fn browser(csrf: &str) -> HeaderMap {
        let mut request = HeaderMap::new();
        request.insert(COOKIE, HeaderValue::from_str(&format!("csrf={csrf}")).unwrap());
        request
    }

    fn state(csrf: &str, then: &str) -> String {
        OAuthState {
            csrf: csrf.to_string(),
            then: then.to_string(),
        }
        .encode()
    }

    #[tokio::test]
    async fn test_redirect_to_provider() {
        let f = fixture(false).await;
        let mut response = new_flow_response();
        f.handler
            .authentication_redirect(
                "/oauth/authorize?client_id=cli",
                &HeaderMap::new(),
                &mut response,
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        let location = Url::parse(response.headers()[LOCATION].to_str().unwrap()).unwrap();
        assert_eq!(location.path(), "/authorize");
        let params: HashMap<_, _> = location.query_pairs().into_owned().collect();
        assert_eq!(
            params["redirect_uri"],
            "https://broker.example.com/oauth2callback/corp"
        );
        assert_eq!(params["scope"], "openid email");

        let decoded = OAuthState::decode(&params["state"]).unwrap();
        assert_eq!(decoded.then, "/oauth/authorize?client_id=cli");
        assert!(!decoded.csrf.is_empty());
    }

    #[tokio::test]
    async fn test_callback_logs_user_in() {
        let f = fixture(false).await;
        mount_token(&f.server, serde_json::json!({"sub": "42", "preferred_username": "ada"})).await;

        let query = format!("code=c0de&state={}", state("tok", "/done"));
        let response = f
            .handler
            .handle_callback(&query, &browser("tok"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers()[LOCATION], "/done");
        assert_eq!(f.registry.user_count().await, 1);
    }

    #[tokio::test]
    async fn test_bad_state_fails_after_identity_extraction() {
        let f = fixture(true).await;
        mount_token(&f.server, serde_json::json!({"sub": "42"})).await;

        let query = format!("code=c0de&state={}", state("forged", "/done"));
        let response = f
            .handler
            .handle_callback(&query, &browser("tok"))
            .await
            .unwrap();

        assert_eq!(
            response.headers()[LOCATION],
            "/login/error?reason=invalid_state"
        );
        // The provider round-trip happened, but nobody was logged in.
        assert_eq!(f.server.received_requests().await.unwrap().len(), 1);
        assert_eq!(f.registry.user_count().await, 0);
    }

    #[tokio::test]
    async fn test_provider_denial_maps_to_access_denied() {
        let f = fixture(true).await;
        let query = format!("error=access_denied&state={}", state("tok", "/done"));
        let response = f
            .handler
            .handle_callback(&query, &browser("tok"))
            .await
            .unwrap();
        assert_eq!(
            response.headers()[LOCATION],
            "/login/error?reason=access_denied"
        );

        let query = "error=temporarily_unavailable";
        let response = f.handler.handle_callback(query, &browser("tok")).await.unwrap();
        assert_eq!(
            response.headers()[LOCATION],
            "/login/error?reason=authentication_error"
        );
    }

    #[tokio::test]
    async fn test_unhandled_errors_are_returned() {
        let f = fixture(false).await;
        let err = f
            .handler
            .handle_callback("state=abc", &browser("tok"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::Protocol(_)));
    }
}
