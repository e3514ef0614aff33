//! Handlers that turn authentication results into HTTP responses.
//!
//! Interactive login flows do not return a value; they write a redirect, a
//! challenge or a cookie into a [`FlowResponse`]. Each handler reports whether
//! it fully handled the response so that chains can stop early.

use crate::{AuthError, User};
use async_trait::async_trait;
use http::header::{HeaderMap, HeaderValue, LOCATION};
use http::{Response, StatusCode};
use std::sync::Arc;
use tracing::debug;

/// Response being assembled by a login flow.
pub type FlowResponse = Response<String>;

/// An empty `200 OK` response for handlers to fill in.
pub fn new_flow_response() -> FlowResponse {
    Response::new(String::new())
}

/// Turns `response` into a `302 Found` pointing at `location`.
pub fn redirect(response: &mut FlowResponse, location: &str) -> Result<(), AuthError> {
    let value = HeaderValue::from_str(location)
        .map_err(|_| AuthError::Protocol(format!("invalid redirect location: {location}")))?;
    *response.status_mut() = StatusCode::FOUND;
    response.headers_mut().insert(LOCATION, value);
    Ok(())
}

/// Called once a user has been authenticated during an interactive flow.
#[async_trait]
pub trait AuthenticationSuccessHandler: Send + Sync {
    /// Returns `true` when the response has been fully written.
    async fn authentication_succeeded(
        &self,
        user: &User,
        then: &str,
        request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<bool, AuthError>;
}

/// Called when an interactive flow fails.
#[async_trait]
pub trait AuthenticationErrorHandler: Send + Sync {
    /// Returns `true` when the response has been fully written.
    async fn authentication_error(
        &self,
        error: &AuthError,
        request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<bool, AuthError>;
}

/// Produces the headers of a `401` for clients that want challenges rather
/// than redirects.
pub trait AuthenticationChallenger: Send + Sync {
    fn authentication_challenge(&self, request: &HeaderMap) -> Result<HeaderMap, AuthError>;
}

/// Sends an unauthenticated browser to the place where it can log in.
#[async_trait]
pub trait AuthenticationRedirector: Send + Sync {
    /// `then` is where the browser should land once the login completes.
    async fn authentication_redirect(
        &self,
        then: &str,
        request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<(), AuthError>;
}

/// Runs success handlers in order until one handles the response.
#[derive(Clone, Default)]
pub struct SuccessHandlers(Vec<Arc<dyn AuthenticationSuccessHandler>>);

impl SuccessHandlers {
    pub fn new(handlers: Vec<Arc<dyn AuthenticationSuccessHandler>>) -> Self {
        Self(handlers)
    }
}

#[async_trait]
impl AuthenticationSuccessHandler for SuccessHandlers {
    async fn authentication_succeeded(
        &self,
        user: &User,
        then: &str,
        request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<bool, AuthError> {
        for handler in &self.0 {
            if handler
                .authentication_succeeded(user, then, request, response)
                .await?
            {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Runs error handlers in order until one handles the response.
#[derive(Clone, Default)]
pub struct ErrorHandlers(Vec<Arc<dyn AuthenticationErrorHandler>>);

impl ErrorHandlers {
    pub fn new(handlers: Vec<Arc<dyn AuthenticationErrorHandler>>) -> Self {
        Self(handlers)
    }
}

#[async_trait]
impl AuthenticationErrorHandler for ErrorHandlers {
    async fn authentication_error(
        &self,
        error: &AuthError,
        request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<bool, AuthError> {
        for handler in &self.0 {
            if handler.authentication_error(error, request, response).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Finishes a successful login by redirecting to its `then` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct RedirectSuccessHandler;

#[async_trait]
impl AuthenticationSuccessHandler for RedirectSuccessHandler {
    async fn authentication_succeeded(
        &self,
        user: &User,
        then: &str,
        _request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<bool, AuthError> {
        if then.is_empty() {
            return Err(AuthError::Protocol(format!(
                "authentication of {} succeeded but no redirect target was given",
                user.name
            )));
        }
        redirect(response, then)?;
        Ok(true)
    }
}

/// Redirects failed logins to an error page, passing the failure's reason
/// code as the `reason` query parameter.
#[derive(Debug, Clone)]
pub struct ReasonRedirectErrorHandler {
    error_url: String,
}

impl ReasonRedirectErrorHandler {
    pub fn new(error_url: impl Into<String>) -> Self {
        Self {
            error_url: error_url.into(),
        }
    }
}

#[async_trait]
impl AuthenticationErrorHandler for ReasonRedirectErrorHandler {
    async fn authentication_error(
        &self,
        error: &AuthError,
        _request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<bool, AuthError> {
        let reason = error.reason();
        debug!(reason, error = %error, "redirecting failed login to error page");

        let separator = if self.error_url.contains('?') { '&' } else { '?' };
        redirect(
            response,
            &format!("{}{}reason={}", self.error_url, separator, reason),
        )?;
        Ok(true)
    }
}
