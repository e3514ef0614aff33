use broker_auth_core::{
    AuthError, AuthenticationErrorHandler, AuthenticationSuccessHandler, FlowResponse,
    PasswordAuthenticator, new_flow_response, redirect,
};
use http::HeaderMap;
use std::sync::Arc;
use tracing::{info, warn};
use url::form_urlencoded;

/// Handles the posted password login form (`username`, `password`, `then`).
pub struct PasswordLoginHandler {
    authenticator: Arc<dyn PasswordAuthenticator>,
    success: Arc<dyn AuthenticationSuccessHandler>,
    errors: Arc<dyn AuthenticationErrorHandler>,
}

impl PasswordLoginHandler {
    pub fn new(
        authenticator: Arc<dyn PasswordAuthenticator>,
        success: Arc<dyn AuthenticationSuccessHandler>,
        errors: Arc<dyn AuthenticationErrorHandler>,
    ) -> Self {
        Self {
            authenticator,
            success,
            errors,
        }
    }

    /// Failures are offered to the error handler; an error is only returned
    /// when no handler wrote a response.
    pub async fn login(&self, form: &str, request: &HeaderMap) -> Result<FlowResponse, AuthError> {
        let mut response = new_flow_response();
        match self.try_login(form, request, &mut response).await {
            Ok(()) => Ok(response),
            Err(err) => {
                warn!(error = %err, reason = err.reason(), "password login failed");
                let mut response = new_flow_response();
                if self.errors.authentication_error(&err, request, &mut response).await? {
                    Ok(response)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn try_login(
        &self,
        form: &str,
        request: &HeaderMap,
        response: &mut FlowResponse,
    ) -> Result<(), AuthError> {
        let mut username = String::new();
        let mut password = String::new();
        let mut then = String::new();
        for (key, value) in form_urlencoded::parse(form.as_bytes()) {
            match key.as_ref() {
                "username" if username.is_empty() => username = value.into_owned(),
                "password" if password.is_empty() => password = value.into_owned(),
                "then" if then.is_empty() => then = value.into_owned(),
                _ => {}
            }
        }
        if !then.starts_with('/') || then.starts_with("//") {
            return Err(AuthError::Protocol(format!("invalid redirect target: {then}")));
        }

        let Some(user) = self
            .authenticator
            .authenticate_password(&username, &password)
            .await?
        else {
            return Err(AuthError::Unauthorized("invalid username or password".to_string()));
        };
        info!(user = %user.name, "password login succeeded");

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
