use axum::{
    Json, Router,
    body::Body,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
};
use broker_auth_core::{AuthError, FlowResponse, new_flow_response};
use broker_oauth_server::{Broker, DEFAULT_APPROVE_PATH, TokenErrorBody};
use std::sync::Arc;
use tracing::{error, warn};
use url::form_urlencoded;

type AppState = Arc<Broker>;

pub fn router(broker: AppState) -> Router {
    Router::new()
        .route("/oauth/authorize", get(authorize))
        .route("/oauth/token", axum::routing::post(token))
        .route(DEFAULT_APPROVE_PATH, get(approval_prompt).post(approval_decision))
        .route("/oauth/login/{name}", get(choose_login))
        .route("/oauth2callback/{name}", get(external_callback))
        .route("/login/{name}", axum::routing::post(password_login))
        .route("/users/~", get(whoami))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(broker)
}

fn flow(response: FlowResponse) -> Response {
    response.map(Body::from).into_response()
}

/// Failures no handler turned into a page.
fn auth_failure(err: &AuthError) -> Response {
    let status = if err.is_auth_class() {
        StatusCode::UNAUTHORIZED
    } else {
        match err {
            AuthError::Protocol(_) | AuthError::Malformed(_) | AuthError::InvalidState(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    };
    if status.is_server_error() {
        error!(error = %err, "request failed");
    } else {
        warn!(error = %err, "request rejected");
    }
    (status, err.reason()).into_response()
}

fn query_value(query: Option<&str>, name: &str) -> String {
    form_urlencoded::parse(query.unwrap_or_default().as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default()
}

async fn authorize(State(broker): State<AppState>, uri: Uri, headers: HeaderMap) -> Response {
    let request_uri = uri.path_and_query().map_or(uri.path(), |pq| pq.as_str());
    flow(broker.authorize.authorize(request_uri, &headers).await)
}

async fn token(State(broker): State<AppState>, headers: HeaderMap, form: String) -> Response {
    match broker.authorize.token(&form, &headers).await {
        Ok(issued) => Json(issued).into_response(),
        Err(err) => {
            warn!(error = %err, "token request rejected");
            (err.status(), Json(TokenErrorBody::from(&err))).into_response()
        }
    }
}

async fn approval_prompt(
    State(broker): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let mut response = new_flow_response();
    match broker
        .approval
        .prompt(query.as_deref().unwrap_or_default(), &headers, &mut response)
        .await
    {
        Ok(prompt) => (response.headers().clone(), Json(prompt)).into_response(),
        Err(err) => auth_failure(&err),
    }
}

async fn approval_decision(
    State(broker): State<AppState>,
    headers: HeaderMap,
    form: String,
) -> Response {
    let mut response = new_flow_response();
    match broker.approval.decide(&form, &headers, &mut response).await {
        Ok(()) => flow(response),
        Err(err) => auth_failure(&err),
    }
}

async fn choose_login(
    State(broker): State<AppState>,
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let Some(provider) = broker.authorize.login_provider(&name) else {
        return (StatusCode::NOT_FOUND, "unknown identity provider").into_response();
    };
    let then = query_value(query.as_deref(), "then");
    let mut response = new_flow_response();
    match provider
        .redirector
        .authentication_redirect(&then, &headers, &mut response)
        .await
    {
        Ok(()) => flow(response),
        Err(err) => auth_failure(&err),
    }
}

async fn external_callback(
    State(broker): State<AppState>,
    Path(name): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let Some(handler) = broker.external_logins.get(&name) else {
        return (StatusCode::NOT_FOUND, "unknown identity provider").into_response();
    };
    match handler
        .handle_callback(query.as_deref().unwrap_or_default(), &headers)
        .await
    {
        Ok(response) => flow(response),
        Err(err) => auth_failure(&err),
    }
}

async fn password_login(
    State(broker): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    form: String,
) -> Response {
    let Some(handler) = broker.password_logins.get(&name) else {
        return (StatusCode::NOT_FOUND, "unknown identity provider").into_response();
    };
    match handler.login(&form, &headers).await {
        Ok(response) => flow(response),
        Err(err) => auth_failure(&err),
    }
}

async fn whoami(State(broker): State<AppState>, headers: HeaderMap) -> Response {
    match broker.whoami(&headers).await {
        Ok(Some(user)) => Json(user).into_response(),
        Ok(None) => (StatusCode::UNAUTHORIZED, "access_denied").into_response(),
        Err(err) => auth_failure(&err),
    }
}
