//! End to end authorize flows through a broker built from configuration.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use broker_auth_core::{AuthenticationRedirector, FlowResponse, new_flow_response};
use broker_identity_local::hash_password;
use broker_oauth_server::{Broker, BrokerBuilder, BrokerConfig};
use http::header::{COOKIE, HeaderValue, LOCATION, SET_COOKIE};
use http::{HeaderMap, StatusCode};
use serde_json::json;
use std::collections::BTreeMap;
use std::io::Write;
use tempfile::NamedTempFile;
use url::form_urlencoded;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "0123456789abcdef0123456789abcdef";
const AUTHORIZE: &str =
    "/oauth/authorize?client_id=console&response_type=code&scope=user%3Ainfo&state=st-1";

/// A minimal cookie jar: remembers the last value of every cookie set.
#[derive(Default)]
struct Browser {
    cookies: BTreeMap<String, String>,
}

impl Browser {
    fn absorb(&mut self, response: &FlowResponse) {
        for value in response.headers().get_all(SET_COOKIE) {
            let pair = value.to_str().unwrap().split(';').next().unwrap();
            let (name, value) = pair.split_once('=').unwrap();
            self.cookies.insert(name.to_string(), value.to_string());
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if !self.cookies.is_empty() {
            let cookie = self
                .cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; ");
            headers.insert(COOKIE, HeaderValue::from_str(&cookie).unwrap());
        }
        headers
    }
}

fn location(response: &FlowResponse) -> String {
    response.headers()[LOCATION].to_str().unwrap().to_string()
}

fn query(url: &str) -> BTreeMap<String, String> {
    let query = url.split_once('?').map_or("", |(_, q)| q);
    form_urlencoded::parse(query.as_bytes()).into_owned().collect()
}

fn htpasswd() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "alice:{}", hash_password("wonderland").unwrap()).unwrap();
    file
}

fn broker(htpasswd: &NamedTempFile, idp: &str) -> Broker {
    let config: BrokerConfig = serde_json::from_value(json!({
        "master_public_url": "https://broker.example.com",
        "session": { "secret": SECRET },
        "identity_providers": [
            { "name": "local", "kind": "htpasswd", "file": htpasswd.path() },
            { "name": "sso", "kind": "openid", "client_id": "broker", "client_secret": "s3cret",
              "authorize_url": format!("{idp}/authorize"), "token_url": format!("{idp}/token") }
        ],
        "clients": [
            { "id": "console", "redirect_uris": ["https://console.example.com/cb"] }
        ]
    }))
    .unwrap();
    BrokerBuilder::new(config).build().unwrap()
}

/// Approves the grant prompt the browser was sent to and returns where the
/// approval redirects.
async fn approve(broker: &Broker, browser: &mut Browser, prompt_url: &str) -> String {
    let (_, prompt_query) = prompt_url.split_once('?').unwrap();
    let mut response = new_flow_response();
    let prompt = broker
        .approval
        .prompt(prompt_query, &browser.headers(), &mut response)
        .await
        .unwrap();
    browser.absorb(&response);

    let form = form_urlencoded::Serializer::new(String::new())
        .append_pair("csrf", &prompt.csrf)
        .append_pair("then", &prompt.then)
        .append_pair("client_id", &prompt.client_id)
        .append_pair("scope", &prompt.scopes.join(" "))
        .append_pair("approve", "Allow")
        .finish();
    let mut response = new_flow_response();
    broker
        .approval
        .decide(&form, &browser.headers(), &mut response)
        .await
        .unwrap();
    browser.absorb(&response);
    location(&response)
}

/// Finishes an authorize request for a logged-in browser and redeems the code.
async fn redeem(broker: &Broker, browser: &mut Browser, authorize: &str) -> String {
    let response = broker.authorize.authorize(authorize, &browser.headers()).await;
    browser.absorb(&response);
    let redirect = location(&response);
    assert!(redirect.starts_with("https://console.example.com/cb?code="), "{redirect}");
    let params = query(&redirect);
    assert_eq!(params["state"], "st-1");

    let form = form_urlencoded::Serializer::new(String::new())
        .append_pair("grant_type", "authorization_code")
        .append_pair("client_id", "console")
        .append_pair("redirect_uri", "https://console.example.com/cb")
        .append_pair("code", &params["code"])
        .finish();
    broker
        .authorize
        .token(&form, &HeaderMap::new())
        .await
        .unwrap()
        .access_token
}

#[tokio::test]
async fn test_password_login_flow() {
    let idp = MockServer::start().await;
    let file = htpasswd();
    let broker = broker(&file, &idp.uri());
    let mut browser = Browser::default();

    // Two login providers: the browser gets to choose.
    let response = broker.authorize.authorize(AUTHORIZE, &browser.headers()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let selection: serde_json::Value = serde_json::from_str(response.body()).unwrap();
    let names: Vec<&str> = selection["providers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|p| p["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["local", "sso"]);

    // Picking the password provider leads to its login form.
    let mut response = new_flow_response();
    broker
        .authorize
        .login_provider("local")
        .unwrap()
        .redirector
        .authentication_redirect(AUTHORIZE, &browser.headers(), &mut response)
        .await
        .unwrap();
    let login_url = location(&response);
    assert!(login_url.starts_with("/login/local?then="));

    // A wrong password ends on the error page.
    let form = form_urlencoded::Serializer::new(String::new())
        .append_pair("username", "alice")
        .append_pair("password", "looking-glass")
        .append_pair("then", AUTHORIZE)
        .finish();
    let response = broker.password_logins["local"]
        .login(&form, &browser.headers())
        .await
        .unwrap();
    assert_eq!(location(&response), "/login/error?reason=access_denied");

    let form = form_urlencoded::Serializer::new(String::new())
        .append_pair("username", "alice")
        .append_pair("password", "wonderland")
        .append_pair("then", &query(&login_url)["then"])
        .finish();
    let response = broker.password_logins["local"]
        .login(&form, &browser.headers())
        .await
        .unwrap();
    browser.absorb(&response);
    assert_eq!(location(&response), AUTHORIZE);
    assert!(browser.cookies.contains_key("ssn"));

    // Logged in, but the console was never approved.
    let response = broker.authorize.authorize(AUTHORIZE, &browser.headers()).await;
    let prompt_url = location(&response);
    assert!(prompt_url.starts_with("/oauth/authorize/approve?"));

    let resumed = approve(&broker, &mut browser, &prompt_url).await;
    assert_eq!(resumed, AUTHORIZE);

    let access_token = redeem(&broker, &mut browser, &resumed).await;

    // The code exchange ends the login session.
    let response = broker.authorize.authorize(AUTHORIZE, &browser.headers()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.body().contains("\"providers\""));

    let mut api = HeaderMap::new();
    api.insert(
        http::header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {access_token}")).unwrap(),
    );
    let user = broker.whoami(&api).await.unwrap().unwrap();
    assert_eq!(user.name, "alice");
}

fn id_token(claims: serde_json::Value) -> String {
    format!(
        "{}.{}.signature",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256"}"#),
        URL_SAFE_NO_PAD.encode(claims.to_string())
    )
}

#[tokio::test]
async fn test_openid_login_flow() {
    let idp = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("code=idp-code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "idp-access",
            "token_type": "Bearer",
            "id_token": id_token(json!({
                "sub": "u-42",
                "preferred_username": "bob",
                "email": "bob@example.com"
            }))
        })))
        .mount(&idp)
        .await;

    let file = htpasswd();
    let broker = broker(&file, &idp.uri());
    let mut browser = Browser::default();
    let sso = broker.external_logins["sso"].clone();

    let mut response = new_flow_response();
    sso.authentication_redirect(AUTHORIZE, &browser.headers(), &mut response)
        .await
        .unwrap();
    browser.absorb(&response);
    let provider_url = location(&response);
    assert!(provider_url.starts_with(&format!("{}/authorize?", idp.uri())));
    let provider_params = query(&provider_url);
    assert_eq!(
        provider_params["redirect_uri"],
        "https://broker.example.com/oauth2callback/sso"
    );
    assert_eq!(provider_params["client_id"], "broker");

    // A callback replayed from another browser fails the state check.
    let forged = sso
        .handle_callback(
            &format!("code=idp-code&state={}", provider_params["state"]),
            &HeaderMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(location(&forged), "/login/error?reason=invalid_state");

    let callback = form_urlencoded::Serializer::new(String::new())
        .append_pair("code", "idp-code")
        .append_pair("state", &provider_params["state"])
        .finish();
    let response = sso.handle_callback(&callback, &browser.headers()).await.unwrap();
    browser.absorb(&response);
    assert_eq!(location(&response), AUTHORIZE);

    let response = broker.authorize.authorize(AUTHORIZE, &browser.headers()).await;
    let prompt_url = location(&response);
    let resumed = approve(&broker, &mut browser, &prompt_url).await;
    let access_token = redeem(&broker, &mut browser, &resumed).await;
    assert!(!access_token.is_empty());
}

#[tokio::test]
async fn test_denied_grant_reaches_client() {
    let idp = MockServer::start().await;
    let file = htpasswd();
    let broker = broker(&file, &idp.uri());
    let mut browser = Browser::default();

    let form = form_urlencoded::Serializer::new(String::new())
        .append_pair("username", "alice")
        .append_pair("password", "wonderland")
        .append_pair("then", AUTHORIZE)
        .finish();
    let response = broker.password_logins["local"]
        .login(&form, &browser.headers())
        .await
        .unwrap();
    browser.absorb(&response);

    let response = broker.authorize.authorize(AUTHORIZE, &browser.headers()).await;
    let prompt_url = location(&response);
    let (_, prompt_query) = prompt_url.split_once('?').unwrap();
    let mut response = new_flow_response();
    let prompt = broker
        .approval
        .prompt(prompt_query, &browser.headers(), &mut response)
        .await
        .unwrap();
    browser.absorb(&response);

    let form = form_urlencoded::Serializer::new(String::new())
        .append_pair("csrf", &prompt.csrf)
        .append_pair("then", &prompt.then)
        .append_pair("client_id", "console")
        .append_pair("deny", "Deny")
        .finish();
    let mut response = new_flow_response();
    broker
        .approval
        .decide(&form, &browser.headers(), &mut response)
        .await
        .unwrap();
    assert_eq!(
        location(&response),
        "https://console.example.com/cb?error=access_denied&state=st-1"
    );
}
