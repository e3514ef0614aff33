//! Turns a [`BrokerConfig`] into running authenticators and handlers.

use crate::authorize::{AuthorizeServer, LoginFormRedirector};
use crate::client::ClientRegistry;
use crate::config::{BrokerConfig, ConfigError, IdentityProviderConfig, ProviderConfig};
use crate::grant::{ClientAuthorizationStore, DefaultGrantChecker, InMemoryClientAuthorizationStore};
use crate::grant_handler::{AutoGrant, GrantApproval, PerClientGrant, RedirectGrant};
use crate::login::PasswordLoginHandler;
use crate::tokens::{IssuedTokenAuthenticator, TokenStore};
use broker_auth_core::{
    AuthOutcome, AuthenticationChallenger, AuthenticationErrorHandler, AuthenticationRedirector,
    AuthenticationSuccessHandler, GroupAdder, PasswordAuthenticator, ReasonRedirectErrorHandler,
    RedirectSuccessHandler, RequestAuthenticator, SuccessHandlers, TokenAuthenticator, Union,
    new_caching_authenticator,
};
use broker_identity_core::{
    IdentityMapper, InMemoryUserRegistry, RegistryIdentityMapper, UserRegistry,
};
use broker_identity_local::{
    AllowAnyPasswordAuthenticator, DenyPasswordAuthenticator, HtpasswdAuthenticator, LocalError,
    TokenFileAuthenticator,
};
use broker_identity_oauth2::{
    CookieCsrf, DEFAULT_CSRF_COOKIE, ExternalOAuthHandler, ExternalProvider, GitHubProvider,
    GitLabProvider, GoogleProvider, OAuth2Client, OAuth2Error, OAuthPasswordAuthenticator,
    OpenIdProvider, StateHandler,
};
use broker_identity_remote::{
    BasicAuthPasswordAuthenticator, BindCredentials, HttpClientConfig,
    KeystonePasswordAuthenticator, LdapPasswordAuthenticator, LdapUrl, RemoteError,
    TcpDirectoryClient, build_http_client,
};
use broker_identity_request::{
    BasicAuthChallenger, BasicAuthRequestAuthenticator, BearerTokenAuthenticator,
    RequestHeaderAuthenticator,
};
use broker_identity_session::{SessionAuthenticator, SessionConfig, SessionError, SessionStore};
use http::HeaderMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

const LDAP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Local(#[from] LocalError),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    OAuth2(#[from] OAuth2Error),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Everything the HTTP layer serves.
pub struct Broker {
    pub authorize: AuthorizeServer,
    pub approval: GrantApproval,
    /// Password login forms by provider name.
    pub password_logins: HashMap<String, PasswordLoginHandler>,
    /// External OAuth callbacks by provider name.
    pub external_logins: HashMap<String, Arc<ExternalOAuthHandler>>,
    /// Authenticates API requests carrying bearer tokens.
    pub api_authenticator: Arc<dyn RequestAuthenticator>,
}

impl Broker {
    /// The user behind an API request.
    pub async fn whoami(&self, request: &HeaderMap) -> AuthOutcome {
        self.api_authenticator.authenticate_request(request).await
    }
}

/// The pieces collected while walking the provider list.
#[derive(Default)]
struct Assembly {
    request: Vec<Arc<dyn RequestAuthenticator>>,
    tokens: Vec<Arc<dyn TokenAuthenticator>>,
    challengers: Vec<Arc<dyn AuthenticationChallenger>>,
    login_providers: Vec<(String, Arc<dyn AuthenticationRedirector>)>,
    password_logins: HashMap<String, PasswordLoginHandler>,
    external_logins: HashMap<String, Arc<ExternalOAuthHandler>>,
}

pub struct BrokerBuilder {
    config: BrokerConfig,
    registry: Arc<dyn UserRegistry>,
    authorizations: Arc<dyn ClientAuthorizationStore>,
}

impl BrokerBuilder {
    /// Starts with process-local user and authorization stores.
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            registry: Arc::new(InMemoryUserRegistry::new()),
            authorizations: Arc::new(InMemoryClientAuthorizationStore::new()),
        }
    }

    pub fn with_user_registry(mut self, registry: Arc<dyn UserRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_authorization_store(mut self, store: Arc<dyn ClientAuthorizationStore>) -> Self {
        self.authorizations = store;
        self
    }

    pub fn build(self) -> Result<Broker, BuildError> {
        self.config.validate()?;
        let secure = self.config.master_public_url.starts_with("https://");

        let session_store = SessionStore::new(SessionConfig {
            cookie_name: self.config.session.cookie_name.clone(),
            secret: self.config.session.secret.clone(),
            max_age: Duration::from_secs(self.config.session.max_age_seconds),
            secure,
        })?;
        let session = SessionAuthenticator::new(Arc::new(session_store));
        let csrf = Arc::new(CookieCsrf::new(DEFAULT_CSRF_COOKIE, secure));
        let success: Vec<Arc<dyn AuthenticationSuccessHandler>> =
            vec![Arc::new(session.clone()), Arc::new(RedirectSuccessHandler)];
        let context = FlowContext {
            oauth_client: OAuth2Client::new(build_http_client(&HttpClientConfig::default())?),
            state: StateHandler::new(csrf.clone()),
            success: Arc::new(SuccessHandlers::new(success)),
            errors: Arc::new(ReasonRedirectErrorHandler::new(&self.config.error_url)),
        };

        let tokens = Arc::new(TokenStore::new(
            Duration::from_secs(self.config.tokens.authorize_code_max_age_seconds),
            Duration::from_secs(self.config.tokens.access_token_max_age_seconds),
        ));

        let mut assembly = Assembly::default();
        // The session goes first so a browser that just logged in is not
        // asked for credentials again.
        assembly.request.push(Arc::new(session.clone()));
        assembly.tokens.push(Arc::new(IssuedTokenAuthenticator::new(tokens.clone())));

        for provider in &self.config.identity_providers {
            let mapper: Arc<dyn IdentityMapper> = Arc::new(RegistryIdentityMapper::new(
                self.registry.clone(),
                provider.mapping_method,
            ));
            self.add_provider(provider, mapper, &context, &mut assembly)?;
        }

        let token_union: Arc<dyn TokenAuthenticator> = Arc::new(Union::new(assembly.tokens));
        let api_authenticator: Arc<dyn RequestAuthenticator> =
            Arc::new(BearerTokenAuthenticator::new(new_caching_authenticator(
                token_union,
                self.config.token_cache.ttl(),
                self.config.token_cache.capacity,
            )));

        let clients = Arc::new(ClientRegistry::new(self.config.clients.iter().cloned()));
        let request_union: Arc<dyn RequestAuthenticator> = Arc::new(Union::new(assembly.request));
        let grant_handler = PerClientGrant::new(
            AutoGrant::new(self.authorizations.clone()),
            RedirectGrant::default(),
            self.config.grant.method,
        );

        let mut authorize = AuthorizeServer::new(
            clients.clone(),
            request_union.clone(),
            Arc::new(DefaultGrantChecker::new(self.authorizations.clone())),
            Arc::new(grant_handler),
            tokens,
        )
        .with_finalizer(Arc::new(session));
        for challenger in assembly.challengers {
            authorize = authorize.with_challenger(challenger);
        }
        for (name, redirector) in assembly.login_providers {
            authorize = authorize.with_login_provider(name, redirector);
        }

        info!(
            providers = self.config.identity_providers.len(),
            clients = self.config.clients.len(),
            "identity broker assembled"
        );

        Ok(Broker {
            authorize,
            approval: GrantApproval::new(clients, request_union, csrf, self.authorizations.clone()),
            password_logins: assembly.password_logins,
            external_logins: assembly.external_logins,
            api_authenticator,
        })
    }

    fn add_provider(
        &self,
        provider: &IdentityProviderConfig,
        mapper: Arc<dyn IdentityMapper>,
        context: &FlowContext,
        assembly: &mut Assembly,
    ) -> Result<(), BuildError> {
        let name = provider.name.as_str();
        match &provider.provider {
            ProviderConfig::AllowAll => {
                let password = Arc::new(AllowAnyPasswordAuthenticator::new(name, mapper));
                context.add_password(provider, password, provider.login, assembly);
            }
            ProviderConfig::DenyAll => {
                let password = Arc::new(DenyPasswordAuthenticator);
                context.add_password(provider, password, provider.login, assembly);
            }
            ProviderConfig::Htpasswd { file } => {
                let password =
                    Arc::new(HtpasswdAuthenticator::from_file(name, file.clone(), mapper)?);
                context.add_password(provider, password, provider.login, assembly);
            }
            ProviderConfig::TokenFile { file } => {
                assembly.tokens.push(Arc::new(TokenFileAuthenticator::from_file(file)?));
            }
            ProviderConfig::BasicAuth { url, ca_file } => {
                let password = Arc::new(BasicAuthPasswordAuthenticator::new(
                    name,
                    url,
                    &http_config(ca_file),
                    mapper,
                )?);
                context.add_password(provider, password, provider.login, assembly);
            }
            ProviderConfig::Keystone {
                url,
                domain_name,
                use_keystone_identity,
                ca_file,
            } => {
                let password = Arc::new(KeystonePasswordAuthenticator::new(
                    name,
                    url,
                    domain_name.clone(),
                    *use_keystone_identity,
                    &http_config(ca_file),
                    mapper,
                )?);
                context.add_password(provider, password, provider.login, assembly);
            }
            ProviderConfig::Ldap {
                url,
                bind_dn,
                bind_password,
                attributes,
                tls,
            } => {
                let url = LdapUrl::parse(url)?;
                let service_account = match (bind_dn, bind_password) {
                    (Some(dn), Some(password)) => Some(BindCredentials {
                        dn: dn.clone(),
                        password: password.clone(),
                    }),
                    _ => None,
                };
                let client = TcpDirectoryClient::new(&url, service_account, tls, LDAP_TIMEOUT)?;
                let password = Arc::new(LdapPasswordAuthenticator::new(
                    name,
                    url,
                    attributes.clone(),
                    Arc::new(client),
                    mapper,
                ));
                context.add_password(provider, password, provider.login, assembly);
            }
            ProviderConfig::RequestHeader(headers) => {
                let mut authenticator: Arc<dyn RequestAuthenticator> =
                    Arc::new(RequestHeaderAuthenticator::new(name, headers.clone(), mapper));
                if !provider.groups.is_empty() {
                    authenticator =
                        Arc::new(GroupAdder::new(authenticator, provider.groups.clone()));
                }
                assembly.request.push(authenticator);
            }
            ProviderConfig::Github {
                client_id,
                client_secret,
                organizations,
            } => {
                let github = GitHubProvider::new(
                    name,
                    client_id,
                    client_secret,
                    organizations.clone(),
                    context.oauth_client.clone(),
                );
                self.add_external(provider, Arc::new(github), mapper, context, assembly);
            }
            ProviderConfig::Gitlab {
                url,
                client_id,
                client_secret,
            } => {
                let gitlab = GitLabProvider::new(
                    name,
                    url,
                    client_id,
                    client_secret,
                    context.oauth_client.clone(),
                )?;
                self.add_external(provider, Arc::new(gitlab), mapper, context, assembly);
            }
            ProviderConfig::Google {
                client_id,
                client_secret,
                hosted_domain,
            } => {
                let google = GoogleProvider::new(
                    name,
                    client_id,
                    client_secret,
                    hosted_domain.clone(),
                    context.oauth_client.clone(),
                )?;
                self.add_external(provider, Arc::new(google), mapper, context, assembly);
            }
            ProviderConfig::Openid(config) => {
                let openid: Arc<dyn ExternalProvider> = Arc::new(OpenIdProvider::new(
                    name,
                    config.clone(),
                    context.oauth_client.clone(),
                )?);
                if provider.challenge {
                    // CLI clients cannot follow a browser redirect; their
                    // credentials go through the password grant instead.
                    let password = Arc::new(OAuthPasswordAuthenticator::new(
                        openid.clone(),
                        context.oauth_client.clone(),
                        mapper.clone(),
                    ));
                    context.add_password(provider, password, false, assembly);
                }
                self.add_external(provider, openid, mapper, context, assembly);
            }
        }
        Ok(())
    }

    fn add_external(
        &self,
        provider: &IdentityProviderConfig,
        external: Arc<dyn ExternalProvider>,
        mapper: Arc<dyn IdentityMapper>,
        context: &FlowContext,
        assembly: &mut Assembly,
    ) {
        if !provider.login {
            return;
        }
        let handler = Arc::new(ExternalOAuthHandler::new(
            external,
            context.oauth_client.clone(),
            self.config.callback_url(&provider.name),
            context.state.clone(),
            mapper,
            context.success.clone(),
            context.errors.clone(),
        ));
        let redirector: Arc<dyn AuthenticationRedirector> = handler.clone();
        assembly.login_providers.push((provider.name.clone(), redirector));
        assembly.external_logins.insert(provider.name.clone(), handler);
    }
}

/// Collaborators shared by every interactive login.
struct FlowContext {
    oauth_client: OAuth2Client,
    state: StateHandler,
    success: Arc<dyn AuthenticationSuccessHandler>,
    errors: Arc<dyn AuthenticationErrorHandler>,
}

impl FlowContext {
    fn add_password(
        &self,
        provider: &IdentityProviderConfig,
        password: Arc<dyn PasswordAuthenticator>,
        login: bool,
        assembly: &mut Assembly,
    ) {
        if provider.challenge {
            assembly
                .request
                .push(Arc::new(BasicAuthRequestAuthenticator::new(password.clone())));
            assembly
                .challengers
                .push(Arc::new(BasicAuthChallenger::new(provider.name.clone())));
        }
        if login {
            let redirector: Arc<dyn AuthenticationRedirector> =
                Arc::new(LoginFormRedirector::new(format!("/login/{}", provider.name)));
            assembly.login_providers.push((provider.name.clone(), redirector));
            assembly.password_logins.insert(
                provider.name.clone(),
                PasswordLoginHandler::new(password, self.success.clone(), self.errors.clone()),
            );
        }
    }
}

fn http_config(ca_file: &Option<PathBuf>) -> HttpClientConfig {
    HttpClientConfig {
        ca_file: ca_file.clone(),
        ..HttpClientConfig::default()
    }
}
