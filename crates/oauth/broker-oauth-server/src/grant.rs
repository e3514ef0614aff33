//! Records of which users have authorized which clients.

use crate::client::OAuthClient;
use crate::error::StoreError;
use async_trait::async_trait;
use broker_auth_core::User;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

const MAX_RECORD_ATTEMPTS: usize = 5;

/// What an authorize request asks the user to allow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grant {
    pub client: OAuthClient,
    pub scopes: Vec<String>,
    pub redirect_uri: String,
}

/// Splits a space separated `scope` parameter, dropping duplicates.
pub fn parse_scopes(scope: &str) -> Vec<String> {
    let mut scopes: Vec<String> = Vec::new();
    for scope in scope.split_whitespace() {
        if !scopes.iter().any(|s| s == scope) {
            scopes.push(scope.to_string());
        }
    }
    scopes
}

/// A user's standing approval of a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientAuthorization {
    pub user_name: String,
    /// The uid of the user when the approval was given. A user that was
    /// deleted and recreated under the same name does not inherit it.
    pub user_uid: String,
    pub client_id: String,
    pub scopes: Vec<String>,
    pub resource_version: u64,
}

impl ClientAuthorization {
    pub fn covers(&self, scopes: &[String]) -> bool {
        scopes.iter().all(|scope| self.scopes.contains(scope))
    }

    /// Adds missing scopes; returns whether anything changed.
    fn merge_scopes(&mut self, scopes: &[String]) -> bool {
        let mut changed = false;
        for scope in scopes {
            if !self.scopes.contains(scope) {
                self.scopes.push(scope.clone());
                changed = true;
            }
        }
        changed
    }
}

/// Storage for [`ClientAuthorization`]s keyed by user name and client id.
///
/// `create` fails with [`StoreError::AlreadyExists`] when the pair is taken
/// and `update` fails with [`StoreError::Conflict`] on a stale
/// `resource_version`.
#[async_trait]
pub trait ClientAuthorizationStore: Send + Sync {
    async fn get(
        &self,
        user_name: &str,
        client_id: &str,
    ) -> Result<Option<ClientAuthorization>, StoreError>;

    async fn create(
        &self,
        authorization: ClientAuthorization,
    ) -> Result<ClientAuthorization, StoreError>;

    async fn update(
        &self,
        authorization: ClientAuthorization,
    ) -> Result<ClientAuthorization, StoreError>;
}

fn authorization_key(user_name: &str, client_id: &str) -> String {
    format!("{user_name}:{client_id}")
}

/// Process-local authorization store.
#[derive(Clone, Default)]
pub struct InMemoryClientAuthorizationStore {
    authorizations: Arc<RwLock<HashMap<String, ClientAuthorization>>>,
}

impl InMemoryClientAuthorizationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClientAuthorizationStore for InMemoryClientAuthorizationStore {
    async fn get(
        &self,
        user_name: &str,
        client_id: &str,
    ) -> Result<Option<ClientAuthorization>, StoreError> {
        let key = authorization_key(user_name, client_id);
        Ok(self.authorizations.read().await.get(&key).cloned())
    }

    async fn create(
        &self,
        mut authorization: ClientAuthorization,
    ) -> Result<ClientAuthorization, StoreError> {
        let key = authorization_key(&authorization.user_name, &authorization.client_id);
        let mut authorizations = self.authorizations.write().await;
        if authorizations.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        authorization.resource_version = 1;
        authorizations.insert(key, authorization.clone());
        Ok(authorization)
    }

    async fn update(
        &self,
        mut authorization: ClientAuthorization,
    ) -> Result<ClientAuthorization, StoreError> {
        let key = authorization_key(&authorization.user_name, &authorization.client_id);
        let mut authorizations = self.authorizations.write().await;
        let Some(stored) = authorizations.get_mut(&key) else {
            return Err(StoreError::Conflict(key));
        };
        if stored.resource_version != authorization.resource_version {
            return Err(StoreError::Conflict(key));
        }
        authorization.resource_version += 1;
        *stored = authorization.clone();
        Ok(authorization)
    }
}

async fn try_record(
    store: &dyn ClientAuthorizationStore,
    user: &User,
    client_id: &str,
    scopes: &[String],
) -> Result<ClientAuthorization, StoreError> {
    match store.get(&user.name, client_id).await? {
        None => {
            store
                .create(ClientAuthorization {
                    user_name: user.name.clone(),
                    user_uid: user.uid.clone(),
                    client_id: client_id.to_string(),
                    scopes: scopes.to_vec(),
                    resource_version: 0,
                })
                .await
        }
        Some(mut existing) if existing.user_uid != user.uid => {
            debug!(
                user = %user.name,
                client = client_id,
                "replacing authorization of a previous user with the same name"
            );
            existing.user_uid = user.uid.clone();
            existing.scopes = scopes.to_vec();
            store.update(existing).await
        }
        Some(mut existing) => {
            if existing.merge_scopes(scopes) {
                store.update(existing).await
            } else {
                Ok(existing)
            }
        }
    }
}

/// Records that `user` approved `scopes` for `client_id`, merging them into
/// any earlier approval. Concurrent writers are resolved by re-reading and
/// merging again.
pub async fn record_authorization(
    store: &dyn ClientAuthorizationStore,
    user: &User,
    client_id: &str,
    scopes: &[String],
) -> Result<ClientAuthorization, StoreError> {
    let mut attempt = 1;
    loop {
        match try_record(store, user, client_id, scopes).await {
            Err(err) if err.is_race() && attempt < MAX_RECORD_ATTEMPTS => {
                debug!(
                    user = %user.name,
                    client = client_id,
                    error = %err,
                    attempt,
                    "retrying authorization write"
                );
                attempt += 1;
            }
            Ok(authorization) => {
                info!(
                    user = %user.name,
                    client = client_id,
                    scopes = ?authorization.scopes,
                    "recorded client authorization"
                );
                return Ok(authorization);
            }
            Err(err) => return Err(err),
        }
    }
}

/// Decides whether a user has already authorized a grant.
#[async_trait]
pub trait GrantChecker: Send + Sync {
    async fn has_authorized_client(&self, user: &User, grant: &Grant) -> Result<bool, StoreError>;
}

/// Looks for a recorded authorization covering every requested scope.
#[derive(Clone)]
pub struct DefaultGrantChecker {
    store: Arc<dyn ClientAuthorizationStore>,
}

impl DefaultGrantChecker {
    pub fn new(store: Arc<dyn ClientAuthorizationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl GrantChecker for DefaultGrantChecker {
    async fn has_authorized_client(&self, user: &User, grant: &Grant) -> Result<bool, StoreError> {
        let Some(authorization) = self.store.get(&user.name, &grant.client.id).await? else {
            return Ok(false);
        };
        if authorization.user_uid != user.uid {
            debug!(
                user = %user.name,
                client = %grant.client.id,
                "authorization belongs to a different uid"
            );
            return Ok(false);
        }
        Ok(authorization.covers(&grant.scopes))
    }
}
