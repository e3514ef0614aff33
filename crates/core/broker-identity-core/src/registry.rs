//! Persistence of users and identity mappings.

use async_trait::async_trait;
use broker_auth_core::User;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} was modified concurrently")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("Registry backend error: {0}")]
    Backend(String),
}

impl RegistryError {
    /// Whether the failure came from a concurrent writer and the operation
    /// can be retried after re-reading.
    pub fn is_race(&self) -> bool {
        matches!(
            self,
            RegistryError::AlreadyExists(_) | RegistryError::Conflict(_)
        )
    }
}

/// A stored broker user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub name: String,
    pub uid: String,
    /// Keys of the identities mapped to this user.
    #[serde(default)]
    pub identities: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub resource_version: u64,
}

impl UserRecord {
    pub fn to_user(&self) -> User {
        User::new(&self.name, &self.uid).with_groups(self.groups.iter().cloned())
    }

    /// Whether any mapped identity belongs to `provider_name`.
    pub fn has_identity_from(&self, provider_name: &str) -> bool {
        let prefix = format!("{provider_name}:");
        self.identities.iter().any(|key| key.starts_with(&prefix))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub name: String,
    pub uid: String,
}

/// A stored external identity and the user it maps to, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub provider_name: String,
    pub provider_user_name: String,
    #[serde(default)]
    pub extra: HashMap<String, String>,
    pub user: Option<UserRef>,
    #[serde(default)]
    pub resource_version: u64,
}

impl IdentityRecord {
    pub fn key(&self) -> String {
        crate::identity_key(&self.provider_name, &self.provider_user_name)
    }
}

/// Storage for users and identities.
///
/// `create_*` fail with [`RegistryError::AlreadyExists`] when the key is
/// taken. `update_*` fail with [`RegistryError::Conflict`] when the record's
/// `resource_version` is stale. Successful writes return the stored record
/// with its new version.
#[async_trait]
pub trait UserRegistry: Send + Sync {
    async fn get_user(&self, name: &str) -> Result<Option<UserRecord>, RegistryError>;

    async fn create_user(&self, user: UserRecord) -> Result<UserRecord, RegistryError>;

    async fn update_user(&self, user: UserRecord) -> Result<UserRecord, RegistryError>;

    async fn get_identity(&self, key: &str) -> Result<Option<IdentityRecord>, RegistryError>;

    async fn create_identity(
        &self,
        identity: IdentityRecord,
    ) -> Result<IdentityRecord, RegistryError>;

    async fn update_identity(
        &self,
        identity: IdentityRecord,
    ) -> Result<IdentityRecord, RegistryError>;
}

#[derive(Default)]
struct Records {
    users: HashMap<String, UserRecord>,
    identities: HashMap<String, IdentityRecord>,
}

/// Process-local registry.
#[derive(Clone, Default)]
pub struct InMemoryUserRegistry {
    records: Arc<RwLock<Records>>,
}

impl InMemoryUserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn user_count(&self) -> usize {
        self.records.read().await.users.len()
    }
}

fn create<T, F>(
    map: &mut HashMap<String, T>,
    key: String,
    mut record: T,
    version: F,
) -> Result<T, RegistryError>
where
    T: Clone,
    F: Fn(&mut T) -> &mut u64,
{
    if map.contains_key(&key) {
        return Err(RegistryError::AlreadyExists(key));
    }
    *version(&mut record) = 1;
    map.insert(key, record.clone());
    Ok(record)
}

fn update<T, F>(
    map: &mut HashMap<String, T>,
    key: String,
    mut record: T,
    version: F,
) -> Result<T, RegistryError>
where
    T: Clone,
    F: Fn(&mut T) -> &mut u64,
{
    let Some(stored) = map.get_mut(&key) else {
        return Err(RegistryError::NotFound(key));
    };
    let current = *version(stored);
    if *version(&mut record) != current {
        return Err(RegistryError::Conflict(key));
    }
    *version(&mut record) = current + 1;
    *stored = record.clone();
    Ok(record)
}

#[async_trait]
impl UserRegistry for InMemoryUserRegistry {
    async fn get_user(&self, name: &str) -> Result<Option<UserRecord>, RegistryError> {
        Ok(self.records.read().await.users.get(name).cloned())
    }

    async fn create_user(&self, user: UserRecord) -> Result<UserRecord, RegistryError> {
        let mut records = self.records.write().await;
        create(&mut records.users, user.name.clone(), user, |u| {
            &mut u.resource_version
        })
    }

    async fn update_user(&self, user: UserRecord) -> Result<UserRecord, RegistryError> {
        let mut records = self.records.write().await;
        update(&mut records.users, user.name.clone(), user, |u| {
            &mut u.resource_version
        })
    }

    async fn get_identity(&self, key: &str) -> Result<Option<IdentityRecord>, RegistryError> {
        Ok(self.records.read().await.identities.get(key).cloned())
    }

    async fn create_identity(
        &self,
        identity: IdentityRecord,
    ) -> Result<IdentityRecord, RegistryError> {
        let mut records = self.records.write().await;
        create(&mut records.identities, identity.key(), identity, |i| {
            &mut i.resource_version
        })
    }

    async fn update_identity(
        &self,
        identity: IdentityRecord,
    ) -> Result<IdentityRecord, RegistryError> {
        let mut records = self.records.write().await;
        update(&mut records.identities, identity.key(), identity, |i| {
            &mut i.resource_version
        })
    }
}
