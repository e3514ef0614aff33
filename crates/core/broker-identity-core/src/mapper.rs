use crate::{
    ExternalIdentity, IdentityMapper, IdentityRecord, MappingError, MappingMethod, RegistryError,
    UserRecord, UserRef, UserRegistry,
};
use async_trait::async_trait;
use broker_auth_core::User;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const MAX_RACE_RETRIES: usize = 3;
const DEFAULT_MAX_GENERATE_ATTEMPTS: usize = 100;

/// Maps identities onto users stored in a [`UserRegistry`].
///
/// Concurrent first logins of one identity may both try to create the same
/// records; the loser sees `AlreadyExists` or `Conflict` and starts over from
/// a fresh read, where it finds the winner's mapping.
pub struct RegistryIdentityMapper {
    registry: Arc<dyn UserRegistry>,
    method: MappingMethod,
    max_generate_attempts: usize,
}

impl RegistryIdentityMapper {
    pub fn new(registry: Arc<dyn UserRegistry>, method: MappingMethod) -> Self {
        Self {
            registry,
            method,
            max_generate_attempts: DEFAULT_MAX_GENERATE_ATTEMPTS,
        }
    }

    pub fn with_max_generate_attempts(mut self, attempts: usize) -> Self {
        self.max_generate_attempts = attempts.max(1);
        self
    }

    async fn try_map(&self, identity: &ExternalIdentity) -> Result<User, MappingError> {
        let key = identity.key();
        let existing = self.registry.get_identity(&key).await?;

        if let Some(user_ref) = existing.as_ref().and_then(|record| record.user.as_ref()) {
            match self.registry.get_user(&user_ref.name).await? {
                Some(user) if user.uid == user_ref.uid => return Ok(user.to_user()),
                _ => debug!(
                    identity = %key,
                    user = %user_ref.name,
                    "identity maps to a missing user"
                ),
            }
        }

        if self.method == MappingMethod::Lookup {
            return Err(MappingError::Lookup(key));
        }

        let user = match self.method {
            MappingMethod::Generate => self.generate_user(identity).await?,
            _ => self.claim_or_create_user(identity).await?,
        };
        self.record_mapping(identity, existing, &user).await?;

        info!(identity = %key, user = %user.name, "mapped identity to user");
        Ok(user.to_user())
    }

    async fn claim_or_create_user(
        &self,
        identity: &ExternalIdentity,
    ) -> Result<UserRecord, MappingError> {
        let key = identity.key();
        let desired = identity.preferred_user_name();

        match self.registry.get_user(desired).await? {
            Some(user) if user.identities.contains(&key) => Ok(user),
            Some(user) => {
                if self.method == MappingMethod::Claim
                    && user.has_identity_from(&identity.provider_name)
                {
                    return Err(MappingError::Claim {
                        identity: key,
                        user: user.name,
                        provider: identity.provider_name.clone(),
                    });
                }
                self.attach(user, key).await
            }
            None => self.create_user(desired, key).await,
        }
    }

    async fn generate_user(&self, identity: &ExternalIdentity) -> Result<UserRecord, MappingError> {
        let key = identity.key();
        let desired = identity.preferred_user_name();

        for attempt in 0..self.max_generate_attempts {
            let candidate = if attempt == 0 {
                desired.to_string()
            } else {
                format!("{desired}{}", attempt + 1)
            };

            match self.registry.get_user(&candidate).await? {
                Some(user) if user.identities.contains(&key) => return Ok(user),
                Some(_) => continue,
                None => match self.create_user(&candidate, key.clone()).await {
                    Err(MappingError::Registry(RegistryError::AlreadyExists(_))) => continue,
                    other => return other,
                },
            }
        }

        Err(MappingError::NameExhausted(desired.to_string()))
    }

    async fn create_user(
        &self,
        name: &str,
        identity_key: String,
    ) -> Result<UserRecord, MappingError> {
        let record = UserRecord {
            name: name.to_string(),
            uid: Uuid::new_v4().to_string(),
            identities: vec![identity_key],
            ..Default::default()
        };
        Ok(self.registry.create_user(record).await?)
    }

    async fn attach(
        &self,
        mut user: UserRecord,
        identity_key: String,
    ) -> Result<UserRecord, MappingError> {
        user.identities.push(identity_key);
        Ok(self.registry.update_user(user).await?)
    }

    async fn record_mapping(
        &self,
        identity: &ExternalIdentity,
        existing: Option<IdentityRecord>,
        user: &UserRecord,
    ) -> Result<(), MappingError> {
        let user_ref = UserRef {
            name: user.name.clone(),
            uid: user.uid.clone(),
        };

        match existing {
            Some(mut record) => {
                record.extra = identity.extra.clone();
                record.user = Some(user_ref);
                self.registry.update_identity(record).await?;
            }
            None => {
                let record = IdentityRecord {
                    provider_name: identity.provider_name.clone(),
                    provider_user_name: identity.provider_user_name.clone(),
                    extra: identity.extra.clone(),
                    user: Some(user_ref),
                    resource_version: 0,
                };
                self.registry.create_identity(record).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityMapper for RegistryIdentityMapper {
    async fn user_for(&self, identity: &ExternalIdentity) -> Result<User, MappingError> {
        let mut attempt = 1;
        loop {
            match self.try_map(identity).await {
                Err(MappingError::Registry(err)) if err.is_race() && attempt < MAX_RACE_RETRIES => {
                    debug!(
                        identity = %identity.key(),
                        error = %err,
                        attempt,
                        "retrying identity mapping after concurrent write"
                    );
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EXTRA_PREFERRED_USERNAME, InMemoryUserRegistry};

    fn mapper(registry: &InMemoryUserRegistry, method: MappingMethod) -> RegistryIdentityMapper {
        RegistryIdentityMapper::new(Arc::new(registry.clone()), method)
    }

    /// A github identity that wants the user name `sam`.
    fn sam(provider_user_name: &str) -> ExternalIdentity {
        ExternalIdentity::new("github", provider_user_name)
            .with_extra(EXTRA_PREFERRED_USERNAME, "sam")
    }

    #[tokio::test]
    async fn test_mapping_is_idempotent() {
        let registry = InMemoryUserRegistry::new();
        let mapper = mapper(&registry, MappingMethod::Claim);
        let identity =
            ExternalIdentity::new("github", "42").with_extra(EXTRA_PREFERRED_USERNAME, "octocat");

        let first = mapper.user_for(&identity).await.unwrap();
        let second = mapper.user_for(&identity).await.unwrap();

        assert_eq!(first.name, "octocat");
        assert_eq!(first, second);
        assert_eq!(registry.user_count().await, 1);
    }

    #[tokio::test]
    async fn test_lookup_requires_existing_mapping() {
        let registry = InMemoryUserRegistry::new();
        let identity = ExternalIdentity::new("ldap", "alice");

        let err = mapper(&registry, MappingMethod::Lookup)
            .user_for(&identity)
            .await
            .unwrap_err();
        assert!(matches!(err, MappingError::Lookup(_)));

        let created = mapper(&registry, MappingMethod::Claim)
            .user_for(&identity)
            .await
            .unwrap();
        let found = mapper(&registry, MappingMethod::Lookup)
            .user_for(&identity)
            .await
            .unwrap();
        assert_eq!(created, found);
    }

    #[tokio::test]
    async fn test_one_user_can_hold_identities_from_several_providers() {
        let registry = InMemoryUserRegistry::new();
        let mapper = mapper(&registry, MappingMethod::Claim);

        let from_ldap = mapper.user_for(&ExternalIdentity::new("ldap", "alice")).await.unwrap();
        let from_htpasswd = mapper
            .user_for(&ExternalIdentity::new("htpasswd", "alice"))
            .await
            .unwrap();

        assert_eq!(from_ldap, from_htpasswd);
        let record = registry.get_user("alice").await.unwrap().unwrap();
        assert_eq!(record.identities, vec!["ldap:alice", "htpasswd:alice"]);
    }

    #[tokio::test]
    async fn test_claim_refuses_second_identity_of_same_provider() {
        let registry = InMemoryUserRegistry::new();
        let mapper = mapper(&registry, MappingMethod::Claim);

        mapper
            .user_for(&sam("1"))
            .await
            .unwrap();
        let err = mapper
            .user_for(&sam("2"))
            .await
            .unwrap_err();

        assert!(matches!(err, MappingError::Claim { .. }));
    }

    #[tokio::test]
    async fn test_add_allows_second_identity_of_same_provider() {
        let registry = InMemoryUserRegistry::new();
        let mapper = mapper(&registry, MappingMethod::Add);

        let first = mapper
            .user_for(&sam("1"))
            .await
            .unwrap();
        let second = mapper
            .user_for(&sam("2"))
            .await
            .unwrap();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_generate_picks_next_free_name() {
        let registry = InMemoryUserRegistry::new();
        let mapper = mapper(&registry, MappingMethod::Generate);

        let first = mapper.user_for(&ExternalIdentity::new("gitlab", "jo")).await.unwrap();
        let second = mapper.user_for(&ExternalIdentity::new("github", "jo")).await.unwrap();
        let third = mapper.user_for(&ExternalIdentity::new("google", "jo")).await.unwrap();

        assert_eq!(first.name, "jo");
        assert_eq!(second.name, "jo2");
        assert_eq!(third.name, "jo3");
        assert_ne!(first.uid, second.uid);
    }

    #[tokio::test]
    async fn test_generate_gives_up_after_bounded_attempts() {
        let registry = InMemoryUserRegistry::new();
        let mapper = mapper(&registry, MappingMethod::Generate).with_max_generate_attempts(2);

        mapper.user_for(&ExternalIdentity::new("a", "kim")).await.unwrap();
        mapper.user_for(&ExternalIdentity::new("b", "kim")).await.unwrap();
        let err = mapper.user_for(&ExternalIdentity::new("c", "kim")).await.unwrap_err();

        assert!(matches!(err, MappingError::NameExhausted(_)));
    }

    #[tokio::test]
    async fn test_concurrent_first_logins_agree() {
        let registry = InMemoryUserRegistry::new();
        let mapper = Arc::new(mapper(&registry, MappingMethod::Claim));
        let identity = ExternalIdentity::new("openid", "sub-1");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let mapper = mapper.clone();
                let identity = identity.clone();
                tokio::spawn(async move { mapper.user_for(&identity).await })
            })
            .collect();

        let mut uids = Vec::new();
        for handle in handles {
            uids.push(handle.await.unwrap().unwrap().uid);
        }
        uids.dedup();
        assert_eq!(uids.len(), 1);
        assert_eq!(registry.user_count().await, 1);
    }
}
