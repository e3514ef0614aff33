use crate::{AuthOutcome, RequestAuthenticator};
use async_trait::async_trait;
use http::HeaderMap;
use std::sync::Arc;

/// Appends a fixed set of groups to every user its inner authenticator accepts.
///
/// Groups the user already has are not duplicated. Nothing else on the user
/// is touched.
pub struct GroupAdder {
    inner: Arc<dyn RequestAuthenticator>,
    groups: Vec<String>,
}

impl GroupAdder {
    pub fn new(inner: Arc<dyn RequestAuthenticator>, groups: Vec<String>) -> Self {
        Self { inner, groups }
    }
}

#[async_trait]
impl RequestAuthenticator for GroupAdder {
    async fn authenticate_request(&self, headers: &HeaderMap) -> AuthOutcome {
        let Some(mut user) = self.inner.authenticate_request(headers).await? else {
            return Ok(None);
        };

        for group in &self.groups {
            if !user.groups.contains(group) {
                user.groups.push(group.clone());
            }
        }
        Ok(Some(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AuthError, User};

    struct Fixed(AuthOutcome);

    #[async_trait]
    impl RequestAuthenticator for Fixed {
        async fn authenticate_request(&self, _headers: &HeaderMap) -> AuthOutcome {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_groups_are_appended() {
        let inner = Arc::new(Fixed(Ok(Some(
            User::new("alice", "1").with_groups(["developers"]),
        ))));
        let adder = GroupAdder::new(
            inner,
            vec!["system:authenticated".to_string(), "developers".to_string()],
        );

        let user = adder
            .authenticate_request(&HeaderMap::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.groups, vec!["developers", "system:authenticated"]);
        assert_eq!(user.name, "alice");
    }

    #[tokio::test]
    async fn test_failures_pass_through() {
        let adder = GroupAdder::new(
            Arc::new(Fixed(Err(AuthError::TokenExpired))),
            vec!["g".to_string()],
        );
        assert_eq!(
            adder.authenticate_request(&HeaderMap::new()).await,
            Err(AuthError::TokenExpired)
        );

        let adder = GroupAdder::new(Arc::new(Fixed(Ok(None))), vec!["g".to_string()]);
        assert_eq!(adder.authenticate_request(&HeaderMap::new()).await, Ok(None));
    }
}
