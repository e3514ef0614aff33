//! Ordered composition of authenticators.

use crate::{
    AuthError, AuthOutcome, PasswordAuthenticator, RequestAuthenticator, TokenAuthenticator,
};
use async_trait::async_trait;
use http::HeaderMap;
use std::sync::Arc;
use tracing::debug;

/// Tries its members in order and returns the first success.
///
/// Members after a successful one are never consulted, so the order of the
/// list is a priority policy. Failing members are recorded and skipped; when
/// nobody succeeds the recorded failures are returned together.
pub struct Union<A: ?Sized> {
    members: Vec<Arc<A>>,
}

impl<A: ?Sized> Union<A> {
    pub fn new(members: Vec<Arc<A>>) -> Self {
        Self { members }
    }

    pub fn push(&mut self, member: Arc<A>) {
        self.members.push(member);
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

impl<A: ?Sized> Default for Union<A> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

/// Failures collected while walking a union.
#[derive(Default)]
struct Failures(Vec<AuthError>);

impl Failures {
    fn record(&mut self, index: usize, error: AuthError) {
        debug!(member = index, error = %error, "union member failed, trying next");
        self.0.push(error);
    }

    fn finish(self) -> AuthOutcome {
        match AuthError::aggregate(self.0) {
            Some(error) => Err(error),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TokenAuthenticator for Union<dyn TokenAuthenticator> {
    async fn authenticate_token(&self, token: &str) -> AuthOutcome {
        let mut failures = Failures::default();
        for (index, member) in self.members.iter().enumerate() {
            match member.authenticate_token(token).await {
                Ok(Some(user)) => return Ok(Some(user)),
                Ok(None) => {}
                Err(error) => failures.record(index, error),
            }
        }
        failures.finish()
    }
}

#[async_trait]
impl PasswordAuthenticator for Union<dyn PasswordAuthenticator> {
    async fn authenticate_password(&self, username: &str, password: &str) -> AuthOutcome {
        let mut failures = Failures::default();
        for (index, member) in self.members.iter().enumerate() {
            match member.authenticate_password(username, password).await {
                Ok(Some(user)) => return Ok(Some(user)),
                Ok(None) => {}
                Err(error) => failures.record(index, error),
            }
        }
        failures.finish()
    }
}

#[async_trait]
impl RequestAuthenticator for Union<dyn RequestAuthenticator> {
    async fn authenticate_request(&self, headers: &HeaderMap) -> AuthOutcome {
        let mut failures = Failures::default();
        for (index, member) in self.members.iter().enumerate() {
            match member.authenticate_request(headers).await {
                Ok(Some(user)) => return Ok(Some(user)),
                Ok(None) => {}
                Err(error) => failures.record(index, error),
            }
        }
        failures.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::User;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        outcome: AuthOutcome,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(outcome: AuthOutcome) -> Arc<Self> {
            Arc::new(Self {
                outcome,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenAuthenticator for Scripted {
        async fn authenticate_token(&self, _token: &str) -> AuthOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    #[async_trait]
    impl RequestAuthenticator for Scripted {
        async fn authenticate_request(&self, _headers: &HeaderMap) -> AuthOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    #[async_trait]
    impl PasswordAuthenticator for Scripted {
        async fn authenticate_password(&self, _username: &str, _password: &str) -> AuthOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn success(name: &str) -> AuthOutcome {
        Ok(Some(User::new(name, format!("{name}-uid"))))
    }

    #[tokio::test]
    async fn test_first_success_short_circuits() {
        let first = Scripted::new(Ok(None));
        let second = Scripted::new(success("alice"));
        let third = Scripted::new(success("bob"));

        let union: Union<dyn TokenAuthenticator> =
            Union::new(vec![first.clone(), second.clone(), third.clone()]);

        let user = union.authenticate_token("token").await.unwrap().unwrap();
        assert_eq!(user.name, "alice");
        assert_eq!(first.calls(), 1);
        assert_eq!(second.calls(), 1);
        assert_eq!(third.calls(), 0);
    }

    #[tokio::test]
    async fn test_errors_do_not_block_later_members() {
        let broken = Scripted::new(Err(AuthError::Infrastructure("unreachable".to_string())));
        let working = Scripted::new(success("carol"));

        let union: Union<dyn RequestAuthenticator> = Union::new(vec![broken, working]);

        let user = union
            .authenticate_request(&HeaderMap::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.name, "carol");
    }

    #[tokio::test]
    async fn test_all_failures_are_aggregated() {
        let union: Union<dyn TokenAuthenticator> = Union::new(vec![
            Scripted::new(Err(AuthError::Infrastructure("first".to_string()))),
            Scripted::new(Ok(None)),
            Scripted::new(Err(AuthError::Unauthorized("second".to_string()))),
        ]);

        let err = union.authenticate_token("token").await.unwrap_err();
        let text = err.to_string();
        assert!(text.contains("first"), "missing first error in {text}");
        assert!(text.contains("second"), "missing second error in {text}");
    }

    #[tokio::test]
    async fn test_no_opinion_from_anyone_is_not_an_error() {
        let union: Union<dyn PasswordAuthenticator> =
            Union::new(vec![Scripted::new(Ok(None)), Scripted::new(Ok(None))]);

        let outcome = union.authenticate_password("user", "pass").await;
        assert_eq!(outcome, Ok(None));
    }

    #[tokio::test]
    async fn test_empty_union_has_no_opinion() {
        let union: Union<dyn TokenAuthenticator> = Union::default();
        assert!(union.is_empty());
        assert_eq!(union.authenticate_token("anything").await, Ok(None));
    }
}
