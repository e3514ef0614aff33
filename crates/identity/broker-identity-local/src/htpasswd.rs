//! Password authentication against an htpasswd file.

use crate::LocalError;
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use broker_auth_core::{AuthError, AuthOutcome, PasswordAuthenticator};
use broker_identity_core::{ExternalIdentity, IdentityMapper};
use rand_core::OsRng;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

// Argon2 hash of "dummy_password", verified for unknown users so that they
// take as long to reject as wrong passwords.
const DUMMY_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$9QsJRKgzJkKaOUvlp7gl2Q$qmE3qIFBNJ6nZYbLYXEI2uo0zZc7T0Q8LU1ZsqsZ3QE";

const MAX_CONCURRENT_VERIFICATIONS: usize = 5;

/// Hashes `password` into an argon2id PHC string suitable for an htpasswd line.
pub fn hash_password(password: &str) -> Result<String, LocalError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| LocalError::Hash(e.to_string()))
}

fn verify_hash(password: &str, hash: &str) -> bool {
    if hash.starts_with("$2a$") || hash.starts_with("$2b$") || hash.starts_with("$2y$") {
        return bcrypt::verify(password, hash).unwrap_or(false);
    }

    if hash.starts_with("$argon2") {
        return PasswordHash::new(hash)
            .map(|parsed| {
                Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false);
    }

    if let Some(expected) = hash.strip_prefix("{SHA}") {
        let digest = Sha1::digest(password.as_bytes());
        return STANDARD
            .encode(digest)
            .as_bytes()
            .ct_eq(expected.as_bytes())
            .into();
    }

    warn!("unsupported htpasswd hash format");
    false
}

fn parse(path: &Path, contents: &str) -> Result<HashMap<String, String>, LocalError> {
    let mut entries = HashMap::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((user, hash)) = line.split_once(':') else {
            return Err(LocalError::Parse {
                path: path.to_path_buf(),
                line: index + 1,
                message: "expected user:hash".to_string(),
            });
        };
        if user.is_empty() || hash.is_empty() {
            return Err(LocalError::Parse {
                path: path.to_path_buf(),
                line: index + 1,
                message: "empty user name or hash".to_string(),
            });
        }
        entries.insert(user.to_string(), hash.to_string());
    }
    Ok(entries)
}

/// Verifies passwords against `user:hash` lines and maps successful logins
/// through an [`IdentityMapper`].
///
/// Supported hashes are bcrypt, argon2 and `{SHA}`. A wrong password and an
/// unknown user are indistinguishable to the caller.
pub struct HtpasswdAuthenticator {
    provider_name: String,
    path: PathBuf,
    entries: RwLock<HashMap<String, String>>,
    mapper: Arc<dyn IdentityMapper>,
    semaphore: Semaphore,
}

impl HtpasswdAuthenticator {
    pub fn from_file(
        provider_name: impl Into<String>,
        path: impl Into<PathBuf>,
        mapper: Arc<dyn IdentityMapper>,
    ) -> Result<Self, LocalError> {
        let path = path.into();
        let contents = std::fs::read_to_string(&path).map_err(|source| LocalError::Io {
            path: path.clone(),
            source,
        })?;
        let entries = parse(&path, &contents)?;

        let provider_name = provider_name.into();
        info!(
            provider = %provider_name,
            path = %path.display(),
            users = entries.len(),
            "loaded htpasswd file"
        );

        Ok(Self {
            provider_name,
            path,
            entries: RwLock::new(entries),
            mapper,
            semaphore: Semaphore::new(MAX_CONCURRENT_VERIFICATIONS),
        })
    }

    /// Re-reads the file. On failure the previously loaded entries are kept.
    pub async fn reload(&self) -> Result<usize, LocalError> {
        let contents =
            tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|source| LocalError::Io {
                    path: self.path.clone(),
                    source,
                })?;
        let entries = parse(&self.path, &contents)?;
        let count = entries.len();
        *self.entries.write().await = entries;
        Ok(count)
    }

    async fn verify(&self, username: &str, password: &str) -> Result<bool, AuthError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|e| AuthError::Infrastructure(e.to_string()))?;
        let entries = self.entries.read().await;

        let (user_exists, hash) = match entries.get(username) {
            Some(hash) => (true, hash.as_str()),
            None => (false, DUMMY_HASH),
        };
        let password_valid = verify_hash(password, hash);

        Ok(user_exists && password_valid)
    }
}

#[async_trait]
impl PasswordAuthenticator for HtpasswdAuthenticator {
    async fn authenticate_password(&self, username: &str, password: &str) -> AuthOutcome {
        if !self.verify(username, password).await? {
            debug!(provider = %self.provider_name, "htpasswd login rejected");
            return Ok(None);
        }

        let identity = ExternalIdentity::new(&self.provider_name, username);
        Ok(Some(self.mapper.user_for(&identity).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_identity_core::{InMemoryUserRegistry, MappingMethod, RegistryIdentityMapper};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn mapper() -> Arc<dyn IdentityMapper> {
        Arc::new(RegistryIdentityMapper::new(
            Arc::new(InMemoryUserRegistry::new()),
            MappingMethod::Claim,
        ))
    }

    fn htpasswd_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn setup() -> (NamedTempFile, HtpasswdAuthenticator) {
        let argon = hash_password("password123").unwrap();
        let bcrypt = bcrypt::hash("supersecret", 4).unwrap();
        // {SHA} of "password"
        let sha = "{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=";

        let file = htpasswd_file(&format!(
            "# test users\n\ntestuser:{argon}\nalice:{bcrypt}\nlegacy:{sha}\n"
        ));
        let auth = HtpasswdAuthenticator::from_file("htpasswd", file.path(), mapper()).unwrap();
        (file, auth)
    }

    #[tokio::test]
    async fn test_all_hash_formats_verify() {
        let (_file, auth) = setup();

        let user = auth
            .authenticate_password("testuser", "password123")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.name, "testuser");

        assert!(
            auth.authenticate_password("alice", "supersecret")
                .await
                .unwrap()
                .is_some()
        );
        assert!(
            auth.authenticate_password("legacy", "password")
                .await
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_sha_hash_verification() {
        let hash = "{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g=";
        assert!(verify_hash("password", hash));
        assert!(!verify_hash("Password", hash));
        assert!(!verify_hash("password", "{SHA}W6ph5Mm5Pz8GgiULbPgzG37mj9g"));
        assert!(!verify_hash("password", "{SHA}"));
    }

    #[tokio::test]
    async fn test_wrong_password_and_unknown_user_look_the_same() {
        let (_file, auth) = setup();

        let wrong = auth.authenticate_password("testuser", "wrong").await;
        let unknown = auth.authenticate_password("nobody", "password123").await;

        assert_eq!(wrong, Ok(None));
        assert_eq!(unknown, Ok(None));
    }

    #[tokio::test]
    async fn test_malformed_line_fails_load() {
        let file = htpasswd_file("good:{SHA}abc\nbroken-line\n");
        let err = HtpasswdAuthenticator::from_file("htpasswd", file.path(), mapper())
            .err()
            .unwrap();
        assert!(matches!(err, LocalError::Parse { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_missing_file_fails_load() {
        let result =
            HtpasswdAuthenticator::from_file("htpasswd", "/nonexistent/htpasswd", mapper());
        assert!(matches!(result, Err(LocalError::Io { .. })));
    }

    #[tokio::test]
    async fn test_reload_picks_up_new_users() {
        let (file, auth) = setup();
        assert_eq!(auth.authenticate_password("bob", "pw").await, Ok(None));

        let line = format!("bob:{}\n", hash_password("pw").unwrap());
        std::fs::OpenOptions::new()
            .append(true)
            .open(file.path())
            .unwrap()
            .write_all(line.as_bytes())
            .unwrap();

        assert_eq!(auth.reload().await.unwrap(), 4);
        assert!(auth.authenticate_password("bob", "pw").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_concurrent_verifications() {
        let (_file, auth) = setup();
        let auth = Arc::new(auth);

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let auth = auth.clone();
                tokio::spawn(async move {
                    let password = if i % 2 == 0 {
                        "password123".to_string()
                    } else {
                        format!("wrong{i}")
                    };
                    auth.authenticate_password("testuser", &password).await
                })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 5);
    }

    #[cfg(feature = "timing-tests")]
    #[tokio::test]
    async fn test_timing_attack_resistance() {
        use std::time::{Duration, Instant};

        let (_file, auth) = setup();
        const ATTEMPTS: u32 = 10;

        let mut unknown = Duration::ZERO;
        let mut wrong = Duration::ZERO;
        for i in 0..ATTEMPTS {
            let start = Instant::now();
            let _ = auth.authenticate_password(&format!("nobody{i}"), "pw").await;
            unknown += start.elapsed();

            let start = Instant::now();
            let _ = auth.authenticate_password("testuser", &format!("pw{i}")).await;
            wrong += start.elapsed();
        }

        let diff = (unknown / ATTEMPTS).abs_diff(wrong / ATTEMPTS);
        assert!(diff < Duration::from_millis(50), "timing difference too large: {diff:?}");
    }
}
